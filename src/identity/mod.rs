//! Sender identity: address normalization, roles, and alias resolution.
//!
//! A chat channel reports the same human under several address forms
//! (`0812…`, `+62 812…`, `62812…:7@s.whatsapp.net`). Those normalize by
//! syntax to one canonical digit string. Linked-device aliases (`…@lid`)
//! cannot be normalized and are resolved through [`resolver::IdentityResolver`].

pub mod resolver;

pub use resolver::{IdentityResolver, RejectReason, ResolvedIdentity, VerificationOutcome};

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Domain suffix marking a linked-device alias.
const ALIAS_DOMAIN: &str = "lid";

/// Staff levels, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Operator,
    Manager,
    Admin,
    Owner,
}

impl StaffRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Manager => "manager",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }
}

impl std::fmt::Display for StaffRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StaffRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "operator" | "staff" | "sales" => Ok(Self::Operator),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(format!("unknown staff role: {other}")),
        }
    }
}

/// Role of a participant within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "level")]
pub enum Role {
    Staff(StaffRole),
    Customer,
}

impl Role {
    pub fn is_staff(&self) -> bool {
        matches!(self, Self::Staff(_))
    }

    pub fn staff_level(&self) -> Option<StaffRole> {
        match self {
            Self::Staff(level) => Some(*level),
            Self::Customer => None,
        }
    }

    /// Whether this role meets a minimum staff level.
    pub fn at_least(&self, required: StaffRole) -> bool {
        self.staff_level().is_some_and(|level| level >= required)
    }

    /// Short tag stored on message records.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Staff(_) => "staff",
            Self::Customer => "customer",
        }
    }
}

/// A raw sender address after syntactic parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAddress {
    /// Normalized canonical digit string.
    Canonical(String),
    /// Linked-device alias; holds the alias key (digits, no domain).
    Alias(String),
}

impl ParsedAddress {
    /// Key used for conversation lookup and dedup.
    pub fn key(&self) -> &str {
        match self {
            Self::Canonical(c) => c,
            Self::Alias(a) => a,
        }
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, Self::Alias(_))
    }
}

/// Parse a raw channel address.
///
/// Strips transport domains (`@s.whatsapp.net`), device-session suffixes
/// (`:12`), and punctuation; rewrites a leading trunk prefix to the country
/// code. Returns `None` when no digits remain.
pub fn parse_address(raw: &str, country_code: &str, trunk_prefix: &str) -> Option<ParsedAddress> {
    let trimmed = raw.trim();
    let (local, domain) = match trimmed.split_once('@') {
        Some((local, domain)) => (local, Some(domain.trim().to_lowercase())),
        None => (trimmed, None),
    };

    // Device-session suffix: "62812…:12"
    let local = local.split(':').next().unwrap_or(local);
    let digits: String = local.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    if domain.as_deref() == Some(ALIAS_DOMAIN) {
        return Some(ParsedAddress::Alias(format!("{digits}@{ALIAS_DOMAIN}")));
    }

    let canonical = match digits.strip_prefix(trunk_prefix) {
        Some(rest) if !trunk_prefix.is_empty() && !local.trim_start().starts_with('+') => {
            format!("{country_code}{rest}")
        }
        _ => digits,
    };
    Some(ParsedAddress::Canonical(canonical))
}

/// Normalize an address that must be canonical (aliases yield `None`).
pub fn normalize_address(raw: &str, country_code: &str, trunk_prefix: &str) -> Option<String> {
    match parse_address(raw, country_code, trunk_prefix)? {
        ParsedAddress::Canonical(c) => Some(c),
        ParsedAddress::Alias(_) => None,
    }
}
