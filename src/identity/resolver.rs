//! Identity resolver: canonical/alias resolution, verification, role cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::IdentityConfig;
use crate::error::DatabaseError;
use crate::identity::{ParsedAddress, Role, StaffRole, normalize_address, parse_address};
use crate::store::{AliasLink, LinkSource, Storage};

/// Outcome of resolving one inbound sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Conversation key: the canonical address, or the alias key.
    pub participant: String,
    /// Canonical identity, when known.
    pub canonical: Option<String>,
    pub is_alias: bool,
    pub role: Role,
    /// How an alias was linked to `canonical`.
    pub link: Option<LinkSource>,
}

/// Why a verification claim was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The claimed address does not parse as a canonical address.
    InvalidAddress,
    /// The claimed address is not a registered staff identity.
    NotRegisteredStaff,
    /// The sender is itself a canonical address different from the claim.
    NotAnAlias,
    /// The alias is already verified as a different identity.
    AliasBoundElsewhere { canonical: String },
    /// The identity already has a verified alias and this one is not on
    /// its confirmed alias list.
    NeedsConfirmation { canonical: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddress => f.write_str("invalid address"),
            Self::NotRegisteredStaff => f.write_str("not a registered staff identity"),
            Self::NotAnAlias => f.write_str("sender is a different canonical address"),
            Self::AliasBoundElsewhere { canonical } => {
                write!(f, "alias already verified as {canonical}")
            }
            Self::NeedsConfirmation { canonical } => {
                write!(f, "{canonical} already has a verified device")
            }
        }
    }
}

/// Result of a `/verify` claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Link persisted; the conversation may be upgraded.
    Verified { canonical: String, role: StaffRole },
    /// The sender already is (or is already linked to) the claimed identity.
    AlreadyVerified { canonical: String, role: StaffRole },
    Rejected(RejectReason),
}

/// Snapshot of a tenant's staff registry.
struct CachedRegistry {
    roles: HashMap<String, StaffRole>,
    fetched_at: Instant,
}

/// Resolves raw sender addresses to identities and roles.
///
/// The per-tenant registry cache is advisory: positive hits are used
/// directly, while a miss or a negative is always re-checked against the
/// registry before it is trusted.
pub struct IdentityResolver {
    store: Arc<dyn Storage>,
    config: IdentityConfig,
    cache: RwLock<HashMap<String, CachedRegistry>>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Storage>, config: IdentityConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Parse a raw address with the configured country code and trunk prefix.
    pub fn parse(&self, raw: &str) -> Option<ParsedAddress> {
        parse_address(raw, &self.config.country_code, &self.config.trunk_prefix)
    }

    /// Normalize an address that must be canonical.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        normalize_address(raw, &self.config.country_code, &self.config.trunk_prefix)
    }

    /// Resolve a parsed sender on a channel account to an identity and role.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        channel_account: &str,
        sender: &ParsedAddress,
    ) -> Result<ResolvedIdentity, DatabaseError> {
        match sender {
            ParsedAddress::Canonical(canonical) => {
                let role = self.role_of(tenant_id, canonical).await?;
                Ok(ResolvedIdentity {
                    participant: canonical.clone(),
                    canonical: Some(canonical.clone()),
                    is_alias: false,
                    role: role.map_or(Role::Customer, Role::Staff),
                    link: None,
                })
            }
            ParsedAddress::Alias(alias) => {
                self.resolve_alias(tenant_id, channel_account, alias).await
            }
        }
    }

    async fn resolve_alias(
        &self,
        tenant_id: &str,
        channel_account: &str,
        alias: &str,
    ) -> Result<ResolvedIdentity, DatabaseError> {
        let unresolved = ResolvedIdentity {
            participant: alias.to_string(),
            canonical: None,
            is_alias: true,
            role: Role::Customer,
            link: None,
        };

        // (a) persisted link
        if let Some(link) = self.store.find_alias_link(tenant_id, alias).await? {
            let role = self.role_of(tenant_id, &link.canonical).await?;
            debug!(alias = %alias, canonical = %link.canonical, source = link.source.as_str(), "Alias resolved from link");
            return Ok(ResolvedIdentity {
                canonical: Some(link.canonical),
                role: role.map_or(Role::Customer, Role::Staff),
                link: Some(link.source),
                ..unresolved
            });
        }

        // (b) recency heuristic, tightest window first
        let Some(widest) = self.config.recency_windows.iter().max().copied() else {
            return Ok(unresolved);
        };
        let now = Utc::now();
        let since = now - chrono::Duration::from_std(widest).unwrap_or(chrono::Duration::zero());
        let candidates = self
            .store
            .recent_staff_conversations(tenant_id, channel_account, since)
            .await?;

        for window in &self.config.recency_windows {
            let cutoff = now - chrono::Duration::from_std(*window).unwrap_or(chrono::Duration::zero());
            let candidate = candidates.iter().find_map(|conv| {
                if conv.last_message_at < cutoff || conv.participant == alias {
                    return None;
                }
                conv.linked_canonical.clone().or_else(|| {
                    matches!(self.parse(&conv.participant), Some(ParsedAddress::Canonical(_)))
                        .then(|| conv.participant.clone())
                })
            });
            let Some(canonical) = candidate else {
                continue;
            };
            let Some(role) = self.role_of(tenant_id, &canonical).await? else {
                continue;
            };

            self.store
                .save_alias_link(AliasLink {
                    tenant_id: tenant_id.to_string(),
                    alias: alias.to_string(),
                    canonical: canonical.clone(),
                    source: LinkSource::Recency,
                    created_at: now,
                })
                .await?;
            info!(
                alias = %alias,
                canonical = %canonical,
                window_secs = window.as_secs(),
                "Alias tentatively linked by recency"
            );
            return Ok(ResolvedIdentity {
                canonical: Some(canonical),
                role: Role::Staff(role),
                link: Some(LinkSource::Recency),
                ..unresolved
            });
        }

        // (c) unresolved
        debug!(alias = %alias, "Alias unresolved, treating as customer");
        Ok(unresolved)
    }

    /// Check a "I am X" claim from `sender` and persist the link if it holds.
    pub async fn verify_claim(
        &self,
        tenant_id: &str,
        sender: &ParsedAddress,
        claimed_raw: &str,
    ) -> Result<VerificationOutcome, DatabaseError> {
        let Some(claimed) = self.normalize(claimed_raw) else {
            return Ok(VerificationOutcome::Rejected(RejectReason::InvalidAddress));
        };

        // Always a fresh registry check, never the cache.
        let Some(role) = self.store.find_canonical_identity(tenant_id, &claimed).await? else {
            warn!(sender = %sender.key(), claimed = %claimed, "Verification claim for unregistered identity");
            return Ok(VerificationOutcome::Rejected(RejectReason::NotRegisteredStaff));
        };

        let alias = match sender {
            ParsedAddress::Canonical(own) if *own == claimed => {
                return Ok(VerificationOutcome::AlreadyVerified { canonical: claimed, role });
            }
            ParsedAddress::Canonical(_) => {
                return Ok(VerificationOutcome::Rejected(RejectReason::NotAnAlias));
            }
            ParsedAddress::Alias(alias) => alias,
        };

        if let Some(existing) = self.store.find_alias_link(tenant_id, alias).await?
            && existing.source == LinkSource::Verified
        {
            if existing.canonical == claimed {
                return Ok(VerificationOutcome::AlreadyVerified { canonical: claimed, role });
            }
            return Ok(VerificationOutcome::Rejected(RejectReason::AliasBoundElsewhere {
                canonical: existing.canonical,
            }));
        }

        let other_verified = self
            .store
            .list_alias_links(tenant_id, &claimed)
            .await?
            .into_iter()
            .any(|link| link.source == LinkSource::Verified && link.alias != *alias);
        if other_verified {
            let confirmed = self
                .store
                .list_registered_staff(tenant_id)
                .await?
                .into_iter()
                .any(|member| member.address == claimed && member.known_aliases.contains(alias));
            if !confirmed {
                warn!(alias = %alias, canonical = %claimed, "Second device claim needs confirmation");
                return Ok(VerificationOutcome::Rejected(RejectReason::NeedsConfirmation {
                    canonical: claimed,
                }));
            }
        }

        self.store
            .save_alias_link(AliasLink {
                tenant_id: tenant_id.to_string(),
                alias: alias.clone(),
                canonical: claimed.clone(),
                source: LinkSource::Verified,
                created_at: Utc::now(),
            })
            .await?;
        self.remember(tenant_id, &claimed, role).await;
        info!(alias = %alias, canonical = %claimed, role = %role, "Alias verified");

        Ok(VerificationOutcome::Verified { canonical: claimed, role })
    }

    /// Drop a tenant's cached registry snapshot.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.write().await.remove(tenant_id);
    }

    /// Staff level of a canonical identity.
    async fn role_of(
        &self,
        tenant_id: &str,
        canonical: &str,
    ) -> Result<Option<StaffRole>, DatabaseError> {
        let (cached, just_fetched) = self.cached_role(tenant_id, canonical).await?;
        if cached.is_some() || just_fetched {
            return Ok(cached);
        }

        // Negative from an older snapshot: confirm with a point lookup.
        let fresh = self.store.find_canonical_identity(tenant_id, canonical).await?;
        if let Some(role) = fresh {
            self.remember(tenant_id, canonical, role).await;
        }
        Ok(fresh)
    }

    /// Look up the snapshot, refreshing it when missing or expired.
    /// The flag is true when the snapshot was fetched by this call.
    async fn cached_role(
        &self,
        tenant_id: &str,
        canonical: &str,
    ) -> Result<(Option<StaffRole>, bool), DatabaseError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(tenant_id)
                && entry.fetched_at.elapsed() < self.config.cache_ttl
            {
                return Ok((entry.roles.get(canonical).copied(), false));
            }
        }

        let roles: HashMap<String, StaffRole> = self
            .store
            .list_registered_staff(tenant_id)
            .await?
            .into_iter()
            .map(|member| (member.address, member.role))
            .collect();
        debug!(tenant = %tenant_id, staff = roles.len(), "Staff registry cached");
        let role = roles.get(canonical).copied();
        self.cache.write().await.insert(
            tenant_id.to_string(),
            CachedRegistry {
                roles,
                fetched_at: Instant::now(),
            },
        );
        Ok((role, true))
    }

    async fn remember(&self, tenant_id: &str, canonical: &str, role: StaffRole) {
        if let Some(entry) = self.cache.write().await.get_mut(tenant_id) {
            entry.roles.insert(canonical.to_string(), role);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewConversation, StaffMember};

    const TENANT: &str = "t1";
    const ACCOUNT: &str = "6280000000000";
    const MANAGER: &str = "6281234567890";

    async fn setup() -> (Arc<MemoryStore>, IdentityResolver) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_staff(
                TENANT,
                StaffMember {
                    address: MANAGER.into(),
                    role: StaffRole::Manager,
                    name: Some("Budi".into()),
                    known_aliases: vec![],
                },
            )
            .await
            .unwrap();
        let resolver = IdentityResolver::new(store.clone(), IdentityConfig::default());
        (store, resolver)
    }

    #[tokio::test]
    async fn canonical_staff_resolves_with_role() {
        let (_, resolver) = setup().await;
        let parsed = resolver.parse("0812-3456-7890").unwrap();
        let id = resolver.resolve(TENANT, ACCOUNT, &parsed).await.unwrap();
        assert_eq!(id.participant, MANAGER);
        assert_eq!(id.role, Role::Staff(StaffRole::Manager));
        assert!(!id.is_alias);
    }

    #[tokio::test]
    async fn unknown_number_is_customer() {
        let (_, resolver) = setup().await;
        let parsed = resolver.parse("081111111111").unwrap();
        let id = resolver.resolve(TENANT, ACCOUNT, &parsed).await.unwrap();
        assert_eq!(id.role, Role::Customer);
    }

    #[tokio::test]
    async fn negative_cache_falls_through_to_registry() {
        let (store, resolver) = setup().await;
        let newcomer = resolver.parse("081999999999").unwrap();
        // Warm the cache with a negative.
        let id = resolver.resolve(TENANT, ACCOUNT, &newcomer).await.unwrap();
        assert_eq!(id.role, Role::Customer);

        store
            .upsert_staff(
                TENANT,
                StaffMember {
                    address: "6281999999999".into(),
                    role: StaffRole::Operator,
                    name: None,
                    known_aliases: vec![],
                },
            )
            .await
            .unwrap();

        let id = resolver.resolve(TENANT, ACCOUNT, &newcomer).await.unwrap();
        assert_eq!(id.role, Role::Staff(StaffRole::Operator));
    }

    #[tokio::test]
    async fn unlinked_alias_is_customer() {
        let (_, resolver) = setup().await;
        let alias = resolver.parse("5550001@lid").unwrap();
        let id = resolver.resolve(TENANT, ACCOUNT, &alias).await.unwrap();
        assert!(id.is_alias);
        assert_eq!(id.canonical, None);
        assert_eq!(id.role, Role::Customer);
    }

    #[tokio::test]
    async fn alias_links_to_recent_staff_conversation() {
        let (store, resolver) = setup().await;
        store
            .create_conversation(NewConversation {
                tenant_id: TENANT.into(),
                channel_account: ACCOUNT.into(),
                participant: MANAGER.into(),
                is_staff: true,
                staff_role: Some(StaffRole::Manager),
                linked_canonical: None,
            })
            .await
            .unwrap();

        let alias = resolver.parse("5550001@lid").unwrap();
        let id = resolver.resolve(TENANT, ACCOUNT, &alias).await.unwrap();
        assert_eq!(id.canonical.as_deref(), Some(MANAGER));
        assert_eq!(id.role, Role::Staff(StaffRole::Manager));
        assert_eq!(id.link, Some(LinkSource::Recency));

        let link = store.find_alias_link(TENANT, "5550001@lid").await.unwrap().unwrap();
        assert_eq!(link.source, LinkSource::Recency);
    }

    #[tokio::test]
    async fn recency_ignores_other_accounts() {
        let (store, resolver) = setup().await;
        store
            .create_conversation(NewConversation {
                tenant_id: TENANT.into(),
                channel_account: "6289999999999".into(),
                participant: MANAGER.into(),
                is_staff: true,
                staff_role: Some(StaffRole::Manager),
                linked_canonical: None,
            })
            .await
            .unwrap();

        let alias = resolver.parse("5550001@lid").unwrap();
        let id = resolver.resolve(TENANT, ACCOUNT, &alias).await.unwrap();
        assert_eq!(id.role, Role::Customer);
    }

    #[tokio::test]
    async fn verify_rejects_unregistered_claim() {
        let (store, resolver) = setup().await;
        let alias = resolver.parse("5550001@lid").unwrap();
        let outcome = resolver.verify_claim(TENANT, &alias, "081111111111").await.unwrap();
        assert_eq!(outcome, VerificationOutcome::Rejected(RejectReason::NotRegisteredStaff));
        assert!(store.find_alias_link(TENANT, "5550001@lid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn verify_rejects_garbage_claim() {
        let (_, resolver) = setup().await;
        let alias = resolver.parse("5550001@lid").unwrap();
        let outcome = resolver.verify_claim(TENANT, &alias, "abc").await.unwrap();
        assert_eq!(outcome, VerificationOutcome::Rejected(RejectReason::InvalidAddress));
    }

    #[tokio::test]
    async fn verify_persists_link_and_resolves_afterwards() {
        let (_, resolver) = setup().await;
        let alias = resolver.parse("5550001@lid").unwrap();
        let outcome = resolver.verify_claim(TENANT, &alias, "081234567890").await.unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome::Verified {
                canonical: MANAGER.into(),
                role: StaffRole::Manager
            }
        );

        let id = resolver.resolve(TENANT, ACCOUNT, &alias).await.unwrap();
        assert_eq!(id.role, Role::Staff(StaffRole::Manager));
        assert_eq!(id.link, Some(LinkSource::Verified));

        let again = resolver.verify_claim(TENANT, &alias, "081234567890").await.unwrap();
        assert!(matches!(again, VerificationOutcome::AlreadyVerified { .. }));
    }

    #[tokio::test]
    async fn second_alias_needs_confirmation() {
        let (store, resolver) = setup().await;
        let first = resolver.parse("5550001@lid").unwrap();
        let second = resolver.parse("5550002@lid").unwrap();
        resolver.verify_claim(TENANT, &first, "081234567890").await.unwrap();

        let outcome = resolver.verify_claim(TENANT, &second, "081234567890").await.unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome::Rejected(RejectReason::NeedsConfirmation {
                canonical: MANAGER.into()
            })
        );

        // An administrator confirms the second device.
        store
            .upsert_staff(
                TENANT,
                StaffMember {
                    address: MANAGER.into(),
                    role: StaffRole::Manager,
                    name: Some("Budi".into()),
                    known_aliases: vec!["5550002@lid".into()],
                },
            )
            .await
            .unwrap();
        let outcome = resolver.verify_claim(TENANT, &second, "081234567890").await.unwrap();
        assert!(matches!(outcome, VerificationOutcome::Verified { .. }));
    }

    #[tokio::test]
    async fn verified_alias_cannot_be_rebound() {
        let (store, resolver) = setup().await;
        store
            .upsert_staff(
                TENANT,
                StaffMember {
                    address: "6281777777777".into(),
                    role: StaffRole::Operator,
                    name: None,
                    known_aliases: vec![],
                },
            )
            .await
            .unwrap();
        let alias = resolver.parse("5550001@lid").unwrap();
        resolver.verify_claim(TENANT, &alias, "081234567890").await.unwrap();

        let outcome = resolver.verify_claim(TENANT, &alias, "081777777777").await.unwrap();
        assert_eq!(
            outcome,
            VerificationOutcome::Rejected(RejectReason::AliasBoundElsewhere {
                canonical: MANAGER.into()
            })
        );
    }

    #[tokio::test]
    async fn canonical_sender_cannot_claim_other_identity() {
        let (_, resolver) = setup().await;
        let sender = resolver.parse("081111111111").unwrap();
        let outcome = resolver.verify_claim(TENANT, &sender, "081234567890").await.unwrap();
        assert_eq!(outcome, VerificationOutcome::Rejected(RejectReason::NotAnAlias));
    }
}
