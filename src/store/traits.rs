//! Unified `Storage` trait: single async interface for everything the
//! orchestrator persists: conversations, message records, the staff
//! registry, alias links, and the records multi-step flows create.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::identity::StaffRole;
use crate::pipeline::flow::FlowContext;

// ── Conversations ───────────────────────────────────────────────────

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    /// Needs a human; set on responder failures or explicit uncertainty.
    Escalated,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Escalated => "escalated",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "escalated" => Self::Escalated,
            "closed" => Self::Closed,
            _ => Self::Active,
        }
    }
}

/// A conversation between one participant and one channel account.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    /// The tenant's own channel address the participant wrote to.
    pub channel_account: String,
    /// Canonical address or alias key of the participant.
    pub participant: String,
    pub status: ConversationStatus,
    /// Multi-step flow state and its carried data.
    pub flow: FlowContext,
    /// Sticky: once true, never reverted by per-message classification.
    pub is_staff: bool,
    pub staff_role: Option<StaffRole>,
    /// Canonical identity an alias participant was linked to.
    pub linked_canonical: Option<String>,
    pub last_intent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

/// Fields needed to open a conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub tenant_id: String,
    pub channel_account: String,
    pub participant: String,
    pub is_staff: bool,
    pub staff_role: Option<StaffRole>,
    pub linked_canonical: Option<String>,
}

/// Partial update applied by `update_conversation`. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub status: Option<ConversationStatus>,
    pub flow: Option<FlowContext>,
    pub is_staff: Option<bool>,
    pub staff_role: Option<StaffRole>,
    pub linked_canonical: Option<String>,
    pub last_intent: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConversationPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.flow.is_none()
            && self.is_staff.is_none()
            && self.staff_role.is_none()
            && self.linked_canonical.is_none()
            && self.last_intent.is_none()
            && self.last_message_at.is_none()
    }

    /// Apply the patch to an in-memory conversation.
    pub fn apply_to(&self, conversation: &mut Conversation) {
        if let Some(status) = self.status {
            conversation.status = status;
        }
        if let Some(ref flow) = self.flow {
            conversation.flow = flow.clone();
        }
        if let Some(is_staff) = self.is_staff {
            // Sticky: a patch can promote but never demote.
            conversation.is_staff = conversation.is_staff || is_staff;
        }
        if let Some(role) = self.staff_role {
            conversation.staff_role = Some(role);
        }
        if let Some(ref canonical) = self.linked_canonical {
            conversation.linked_canonical = Some(canonical.clone());
        }
        if let Some(ref intent) = self.last_intent {
            conversation.last_intent = Some(intent.clone());
        }
        if let Some(at) = self.last_message_at {
            conversation.last_message_at = at;
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "outbound" { Self::Outbound } else { Self::Inbound }
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    Customer,
    Staff,
    /// Generated by the AI responder.
    Ai,
    /// Scripted template or command reply.
    Bot,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Staff => "staff",
            Self::Ai => "ai",
            Self::Bot => "bot",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "staff" => Self::Staff,
            "ai" => Self::Ai,
            "bot" => Self::Bot,
            _ => Self::Customer,
        }
    }
}

/// Delivery status of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => Self::Received,
        }
    }
}

/// Fields for appending a message record.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub sender: String,
    pub content: String,
    pub attachment: Option<String>,
    pub intent: Option<String>,
    pub confidence: Option<f32>,
    pub sender_kind: SenderKind,
    pub sender_level: Option<StaffRole>,
    pub status: MessageStatus,
    pub gateway_message_id: Option<String>,
    pub error: Option<String>,
}

impl NewMessage {
    /// An inbound record, not yet classified.
    pub fn inbound(
        tenant_id: &str,
        conversation_id: &str,
        sender: &str,
        content: &str,
        attachment: Option<&str>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Inbound,
            sender: sender.to_string(),
            content: content.to_string(),
            attachment: attachment.map(String::from),
            intent: None,
            confidence: None,
            sender_kind: SenderKind::Customer,
            sender_level: None,
            status: MessageStatus::Received,
            gateway_message_id: None,
            error: None,
        }
    }
}

/// A persisted, append-only message record.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub sender: String,
    pub content: String,
    pub attachment: Option<String>,
    pub intent: Option<String>,
    pub confidence: Option<f32>,
    pub sender_kind: SenderKind,
    pub sender_level: Option<StaffRole>,
    pub status: MessageStatus,
    pub gateway_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub(crate) fn from_new(id: String, msg: NewMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: msg.tenant_id,
            conversation_id: msg.conversation_id,
            direction: msg.direction,
            sender: msg.sender,
            content: msg.content,
            attachment: msg.attachment,
            intent: msg.intent,
            confidence: msg.confidence,
            sender_kind: msg.sender_kind,
            sender_level: msg.sender_level,
            status: msg.status,
            gateway_message_id: msg.gateway_message_id,
            error: msg.error,
            created_at,
        }
    }

    /// Who sent this message, as shown in a conversation view.
    pub fn display_label(&self, is_staff_conversation: bool, assistant_name: &str) -> String {
        match self.direction {
            Direction::Inbound => match self.sender_level {
                Some(StaffRole::Owner) => "Owner".to_string(),
                Some(StaffRole::Admin) => "Admin".to_string(),
                Some(_) => "Staff".to_string(),
                None if is_staff_conversation || self.sender_kind == SenderKind::Staff => {
                    "Staff".to_string()
                }
                None => "Customer".to_string(),
            },
            Direction::Outbound => match self.sender_kind {
                SenderKind::Ai | SenderKind::Bot => assistant_name.to_string(),
                _ => "Admin".to_string(),
            },
        }
    }

    /// Intent label without its role prefix (`customer_greeting` → `greeting`).
    pub fn intent_display(&self) -> Option<&str> {
        self.intent.as_deref().map(|intent| {
            intent
                .strip_prefix("customer_")
                .or_else(|| intent.strip_prefix("staff_"))
                .unwrap_or(intent)
        })
    }
}

// ── Identity registry ───────────────────────────────────────────────

/// A registered staff member of a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffMember {
    /// Canonical address.
    pub address: String,
    pub role: StaffRole,
    pub name: Option<String>,
    /// Device aliases an administrator has confirmed for this member.
    pub known_aliases: Vec<String>,
}

/// How an alias link was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    /// Explicit verification command, confirmed against the registry.
    Verified,
    /// Recency heuristic over recent staff conversations.
    Recency,
}

impl LinkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Recency => "recency",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "verified" { Self::Verified } else { Self::Recency }
    }
}

/// Persisted alias → canonical identity link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasLink {
    pub tenant_id: String,
    pub alias: String,
    pub canonical: String,
    pub source: LinkSource,
    pub created_at: DateTime<Utc>,
}

// ── Records ─────────────────────────────────────────────────────────

/// Sales status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Available,
    Booked,
    Sold,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Booked => "booked",
            Self::Sold => "sold",
        }
    }

    pub fn label_id(&self) -> &'static str {
        match self {
            Self::Available => "Tersedia",
            Self::Booked => "Booking",
            Self::Sold => "Terjual",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "available" | "tersedia" | "ready" | "ada" => Ok(Self::Available),
            "booked" | "booking" | "dp" | "reserved" => Ok(Self::Booked),
            "sold" | "terjual" | "laku" => Ok(Self::Sold),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Complete field set needed to create a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: Decimal,
    pub color: Option<String>,
    pub mileage_km: Option<u32>,
}

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub tenant_id: String,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: Decimal,
    pub color: Option<String>,
    pub mileage_km: Option<u32>,
    pub status: RecordStatus,
    pub photos: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// One-line title, e.g. "Toyota Avanza 2020".
    pub fn title(&self) -> String {
        format!("{} {} {}", self.make, self.model, self.year)
    }
}

/// A single-field change to a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    Make(String),
    Model(String),
    Year(i32),
    Price(Decimal),
    Color(String),
    Mileage(u32),
    Status(RecordStatus),
}

/// Record counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub available: usize,
    pub booked: usize,
    pub sold: usize,
}

impl RecordStats {
    pub fn total(&self) -> usize {
        self.available + self.booked + self.sold
    }
}

/// Generate a short, typeable record id.
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

// ── Trait ───────────────────────────────────────────────────────────

/// Backend-agnostic storage trait. All operations are tenant-scoped.
#[async_trait]
pub trait Storage: Send + Sync {
    // ── Conversations ───────────────────────────────────────────────

    /// Get the current non-closed conversation for a participant.
    async fn get_conversation(
        &self,
        tenant_id: &str,
        channel_account: &str,
        participant: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Create a new active conversation.
    async fn create_conversation(
        &self,
        new: NewConversation,
    ) -> Result<Conversation, DatabaseError>;

    /// Apply a patch to a conversation (read-modify-write).
    async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: &ConversationPatch,
    ) -> Result<(), DatabaseError>;

    /// Staff conversations on an account with activity at or after `since`,
    /// most recent first.
    async fn recent_staff_conversations(
        &self,
        tenant_id: &str,
        channel_account: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append a message record. Returns its id.
    async fn append_message(&self, message: NewMessage) -> Result<String, DatabaseError>;

    /// Backfill classification on an inbound record.
    async fn update_message_classification(
        &self,
        message_id: &str,
        intent: &str,
        confidence: f32,
        sender_kind: SenderKind,
        sender_level: Option<StaffRole>,
    ) -> Result<(), DatabaseError>;

    /// Most recent messages of a conversation, oldest first.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;

    // ── Identity registry ───────────────────────────────────────────

    /// Staff level of a canonical address, `None` for customers.
    async fn find_canonical_identity(
        &self,
        tenant_id: &str,
        address: &str,
    ) -> Result<Option<StaffRole>, DatabaseError>;

    /// All registered staff of a tenant.
    async fn list_registered_staff(&self, tenant_id: &str)
    -> Result<Vec<StaffMember>, DatabaseError>;

    /// Register or update a staff member.
    async fn upsert_staff(&self, tenant_id: &str, member: StaffMember)
    -> Result<(), DatabaseError>;

    async fn find_alias_link(
        &self,
        tenant_id: &str,
        alias: &str,
    ) -> Result<Option<AliasLink>, DatabaseError>;

    /// All aliases linked to a canonical identity.
    async fn list_alias_links(
        &self,
        tenant_id: &str,
        canonical: &str,
    ) -> Result<Vec<AliasLink>, DatabaseError>;

    /// Insert or replace the link for `link.alias`.
    async fn save_alias_link(&self, link: AliasLink) -> Result<(), DatabaseError>;

    // ── Records ─────────────────────────────────────────────────────

    /// Create a record. Idempotent on `draft_key`: a second call with the
    /// same key returns the id of the record created by the first.
    async fn create_record(
        &self,
        tenant_id: &str,
        draft_key: &str,
        draft: &RecordDraft,
    ) -> Result<String, DatabaseError>;

    async fn get_record(
        &self,
        tenant_id: &str,
        record_id: &str,
    ) -> Result<Option<Record>, DatabaseError>;

    async fn attach_file_to_record(
        &self,
        tenant_id: &str,
        record_id: &str,
        file_ref: &str,
    ) -> Result<(), DatabaseError>;

    async fn update_record(
        &self,
        tenant_id: &str,
        record_id: &str,
        update: &RecordUpdate,
    ) -> Result<(), DatabaseError>;

    /// Records, newest first, optionally filtered by status.
    async fn list_records(
        &self,
        tenant_id: &str,
        status: Option<RecordStatus>,
        limit: usize,
    ) -> Result<Vec<Record>, DatabaseError>;

    async fn record_stats(&self, tenant_id: &str) -> Result<RecordStats, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(direction: Direction, kind: SenderKind, level: Option<StaffRole>) -> MessageRecord {
        MessageRecord {
            id: "m1".into(),
            tenant_id: "t1".into(),
            conversation_id: "c1".into(),
            direction,
            sender: "6281".into(),
            content: "halo".into(),
            attachment: None,
            intent: Some("customer_greeting".into()),
            confidence: Some(0.9),
            sender_kind: kind,
            sender_level: level,
            status: MessageStatus::Received,
            gateway_message_id: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn inbound_labels_follow_staff_level() {
        let owner = record(Direction::Inbound, SenderKind::Staff, Some(StaffRole::Owner));
        assert_eq!(owner.display_label(true, "Asisten"), "Owner");
        let admin = record(Direction::Inbound, SenderKind::Staff, Some(StaffRole::Admin));
        assert_eq!(admin.display_label(true, "Asisten"), "Admin");
        let operator = record(Direction::Inbound, SenderKind::Staff, Some(StaffRole::Operator));
        assert_eq!(operator.display_label(true, "Asisten"), "Staff");
        let customer = record(Direction::Inbound, SenderKind::Customer, None);
        assert_eq!(customer.display_label(false, "Asisten"), "Customer");
        // Sticky staff conversation wins even without a level on the record.
        assert_eq!(customer.display_label(true, "Asisten"), "Staff");
    }

    #[test]
    fn outbound_labels() {
        let ai = record(Direction::Outbound, SenderKind::Ai, None);
        assert_eq!(ai.display_label(false, "Rina"), "Rina");
        let human = record(Direction::Outbound, SenderKind::Staff, None);
        assert_eq!(human.display_label(false, "Rina"), "Admin");
    }

    #[test]
    fn intent_display_strips_prefix() {
        let msg = record(Direction::Inbound, SenderKind::Customer, None);
        assert_eq!(msg.intent_display(), Some("greeting"));
    }

    #[test]
    fn patch_never_demotes_staff() {
        let now = Utc::now();
        let mut conv = Conversation {
            id: "c1".into(),
            tenant_id: "t1".into(),
            channel_account: "620000".into(),
            participant: "6281".into(),
            status: ConversationStatus::Active,
            flow: FlowContext::default(),
            is_staff: true,
            staff_role: Some(StaffRole::Manager),
            linked_canonical: None,
            last_intent: None,
            created_at: now,
            last_message_at: now,
        };
        let patch = ConversationPatch {
            is_staff: Some(false),
            ..Default::default()
        };
        patch.apply_to(&mut conv);
        assert!(conv.is_staff);
    }

    #[test]
    fn record_status_parses_indonesian() {
        assert_eq!("terjual".parse::<RecordStatus>().unwrap(), RecordStatus::Sold);
        assert_eq!("booking".parse::<RecordStatus>().unwrap(), RecordStatus::Booked);
        assert_eq!("Tersedia".parse::<RecordStatus>().unwrap(), RecordStatus::Available);
        assert!("hilang".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn record_ids_are_short() {
        let id = new_record_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
