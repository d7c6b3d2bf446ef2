//! Shared types for the message processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::delivery::DeliveryReport;
use crate::identity::Role;
use crate::pipeline::fields::RecordFields;

// ── Inbound message ─────────────────────────────────────────────────

/// Unified inbound message from a chat channel.
///
/// Webhook adapters convert their native payload into this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel-native message id.
    pub id: String,
    pub tenant_id: String,
    /// The tenant's own address on the channel (the account that received it).
    pub channel_account: String,
    /// Raw sender address as reported by the channel.
    pub sender: String,
    /// Message text or attachment caption.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachment: Option<InboundAttachment>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Text-only message received now.
    pub fn text(tenant_id: &str, channel_account: &str, sender: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            channel_account: channel_account.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            attachment: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_attachment(mut self, file_ref: &str, mime: &str) -> Self {
        self.attachment = Some(InboundAttachment {
            file_ref: file_ref.to_string(),
            mime: mime.to_string(),
        });
        self
    }

    pub fn has_attachment(&self) -> bool {
        self.attachment.is_some()
    }
}

/// Media attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAttachment {
    /// Storage reference or URL of the uploaded media.
    pub file_ref: String,
    pub mime: String,
}

// ── Intent ──────────────────────────────────────────────────────────

/// Classified intent of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// `/verify <address>` identity claim.
    VerifyIdentity,
    /// Input for an active multi-step flow.
    StaffContinueFlow,
    StaffUpload,
    StaffStatus,
    StaffInventory,
    StaffStats,
    StaffEdit,
    StaffHelp,
    CustomerConfirmation,
    CustomerClosing,
    CustomerDecline,
    CustomerFollowUp,
    CustomerPhotoRequest,
    CustomerGreeting,
    CustomerPriceInquiry,
    CustomerSchedule,
    CustomerRecordInquiry,
    CustomerContact,
    CustomerAbout,
    CustomerGeneral,
}

impl Intent {
    /// Label stored on message records and conversations.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerifyIdentity => "verify_identity",
            Self::StaffContinueFlow => "staff_continue_flow",
            Self::StaffUpload => "staff_upload",
            Self::StaffStatus => "staff_status",
            Self::StaffInventory => "staff_inventory",
            Self::StaffStats => "staff_stats",
            Self::StaffEdit => "staff_edit",
            Self::StaffHelp => "staff_help",
            Self::CustomerConfirmation => "customer_confirmation",
            Self::CustomerClosing => "customer_closing",
            Self::CustomerDecline => "customer_decline",
            Self::CustomerFollowUp => "customer_follow_up",
            Self::CustomerPhotoRequest => "customer_photo_request",
            Self::CustomerGreeting => "customer_greeting",
            Self::CustomerPriceInquiry => "customer_price_inquiry",
            Self::CustomerSchedule => "customer_schedule",
            Self::CustomerRecordInquiry => "customer_record_inquiry",
            Self::CustomerContact => "customer_contact",
            Self::CustomerAbout => "customer_about",
            Self::CustomerGeneral => "customer_general",
        }
    }

    /// Scripted staff command handled without the responder.
    pub fn is_staff_command(&self) -> bool {
        matches!(
            self,
            Self::StaffUpload
                | Self::StaffStatus
                | Self::StaffInventory
                | Self::StaffStats
                | Self::StaffEdit
                | Self::StaffHelp
        )
    }

    /// Conversational intent routed to the AI responder (or a template).
    pub fn is_conversational(&self) -> bool {
        self.as_str().starts_with("customer_")
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    /// Fixed per-rule confidence, not a statistical score.
    pub confidence: f32,
    /// Which rule matched.
    pub reason: String,
}

impl Classification {
    pub fn new(intent: Intent, confidence: f32, reason: impl Into<String>) -> Self {
        Self {
            intent,
            confidence,
            reason: reason.into(),
        }
    }
}

// ── Responder side intents ──────────────────────────────────────────

/// Structured action requested by the AI responder through a tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum SideIntent {
    /// Staff only: begin record creation with whatever fields are known.
    StartRecordFlow { fields: RecordFields },
    /// Staff only: change one field of a record.
    EditRecordField {
        record_id: Option<String>,
        field: String,
        value: String,
    },
    /// Attach a record's photos to the reply.
    SendRecordPhotos { record_id: String },
}

impl SideIntent {
    pub fn requires_staff(&self) -> bool {
        !matches!(self, Self::SendRecordPhotos { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StartRecordFlow { .. } => "start_record_flow",
            Self::EditRecordField { .. } => "edit_record_field",
            Self::SendRecordPhotos { .. } => "send_record_photos",
        }
    }
}

// ── Result ──────────────────────────────────────────────────────────

/// How a message ended up being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// Sent by the tenant's own account; discarded.
    SelfLoop,
    /// Sender address could not be parsed; discarded.
    Unaddressable,
    /// Duplicate greeting within the dedup window; recorded, not answered.
    Suppressed,
    /// A reply was produced and handed to delivery.
    Replied,
    /// An internal error occurred; a generic apology was sent instead.
    Failed,
}

/// Result of processing one inbound message.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub outcome: ProcessingOutcome,
    pub conversation_id: Option<String>,
    pub intent: Option<Intent>,
    pub confidence: Option<f32>,
    pub role: Option<Role>,
    /// Text sent back to the participant.
    pub response: Option<String>,
    pub delivery: Option<DeliveryReport>,
}

impl ProcessingResult {
    pub(crate) fn discarded(outcome: ProcessingOutcome) -> Self {
        Self {
            outcome,
            conversation_id: None,
            intent: None,
            confidence: None,
            role: None,
            response: None,
            delivery: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_labels_are_prefixed() {
        assert_eq!(Intent::CustomerGreeting.as_str(), "customer_greeting");
        assert_eq!(Intent::StaffUpload.to_string(), "staff_upload");
        let json = serde_json::to_string(&Intent::CustomerFollowUp).unwrap();
        assert_eq!(json, "\"customer_follow_up\"");
    }

    #[test]
    fn intent_groups() {
        assert!(Intent::StaffStats.is_staff_command());
        assert!(!Intent::StaffContinueFlow.is_staff_command());
        assert!(!Intent::VerifyIdentity.is_conversational());
        assert!(Intent::CustomerAbout.is_conversational());
    }

    #[test]
    fn photo_side_intent_is_open_to_customers() {
        let photos = SideIntent::SendRecordPhotos {
            record_id: "R1".into(),
        };
        assert!(!photos.requires_staff());
        let flow = SideIntent::StartRecordFlow {
            fields: RecordFields::default(),
        };
        assert!(flow.requires_staff());
    }
}
