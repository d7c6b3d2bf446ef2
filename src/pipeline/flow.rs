//! Conversation flow state machine: record creation then photo collection.
//!
//! `Idle → CollectingStructuredData → CollectingAttachments → Idle`.
//! The flow context is persisted on the conversation as a tagged union, so
//! each state carries exactly the data it needs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, FlowError};
use crate::pipeline::fields::{RecordFields, format_price};
use crate::store::Storage;

/// Flow state marker, persisted as the conversation `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// No active flow.
    Idle,
    /// Waiting for the remaining record fields.
    CollectingStructuredData,
    /// Record exists; accepting one photo per turn.
    CollectingAttachments,
}

impl FlowState {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: FlowState) -> bool {
        use FlowState::*;
        matches!(
            (self, target),
            (Idle, CollectingStructuredData)
                | (Idle, CollectingAttachments)
                | (CollectingStructuredData, CollectingStructuredData)
                | (CollectingStructuredData, CollectingAttachments)
                | (CollectingStructuredData, Idle)
                | (CollectingAttachments, CollectingAttachments)
                | (CollectingAttachments, Idle)
        )
    }

    /// Persisted marker; `None` when idle.
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            Self::Idle => None,
            Self::CollectingStructuredData => Some("collecting_structured_data"),
            Self::CollectingAttachments => Some("collecting_attachments"),
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.marker().unwrap_or("idle"))
    }
}

/// Per-state flow data carried between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowContext {
    Idle {
        /// Last record this participant touched, for `/edit` without an id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_record_id: Option<String>,
    },
    CollectingStructuredData {
        /// Idempotency key for the record created at the end of this state.
        draft_key: Uuid,
        #[serde(default)]
        fields: RecordFields,
        /// Photos sent before the record exists.
        #[serde(default)]
        pending_attachments: Vec<String>,
    },
    CollectingAttachments {
        record_id: String,
        #[serde(default)]
        photos: Vec<String>,
    },
}

impl Default for FlowContext {
    fn default() -> Self {
        Self::Idle {
            last_record_id: None,
        }
    }
}

impl FlowContext {
    pub fn state(&self) -> FlowState {
        match self {
            Self::Idle { .. } => FlowState::Idle,
            Self::CollectingStructuredData { .. } => FlowState::CollectingStructuredData,
            Self::CollectingAttachments { .. } => FlowState::CollectingAttachments,
        }
    }

    /// Whether a multi-step flow is in progress.
    pub fn is_active(&self) -> bool {
        self.state() != FlowState::Idle
    }

    /// Record the flow is working on, or the residue of the last one.
    pub fn record_id(&self) -> Option<&str> {
        match self {
            Self::Idle { last_record_id } => last_record_id.as_deref(),
            Self::CollectingStructuredData { .. } => None,
            Self::CollectingAttachments { record_id, .. } => Some(record_id),
        }
    }

    /// Photos collected in the current flow.
    pub fn photo_count(&self) -> usize {
        match self {
            Self::CollectingAttachments { photos, .. } => photos.len(),
            Self::CollectingStructuredData {
                pending_attachments,
                ..
            } => pending_attachments.len(),
            Self::Idle { .. } => 0,
        }
    }

    /// Completed flow: keep only the record reference.
    pub fn pruned(&self) -> Self {
        Self::Idle {
            last_record_id: self.record_id().map(String::from),
        }
    }

    /// Interrupted flow: drop everything.
    pub fn cleared() -> Self {
        Self::default()
    }
}

/// Result of advancing a flow by one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStep {
    pub context: FlowContext,
    pub reply: String,
    /// Whether a requested side effect failed (the flow did not advance).
    pub failed: bool,
}

impl FlowStep {
    fn ok(context: FlowContext, reply: impl Into<String>) -> Self {
        Self {
            context,
            reply: reply.into(),
            failed: false,
        }
    }
}

/// Whether the text closes an attachment flow.
pub fn is_done_phrase(text: &str) -> bool {
    let normalized = text.trim().trim_end_matches(['.', '!']).to_lowercase();
    matches!(
        normalized.as_str(),
        "selesai" | "done" | "sudah" | "udah" | "cukup" | "finish" | "sdh" | "beres" | "ok selesai"
    )
}

/// Drives record-creation flows against the storage collaborator.
pub struct FlowEngine {
    store: Arc<dyn Storage>,
    idle_timeout: std::time::Duration,
}

impl FlowEngine {
    pub fn new(store: Arc<dyn Storage>, idle_timeout: std::time::Duration) -> Self {
        Self {
            store,
            idle_timeout,
        }
    }

    /// Whether an active flow has been idle longer than the timeout.
    pub fn is_expired(&self, context: &FlowContext, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        context.is_active()
            && (now - last_activity)
                .to_std()
                .is_ok_and(|idle| idle >= self.idle_timeout)
    }

    /// Start a record flow from the fields (and photo) of an upload command.
    pub async fn start(
        &self,
        tenant_id: &str,
        fields: RecordFields,
        attachment: Option<&str>,
    ) -> Result<FlowStep, FlowError> {
        let context = FlowContext::CollectingStructuredData {
            draft_key: Uuid::new_v4(),
            fields,
            pending_attachments: attachment.map(String::from).into_iter().collect(),
        };
        self.advance(tenant_id, context, "", None).await
    }

    /// Feed one inbound turn into the active flow.
    pub async fn advance(
        &self,
        tenant_id: &str,
        current: FlowContext,
        text: &str,
        attachment: Option<&str>,
    ) -> Result<FlowStep, FlowError> {
        let from = current.state();
        let step = match current {
            idle @ FlowContext::Idle { .. } => FlowStep::ok(
                idle,
                "Tidak ada proses yang sedang berjalan. Ketik /upload untuk menambah data.",
            ),
            FlowContext::CollectingStructuredData {
                draft_key,
                mut fields,
                mut pending_attachments,
            } => {
                fields.merge(RecordFields::parse(text));
                if let Some(file_ref) = attachment
                    && !pending_attachments.iter().any(|p| p == file_ref)
                {
                    pending_attachments.push(file_ref.to_string());
                }
                self.collect_fields(tenant_id, draft_key, fields, pending_attachments)
                    .await?
            }
            FlowContext::CollectingAttachments { record_id, photos } => {
                self.collect_attachment(tenant_id, record_id, photos, text, attachment)
                    .await
            }
        };

        let to = step.context.state();
        if !from.can_transition_to(to) && from != to {
            warn!(from = %from, to = %to, "Unexpected flow transition");
        }
        Ok(step)
    }

    async fn collect_fields(
        &self,
        tenant_id: &str,
        draft_key: Uuid,
        fields: RecordFields,
        pending_attachments: Vec<String>,
    ) -> Result<FlowStep, FlowError> {
        let Some(draft) = fields.to_draft() else {
            let missing = fields.missing().join(", ");
            let received = if pending_attachments.is_empty() {
                String::new()
            } else {
                format!(" ({} foto sudah diterima)", pending_attachments.len())
            };
            return Ok(FlowStep::ok(
                FlowContext::CollectingStructuredData {
                    draft_key,
                    fields,
                    pending_attachments,
                },
                format!(
                    "Siap, data mobil belum lengkap{received}. Mohon kirim: {missing}.\nContoh: Toyota Avanza 2020 150jt"
                ),
            ));
        };

        // Exactly once per draft: a replayed turn gets the same record back.
        let record_id = self
            .store
            .create_record(tenant_id, &draft_key.to_string(), &draft)
            .await
            .map_err(|e| FlowError::RecordCreation(e.to_string()))?;
        info!(record_id = %record_id, make = %draft.make, model = %draft.model, "Record created from flow");

        let mut photos = Vec::new();
        let mut failed = Vec::new();
        for file_ref in pending_attachments {
            match self.attach(tenant_id, &record_id, &file_ref).await {
                Ok(()) => photos.push(file_ref),
                Err(e) => {
                    warn!(error = %e, "Buffered attachment failed");
                    failed.push(file_ref);
                }
            }
        }

        let mut reply = format!(
            "✅ Data tersimpan dengan ID {record_id}: {} {} {} {}.",
            draft.make,
            draft.model,
            draft.year,
            format_price(draft.price)
        );
        if !photos.is_empty() {
            reply.push_str(&format!(" {} foto sudah dilampirkan.", photos.len()));
        }
        if !failed.is_empty() {
            reply.push_str(&format!(" {} foto gagal disimpan, mohon kirim ulang.", failed.len()));
        }
        reply.push_str("\nSilakan kirim foto mobil satu per satu, ketik *selesai* jika sudah.");

        Ok(FlowStep {
            context: FlowContext::CollectingAttachments { record_id, photos },
            reply,
            failed: !failed.is_empty(),
        })
    }

    async fn collect_attachment(
        &self,
        tenant_id: &str,
        record_id: String,
        mut photos: Vec<String>,
        text: &str,
        attachment: Option<&str>,
    ) -> FlowStep {
        let Some(file_ref) = attachment else {
            if is_done_phrase(text) {
                let count = photos.len();
                let done = FlowContext::CollectingAttachments { record_id, photos }.pruned();
                let reply = format!("👍 Selesai. {count} foto tersimpan untuk ID {}.", done.record_id().unwrap_or_default());
                return FlowStep::ok(done, reply);
            }
            let count = photos.len();
            return FlowStep::ok(
                FlowContext::CollectingAttachments { record_id, photos },
                format!("Kirim foto berikutnya, atau ketik *selesai* jika sudah ({count} foto)."),
            );
        };

        if photos.iter().any(|p| p == file_ref) {
            let count = photos.len();
            return FlowStep::ok(
                FlowContext::CollectingAttachments { record_id, photos },
                format!("Foto ini sudah diterima ({count} foto)."),
            );
        }

        match self.attach(tenant_id, &record_id, file_ref).await {
            Ok(()) => {}
            Err(FlowError::RecordNotFound(_)) => {
                warn!(record_id = %record_id, "Record gone, ending photo collection");
                return FlowStep {
                    context: FlowContext::cleared(),
                    reply: format!(
                        "⚠️ Data mobil {record_id} tidak ditemukan. Ketik /upload untuk memulai lagi."
                    ),
                    failed: true,
                };
            }
            Err(e) => {
                warn!(error = %e, "Attachment failed, flow not advanced");
                return FlowStep {
                    context: FlowContext::CollectingAttachments { record_id, photos },
                    reply: "⚠️ Foto gagal disimpan. Mohon kirim ulang foto tersebut.".to_string(),
                    failed: true,
                };
            }
        }
        photos.push(file_ref.to_string());
        let count = photos.len();

        if is_done_phrase(text) {
            let done = FlowContext::CollectingAttachments { record_id, photos }.pruned();
            let reply = format!("👍 Selesai. {count} foto tersimpan untuk ID {}.", done.record_id().unwrap_or_default());
            return FlowStep::ok(done, reply);
        }

        FlowStep::ok(
            FlowContext::CollectingAttachments { record_id, photos },
            format!("📷 Foto ke-{count} tersimpan. Kirim lagi atau ketik *selesai*."),
        )
    }

    async fn attach(&self, tenant_id: &str, record_id: &str, file_ref: &str) -> Result<(), FlowError> {
        self.store
            .attach_file_to_record(tenant_id, record_id, file_ref)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound { .. } => FlowError::RecordNotFound(record_id.to_string()),
                e => FlowError::AttachFailed {
                    record_id: record_id.to_string(),
                    file_ref: file_ref.to_string(),
                    reason: e.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const TENANT: &str = "t1";

    fn engine(store: Arc<MemoryStore>) -> FlowEngine {
        FlowEngine::new(store, Duration::from_secs(1800))
    }

    #[test]
    fn transitions() {
        use FlowState::*;
        assert!(Idle.can_transition_to(CollectingStructuredData));
        assert!(CollectingStructuredData.can_transition_to(CollectingAttachments));
        assert!(CollectingAttachments.can_transition_to(Idle));
        assert!(!CollectingAttachments.can_transition_to(CollectingStructuredData));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn context_serializes_with_state_marker() {
        let ctx = FlowContext::CollectingAttachments {
            record_id: "AB12CD34".into(),
            photos: vec!["p1".into()],
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["state"], "collecting_attachments");
        assert_eq!(json["photos"][0], "p1");

        let idle: FlowContext = serde_json::from_str(r#"{"state":"idle"}"#).unwrap();
        assert_eq!(idle, FlowContext::default());
    }

    #[test]
    fn pruning_keeps_only_record_reference() {
        let ctx = FlowContext::CollectingAttachments {
            record_id: "R1".into(),
            photos: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            ctx.pruned(),
            FlowContext::Idle {
                last_record_id: Some("R1".into())
            }
        );
        assert_eq!(FlowContext::cleared().photo_count(), 0);
    }

    #[test]
    fn done_phrases() {
        assert!(is_done_phrase("Selesai"));
        assert!(is_done_phrase("sudah."));
        assert!(!is_done_phrase("sudah dikirim belum?"));
    }

    #[tokio::test]
    async fn bare_upload_waits_for_fields() {
        let store = Arc::new(MemoryStore::new());
        let step = engine(store).start(TENANT, RecordFields::default(), None).await.unwrap();
        assert_eq!(step.context.state(), FlowState::CollectingStructuredData);
        assert!(step.reply.contains("harga"));
    }

    #[tokio::test]
    async fn complete_fields_create_record_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let step = engine.start(TENANT, RecordFields::default(), Some("photo-0")).await.unwrap();
        let pending = step.context.clone();

        let step = engine
            .advance(TENANT, pending.clone(), "Toyota Avanza 2020 150jt", None)
            .await
            .unwrap();
        let FlowContext::CollectingAttachments { record_id, photos } = step.context.clone() else {
            panic!("expected attachment collection, got {:?}", step.context);
        };
        assert_eq!(photos, vec!["photo-0".to_string()]);

        // Replaying the same turn against the same pending state yields the same record.
        let replay = engine
            .advance(TENANT, pending, "Toyota Avanza 2020 150jt", None)
            .await
            .unwrap();
        assert_eq!(replay.context.record_id(), Some(record_id.as_str()));
        assert_eq!(store.list_records(TENANT, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn photos_counted_and_done_prunes() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let fields = RecordFields::parse("Honda Jazz 2018 175jt");
        let step = engine.start(TENANT, fields, None).await.unwrap();
        let record_id = step.context.record_id().unwrap().to_string();

        let step = engine.advance(TENANT, step.context, "", Some("p1")).await.unwrap();
        let step = engine.advance(TENANT, step.context, "", Some("p2")).await.unwrap();
        assert_eq!(step.context.photo_count(), 2);

        // Duplicate delivery does not double-count.
        let step = engine.advance(TENANT, step.context, "", Some("p2")).await.unwrap();
        assert_eq!(step.context.photo_count(), 2);

        let step = engine.advance(TENANT, step.context, "selesai", None).await.unwrap();
        assert_eq!(
            step.context,
            FlowContext::Idle {
                last_record_id: Some(record_id.clone())
            }
        );
        let record = store.get_record(TENANT, &record_id).await.unwrap().unwrap();
        assert_eq!(record.photos, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn photo_for_deleted_record_ends_flow() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let ctx = FlowContext::CollectingAttachments {
            record_id: "MISSING".into(),
            photos: vec!["p0".into()],
        };
        let step = engine.advance(TENANT, ctx, "", Some("p1")).await.unwrap();
        assert!(step.failed);
        assert_eq!(step.context, FlowContext::cleared());
        assert!(step.reply.contains("MISSING"));
    }

    #[test]
    fn expiry_only_applies_to_active_flows() {
        let engine = FlowEngine::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(120);
        let active = FlowContext::CollectingAttachments {
            record_id: "R1".into(),
            photos: vec![],
        };
        assert!(engine.is_expired(&active, stale, now));
        assert!(!engine.is_expired(&active, now, now));
        assert!(!engine.is_expired(&FlowContext::default(), stale, now));
    }
}
