//! In-memory `Storage` implementation.
//!
//! Used by tests and the demo binary. All state lives behind one tokio
//! `RwLock`, so every operation is atomic with respect to the others.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::StaffRole;
use crate::pipeline::flow::FlowContext;
use crate::store::traits::*;

#[derive(Default)]
struct Inner {
    conversations: Vec<Conversation>,
    messages: Vec<MessageRecord>,
    /// (tenant, address) → member
    staff: HashMap<(String, String), StaffMember>,
    /// (tenant, alias) → link
    alias_links: HashMap<(String, String), AliasLink>,
    records: Vec<Record>,
    /// (tenant, draft_key) → record id
    drafts: HashMap<(String, String), String>,
}

/// Process-local storage backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All message records of a conversation, oldest first (test helper).
    pub async fn messages_for(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Every conversation of a tenant, including closed ones.
    pub async fn conversations(&self, tenant_id: &str) -> Vec<Conversation> {
        self.inner
            .read()
            .await
            .conversations
            .iter()
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

fn not_found(entity: &str, id: &str) -> DatabaseError {
    DatabaseError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_conversation(
        &self,
        tenant_id: &str,
        channel_account: &str,
        participant: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .iter()
            .rev()
            .find(|c| {
                c.tenant_id == tenant_id
                    && c.channel_account == channel_account
                    && c.participant == participant
                    && c.status != ConversationStatus::Closed
            })
            .cloned())
    }

    async fn create_conversation(
        &self,
        new: NewConversation,
    ) -> Result<Conversation, DatabaseError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            tenant_id: new.tenant_id,
            channel_account: new.channel_account,
            participant: new.participant,
            status: ConversationStatus::Active,
            flow: FlowContext::default(),
            is_staff: new.is_staff,
            staff_role: new.staff_role,
            linked_canonical: new.linked_canonical,
            last_intent: None,
            created_at: now,
            last_message_at: now,
        };
        self.inner.write().await.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: &ConversationPatch,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| not_found("conversation", conversation_id))?;
        patch.apply_to(conversation);
        Ok(())
    }

    async fn recent_staff_conversations(
        &self,
        tenant_id: &str,
        channel_account: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Conversation> = inner
            .conversations
            .iter()
            .filter(|c| {
                c.tenant_id == tenant_id
                    && c.channel_account == channel_account
                    && c.is_staff
                    && c.last_message_at >= since
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(found)
    }

    async fn append_message(&self, message: NewMessage) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let record = MessageRecord::from_new(id.clone(), message, Utc::now());
        self.inner.write().await.messages.push(record);
        Ok(id)
    }

    async fn update_message_classification(
        &self,
        message_id: &str,
        intent: &str,
        confidence: f32,
        sender_kind: SenderKind,
        sender_level: Option<StaffRole>,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| not_found("message", message_id))?;
        message.intent = Some(intent.to_string());
        message.confidence = Some(confidence);
        message.sender_kind = sender_kind;
        message.sender_level = sender_level;
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let all = self.messages_for(conversation_id).await;
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn find_canonical_identity(
        &self,
        tenant_id: &str,
        address: &str,
    ) -> Result<Option<StaffRole>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .staff
            .get(&(tenant_id.to_string(), address.to_string()))
            .map(|m| m.role))
    }

    async fn list_registered_staff(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<StaffMember>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut staff: Vec<StaffMember> = inner
            .staff
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|(_, member)| member.clone())
            .collect();
        staff.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(staff)
    }

    async fn upsert_staff(
        &self,
        tenant_id: &str,
        member: StaffMember,
    ) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .staff
            .insert((tenant_id.to_string(), member.address.clone()), member);
        Ok(())
    }

    async fn find_alias_link(
        &self,
        tenant_id: &str,
        alias: &str,
    ) -> Result<Option<AliasLink>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .alias_links
            .get(&(tenant_id.to_string(), alias.to_string()))
            .cloned())
    }

    async fn list_alias_links(
        &self,
        tenant_id: &str,
        canonical: &str,
    ) -> Result<Vec<AliasLink>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .alias_links
            .values()
            .filter(|l| l.tenant_id == tenant_id && l.canonical == canonical)
            .cloned()
            .collect())
    }

    async fn save_alias_link(&self, link: AliasLink) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .alias_links
            .insert((link.tenant_id.clone(), link.alias.clone()), link);
        Ok(())
    }

    async fn create_record(
        &self,
        tenant_id: &str,
        draft_key: &str,
        draft: &RecordDraft,
    ) -> Result<String, DatabaseError> {
        let mut inner = self.inner.write().await;
        let key = (tenant_id.to_string(), draft_key.to_string());
        if let Some(existing) = inner.drafts.get(&key) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let id = new_record_id();
        inner.records.push(Record {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            make: draft.make.clone(),
            model: draft.model.clone(),
            year: draft.year,
            price: draft.price,
            color: draft.color.clone(),
            mileage_km: draft.mileage_km,
            status: RecordStatus::Available,
            photos: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        inner.drafts.insert(key, id.clone());
        Ok(id)
    }

    async fn get_record(
        &self,
        tenant_id: &str,
        record_id: &str,
    ) -> Result<Option<Record>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.id.eq_ignore_ascii_case(record_id))
            .cloned())
    }

    async fn attach_file_to_record(
        &self,
        tenant_id: &str,
        record_id: &str,
        file_ref: &str,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.tenant_id == tenant_id && r.id.eq_ignore_ascii_case(record_id))
            .ok_or_else(|| not_found("record", record_id))?;
        if !record.photos.iter().any(|p| p == file_ref) {
            record.photos.push(file_ref.to_string());
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_record(
        &self,
        tenant_id: &str,
        record_id: &str,
        update: &RecordUpdate,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.tenant_id == tenant_id && r.id.eq_ignore_ascii_case(record_id))
            .ok_or_else(|| not_found("record", record_id))?;
        match update {
            RecordUpdate::Make(v) => record.make = v.clone(),
            RecordUpdate::Model(v) => record.model = v.clone(),
            RecordUpdate::Year(v) => record.year = *v,
            RecordUpdate::Price(v) => record.price = *v,
            RecordUpdate::Color(v) => record.color = Some(v.clone()),
            RecordUpdate::Mileage(v) => record.mileage_km = Some(*v),
            RecordUpdate::Status(v) => record.status = *v,
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_records(
        &self,
        tenant_id: &str,
        status: Option<RecordStatus>,
        limit: usize,
    ) -> Result<Vec<Record>, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .rev()
            .filter(|r| r.tenant_id == tenant_id && status.is_none_or(|s| r.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_stats(&self, tenant_id: &str) -> Result<RecordStats, DatabaseError> {
        let inner = self.inner.read().await;
        let mut stats = RecordStats::default();
        for record in inner.records.iter().filter(|r| r.tenant_id == tenant_id) {
            match record.status {
                RecordStatus::Available => stats.available += 1,
                RecordStatus::Booked => stats.booked += 1,
                RecordStatus::Sold => stats.sold += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn draft() -> RecordDraft {
        RecordDraft {
            make: "Toyota".into(),
            model: "Avanza".into(),
            year: 2020,
            price: dec!(150000000),
            color: None,
            mileage_km: None,
        }
    }

    fn new_conversation(participant: &str, is_staff: bool) -> NewConversation {
        NewConversation {
            tenant_id: "t1".into(),
            channel_account: "620000".into(),
            participant: participant.into(),
            is_staff,
            staff_role: None,
            linked_canonical: None,
        }
    }

    #[tokio::test]
    async fn closed_conversations_are_not_active() {
        let store = MemoryStore::new();
        let conv = store.create_conversation(new_conversation("6281", false)).await.unwrap();
        assert!(store.get_conversation("t1", "620000", "6281").await.unwrap().is_some());

        let patch = ConversationPatch {
            status: Some(ConversationStatus::Closed),
            ..Default::default()
        };
        store.update_conversation(&conv.id, &patch).await.unwrap();
        assert!(store.get_conversation("t1", "620000", "6281").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = MemoryStore::new();
        store.create_conversation(new_conversation("6281", false)).await.unwrap();
        assert!(store.get_conversation("t2", "620000", "6281").await.unwrap().is_none());

        store.create_record("t1", "k1", &draft()).await.unwrap();
        assert!(store.list_records("t2", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_record_is_idempotent_on_draft_key() {
        let store = MemoryStore::new();
        let first = store.create_record("t1", "k1", &draft()).await.unwrap();
        let second = store.create_record("t1", "k1", &draft()).await.unwrap();
        assert_eq!(first, second);
        let third = store.create_record("t1", "k2", &draft()).await.unwrap();
        assert_ne!(first, third);
        assert_eq!(store.record_stats("t1").await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn recent_messages_keeps_tail_in_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_message(NewMessage::inbound("t1", "c1", "6281", &format!("m{i}"), None))
                .await
                .unwrap();
        }
        let recent = store.recent_messages("c1", 2).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn recent_staff_conversations_filters_and_orders() {
        let store = MemoryStore::new();
        store.create_conversation(new_conversation("6281", true)).await.unwrap();
        store.create_conversation(new_conversation("6282", false)).await.unwrap();
        let later = store.create_conversation(new_conversation("6283", true)).await.unwrap();
        let patch = ConversationPatch {
            last_message_at: Some(Utc::now() + chrono::Duration::seconds(5)),
            ..Default::default()
        };
        store.update_conversation(&later.id, &patch).await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        let found = store.recent_staff_conversations("t1", "620000", since).await.unwrap();
        let participants: Vec<_> = found.iter().map(|c| c.participant.as_str()).collect();
        assert_eq!(participants, vec!["6283", "6281"]);
    }

    #[tokio::test]
    async fn status_update_and_stats() {
        let store = MemoryStore::new();
        let id = store.create_record("t1", "k1", &draft()).await.unwrap();
        store
            .update_record("t1", &id, &RecordUpdate::Status(RecordStatus::Sold))
            .await
            .unwrap();
        let stats = store.record_stats("t1").await.unwrap();
        assert_eq!(stats.sold, 1);
        assert_eq!(stats.available, 0);

        let missing = store
            .update_record("t1", "NOPE", &RecordUpdate::Year(2001))
            .await;
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }
}
