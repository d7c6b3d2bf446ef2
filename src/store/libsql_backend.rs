//! libSQL backend: async `Storage` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::StaffRole;
use crate::pipeline::flow::FlowContext;
use crate::store::migrations;
use crate::store::traits::*;

/// libSQL storage backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::migrate(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::migrate(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn get_conversation_by_id(&self, id: &str) -> Result<Conversation, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation_by_id: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation_by_id row: {e}")))?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: id.to_string(),
            })?;
        row_to_conversation(&row)
    }

    async fn record_photos(&self, record_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT file_ref FROM record_photos WHERE record_id = ?1 ORDER BY position",
                params![record_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_photos: {e}")))?;
        let mut photos = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_photos row: {e}")))?
        {
            photos.push(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("record_photos column: {e}")))?,
            );
        }
        Ok(photos)
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Record>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("query_records: {e}")))?;
        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query_records row: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        for record in &mut records {
            record.photos = self.record_photos(&record.id).await?;
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f32>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v as f64),
        None => libsql::Value::Null,
    }
}

fn col_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const CONVERSATION_COLUMNS: &str = "id, tenant_id, channel_account, participant, status, flow, is_staff, staff_role, linked_canonical, last_intent, created_at, last_message_at";

const MESSAGE_COLUMNS: &str = "id, tenant_id, conversation_id, direction, sender, content, attachment, intent, confidence, sender_kind, sender_level, status, gateway_message_id, error, created_at";

const RECORD_COLUMNS: &str =
    "id, tenant_id, make, model, year, price, color, mileage_km, status, created_at, updated_at";

/// Map a libsql Row to a Conversation. Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, DatabaseError> {
    let err = col_err("conversation row");
    let flow_json: String = row.get(5).map_err(&err)?;
    let flow: FlowContext = serde_json::from_str(&flow_json)
        .map_err(|e| DatabaseError::Serialization(format!("conversation flow: {e}")))?;
    let staff_role: Option<String> = row.get(7).ok();
    let created_str: String = row.get(10).map_err(&err)?;
    let last_str: String = row.get(11).map_err(&err)?;
    let status: String = row.get(4).map_err(&err)?;

    Ok(Conversation {
        id: row.get(0).map_err(&err)?,
        tenant_id: row.get(1).map_err(&err)?,
        channel_account: row.get(2).map_err(&err)?,
        participant: row.get(3).map_err(&err)?,
        status: ConversationStatus::parse(&status),
        flow,
        is_staff: row.get::<i64>(6).map_err(&err)? != 0,
        staff_role: staff_role.and_then(|r| r.parse().ok()),
        linked_canonical: row.get(8).ok(),
        last_intent: row.get(9).ok(),
        created_at: parse_datetime(&created_str),
        last_message_at: parse_datetime(&last_str),
    })
}

/// Map a libsql Row to a MessageRecord. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let err = col_err("message row");
    let direction: String = row.get(3).map_err(&err)?;
    let sender_kind: String = row.get(9).map_err(&err)?;
    let sender_level: Option<String> = row.get(10).ok();
    let status: String = row.get(11).map_err(&err)?;
    let confidence: Option<f64> = row.get(8).ok();
    let created_str: String = row.get(14).map_err(&err)?;

    Ok(MessageRecord {
        id: row.get(0).map_err(&err)?,
        tenant_id: row.get(1).map_err(&err)?,
        conversation_id: row.get(2).map_err(&err)?,
        direction: Direction::parse(&direction),
        sender: row.get(4).map_err(&err)?,
        content: row.get(5).map_err(&err)?,
        attachment: row.get(6).ok(),
        intent: row.get(7).ok(),
        confidence: confidence.map(|c| c as f32),
        sender_kind: SenderKind::parse(&sender_kind),
        sender_level: sender_level.and_then(|l| l.parse().ok()),
        status: MessageStatus::parse(&status),
        gateway_message_id: row.get(12).ok(),
        error: row.get(13).ok(),
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a Record (without photos). Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<Record, DatabaseError> {
    let err = col_err("record row");
    let price_str: String = row.get(5).map_err(&err)?;
    let price: Decimal = price_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("record price '{price_str}': {e}")))?;
    let status: String = row.get(8).map_err(&err)?;
    let mileage: Option<i64> = row.get(7).ok();
    let created_str: String = row.get(9).map_err(&err)?;
    let updated_str: String = row.get(10).map_err(&err)?;

    Ok(Record {
        id: row.get(0).map_err(&err)?,
        tenant_id: row.get(1).map_err(&err)?,
        make: row.get(2).map_err(&err)?,
        model: row.get(3).map_err(&err)?,
        year: row.get::<i64>(4).map_err(&err)? as i32,
        price,
        color: row.get(6).ok(),
        mileage_km: mileage.and_then(|m| u32::try_from(m).ok()),
        status: status.parse().unwrap_or(RecordStatus::Available),
        photos: Vec::new(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn flow_json(flow: &FlowContext) -> Result<String, DatabaseError> {
    serde_json::to_string(flow)
        .map_err(|e| DatabaseError::Serialization(format!("conversation flow: {e}")))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Storage for LibSqlStore {
    // ── Conversations ───────────────────────────────────────────────

    async fn get_conversation(
        &self,
        tenant_id: &str,
        channel_account: &str,
        participant: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                     WHERE tenant_id = ?1 AND channel_account = ?2 AND participant = ?3 \
                     AND status != 'closed' ORDER BY created_at DESC LIMIT 1"
                ),
                params![tenant_id, channel_account, participant],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_conversation(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_conversation(
        &self,
        new: NewConversation,
    ) -> Result<Conversation, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO conversations ({CONVERSATION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, NULL, ?9, ?9)"
                ),
                params![
                    id.clone(),
                    new.tenant_id,
                    new.channel_account,
                    new.participant,
                    flow_json(&FlowContext::default())?,
                    new.is_staff as i64,
                    opt_text(new.staff_role.as_ref().map(StaffRole::as_str)),
                    opt_text(new.linked_canonical.as_deref()),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_conversation: {e}")))?;
        self.get_conversation_by_id(&id).await
    }

    async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: &ConversationPatch,
    ) -> Result<(), DatabaseError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut conversation = self.get_conversation_by_id(conversation_id).await?;
        patch.apply_to(&mut conversation);

        self.conn()
            .execute(
                "UPDATE conversations SET status = ?2, flow = ?3, is_staff = ?4, staff_role = ?5, \
                 linked_canonical = ?6, last_intent = ?7, last_message_at = ?8 WHERE id = ?1",
                params![
                    conversation_id,
                    conversation.status.as_str(),
                    flow_json(&conversation.flow)?,
                    conversation.is_staff as i64,
                    opt_text(conversation.staff_role.as_ref().map(StaffRole::as_str)),
                    opt_text(conversation.linked_canonical.as_deref()),
                    opt_text(conversation.last_intent.as_deref()),
                    conversation.last_message_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_conversation: {e}")))?;
        Ok(())
    }

    async fn recent_staff_conversations(
        &self,
        tenant_id: &str,
        channel_account: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                     WHERE tenant_id = ?1 AND channel_account = ?2 AND is_staff = 1 \
                     AND last_message_at >= ?3 ORDER BY last_message_at DESC"
                ),
                params![tenant_id, channel_account, since.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_staff_conversations: {e}")))?;

        let mut conversations = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_staff_conversations row: {e}")))?
        {
            conversations.push(row_to_conversation(&row)?);
        }
        Ok(conversations)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(&self, message: NewMessage) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    id.clone(),
                    message.tenant_id,
                    message.conversation_id,
                    message.direction.as_str(),
                    message.sender,
                    message.content,
                    opt_text(message.attachment.as_deref()),
                    opt_text(message.intent.as_deref()),
                    opt_real(message.confidence),
                    message.sender_kind.as_str(),
                    opt_text(message.sender_level.as_ref().map(StaffRole::as_str)),
                    message.status.as_str(),
                    opt_text(message.gateway_message_id.as_deref()),
                    opt_text(message.error.as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_message: {e}")))?;
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
        self.conn()
            .execute(
                "UPDATE messages SET intent = ?2, confidence = ?3, sender_kind = ?4, sender_level = ?5 \
                 WHERE id = ?1",
                params![
                    message_id,
                    intent,
                    confidence as f64,
                    sender_kind.as_str(),
                    opt_text(sender_level.as_ref().map(StaffRole::as_str)),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_message_classification: {e}")))?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![conversation_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_messages row: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        messages.reverse();
        Ok(messages)
    }

    // ── Identity registry ───────────────────────────────────────────

    async fn find_canonical_identity(
        &self,
        tenant_id: &str,
        address: &str,
    ) -> Result<Option<StaffRole>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role FROM staff_members WHERE tenant_id = ?1 AND address = ?2",
                params![tenant_id, address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_canonical_identity: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_canonical_identity row: {e}")))?
        {
            Some(row) => {
                let role: String = row.get(0).map_err(col_err("find_canonical_identity"))?;
                Ok(role.parse().ok())
            }
            None => Ok(None),
        }
    }

    async fn list_registered_staff(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<StaffMember>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, role, name, known_aliases FROM staff_members \
                 WHERE tenant_id = ?1 ORDER BY address",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_registered_staff: {e}")))?;

        let err = col_err("list_registered_staff");
        let mut staff = Vec::new();
        while let Some(row) = rows.next().await.map_err(&err)? {
            let role: String = row.get(1).map_err(&err)?;
            let Ok(role) = role.parse::<StaffRole>() else {
                tracing::warn!(role = %role, "Skipping staff row with unknown role");
                continue;
            };
            let aliases: String = row.get(3).map_err(&err)?;
            staff.push(StaffMember {
                address: row.get(0).map_err(&err)?,
                role,
                name: row.get(2).ok(),
                known_aliases: serde_json::from_str(&aliases).unwrap_or_default(),
            });
        }
        Ok(staff)
    }

    async fn upsert_staff(
        &self,
        tenant_id: &str,
        member: StaffMember,
    ) -> Result<(), DatabaseError> {
        let aliases = serde_json::to_string(&member.known_aliases)
            .map_err(|e| DatabaseError::Serialization(format!("known_aliases: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO staff_members (tenant_id, address, role, name, known_aliases) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(tenant_id, address) DO UPDATE SET \
                 role = excluded.role, name = excluded.name, known_aliases = excluded.known_aliases",
                params![
                    tenant_id,
                    member.address,
                    member.role.as_str(),
                    opt_text(member.name.as_deref()),
                    aliases,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_staff: {e}")))?;
        Ok(())
    }

    async fn find_alias_link(
        &self,
        tenant_id: &str,
        alias: &str,
    ) -> Result<Option<AliasLink>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT canonical, source, created_at FROM alias_links \
                 WHERE tenant_id = ?1 AND alias = ?2",
                params![tenant_id, alias],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_alias_link: {e}")))?;

        let err = col_err("find_alias_link");
        match rows.next().await.map_err(&err)? {
            Some(row) => {
                let source: String = row.get(1).map_err(&err)?;
                let created: String = row.get(2).map_err(&err)?;
                Ok(Some(AliasLink {
                    tenant_id: tenant_id.to_string(),
                    alias: alias.to_string(),
                    canonical: row.get(0).map_err(&err)?,
                    source: LinkSource::parse(&source),
                    created_at: parse_datetime(&created),
                }))
            }
            None => Ok(None),
        }
    }

    async fn list_alias_links(
        &self,
        tenant_id: &str,
        canonical: &str,
    ) -> Result<Vec<AliasLink>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT alias, source, created_at FROM alias_links \
                 WHERE tenant_id = ?1 AND canonical = ?2 ORDER BY created_at",
                params![tenant_id, canonical],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_alias_links: {e}")))?;

        let err = col_err("list_alias_links");
        let mut links = Vec::new();
        while let Some(row) = rows.next().await.map_err(&err)? {
            let source: String = row.get(1).map_err(&err)?;
            let created: String = row.get(2).map_err(&err)?;
            links.push(AliasLink {
                tenant_id: tenant_id.to_string(),
                alias: row.get(0).map_err(&err)?,
                canonical: canonical.to_string(),
                source: LinkSource::parse(&source),
                created_at: parse_datetime(&created),
            });
        }
        Ok(links)
    }

    async fn save_alias_link(&self, link: AliasLink) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO alias_links (tenant_id, alias, canonical, source, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(tenant_id, alias) DO UPDATE SET \
                 canonical = excluded.canonical, source = excluded.source, created_at = excluded.created_at",
                params![
                    link.tenant_id,
                    link.alias,
                    link.canonical,
                    link.source.as_str(),
                    link.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_alias_link: {e}")))?;
        Ok(())
    }

    // ── Records ─────────────────────────────────────────────────────

    async fn create_record(
        &self,
        tenant_id: &str,
        draft_key: &str,
        draft: &RecordDraft,
    ) -> Result<String, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO records (id, tenant_id, draft_key, make, model, year, price, \
                 color, mileage_km, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'available', ?10, ?10)",
                params![
                    new_record_id(),
                    tenant_id,
                    draft_key,
                    draft.make.clone(),
                    draft.model.clone(),
                    draft.year as i64,
                    draft.price.to_string(),
                    opt_text(draft.color.as_deref()),
                    opt_int(draft.mileage_km.map(i64::from)),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_record: {e}")))?;

        // Read back by draft key: returns the first insert's id on replay.
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM records WHERE tenant_id = ?1 AND draft_key = ?2",
                params![tenant_id, draft_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_record lookup: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_record row: {e}")))?
            .ok_or_else(|| DatabaseError::Constraint(format!("record for draft {draft_key} missing")))?;
        row.get::<String>(0).map_err(col_err("create_record id"))
    }

    async fn get_record(
        &self,
        tenant_id: &str,
        record_id: &str,
    ) -> Result<Option<Record>, DatabaseError> {
        let records = self
            .query_records(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE tenant_id = ?1 AND id = ?2 COLLATE NOCASE"
                ),
                params![tenant_id, record_id],
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn attach_file_to_record(
        &self,
        tenant_id: &str,
        record_id: &str,
        file_ref: &str,
    ) -> Result<(), DatabaseError> {
        let record = self
            .get_record(tenant_id, record_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "record".into(),
                id: record_id.to_string(),
            })?;
        if record.photos.iter().any(|p| p == file_ref) {
            return Ok(());
        }

        self.conn()
            .execute(
                "INSERT INTO record_photos (record_id, position, file_ref) VALUES (?1, ?2, ?3)",
                params![record.id.clone(), record.photos.len() as i64, file_ref],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("attach_file_to_record: {e}")))?;
        self.conn()
            .execute(
                "UPDATE records SET updated_at = ?2 WHERE id = ?1",
                params![record.id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("attach_file_to_record touch: {e}")))?;
        Ok(())
    }

    async fn update_record(
        &self,
        tenant_id: &str,
        record_id: &str,
        update: &RecordUpdate,
    ) -> Result<(), DatabaseError> {
        let (column, value) = match update {
            RecordUpdate::Make(v) => ("make", libsql::Value::Text(v.clone())),
            RecordUpdate::Model(v) => ("model", libsql::Value::Text(v.clone())),
            RecordUpdate::Year(v) => ("year", libsql::Value::Integer(i64::from(*v))),
            RecordUpdate::Price(v) => ("price", libsql::Value::Text(v.to_string())),
            RecordUpdate::Color(v) => ("color", libsql::Value::Text(v.clone())),
            RecordUpdate::Mileage(v) => ("mileage_km", libsql::Value::Integer(i64::from(*v))),
            RecordUpdate::Status(v) => ("status", libsql::Value::Text(v.as_str().to_string())),
        };

        let changed = self
            .conn()
            .execute(
                &format!(
                    "UPDATE records SET {column} = ?3, updated_at = ?4 \
                     WHERE tenant_id = ?1 AND id = ?2 COLLATE NOCASE"
                ),
                params![tenant_id, record_id, value, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_record: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "record".into(),
                id: record_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_records(
        &self,
        tenant_id: &str,
        status: Option<RecordStatus>,
        limit: usize,
    ) -> Result<Vec<Record>, DatabaseError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE tenant_id = ?1 \
                 AND (?2 IS NULL OR status = ?2) ORDER BY created_at DESC, rowid DESC LIMIT ?3"
            ),
            params![
                tenant_id,
                opt_text(status.as_ref().map(RecordStatus::as_str)),
                limit as i64
            ],
        )
        .await
    }

    async fn record_stats(&self, tenant_id: &str) -> Result<RecordStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM records WHERE tenant_id = ?1 GROUP BY status",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_stats: {e}")))?;

        let err = col_err("record_stats");
        let mut stats = RecordStats::default();
        while let Some(row) = rows.next().await.map_err(&err)? {
            let status: String = row.get(0).map_err(&err)?;
            let count = row.get::<i64>(1).map_err(&err)? as usize;
            match status.parse::<RecordStatus>() {
                Ok(RecordStatus::Available) => stats.available += count,
                Ok(RecordStatus::Booked) => stats.booked += count,
                Ok(RecordStatus::Sold) => stats.sold += count,
                Err(_) => {}
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
            color: Some("Hitam".into()),
            mileage_km: Some(45000),
        }
    }

    #[tokio::test]
    async fn conversation_roundtrip_with_flow() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let conv = store
            .create_conversation(NewConversation {
                tenant_id: "t1".into(),
                channel_account: "620000".into(),
                participant: "6281".into(),
                is_staff: false,
                staff_role: None,
                linked_canonical: None,
            })
            .await
            .unwrap();
        assert_eq!(conv.flow, FlowContext::default());

        let flow = FlowContext::CollectingAttachments {
            record_id: "AB12CD34".into(),
            photos: vec!["p1".into()],
        };
        store
            .update_conversation(
                &conv.id,
                &ConversationPatch {
                    flow: Some(flow.clone()),
                    is_staff: Some(true),
                    staff_role: Some(StaffRole::Manager),
                    last_intent: Some("staff_upload".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let loaded = store.get_conversation("t1", "620000", "6281").await.unwrap().unwrap();
        assert_eq!(loaded.flow, flow);
        assert!(loaded.is_staff);
        assert_eq!(loaded.staff_role, Some(StaffRole::Manager));
        assert_eq!(loaded.last_intent.as_deref(), Some("staff_upload"));
    }

    #[tokio::test]
    async fn message_backfill() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let conv = store
            .create_conversation(NewConversation {
                tenant_id: "t1".into(),
                channel_account: "620000".into(),
                participant: "6281".into(),
                is_staff: false,
                staff_role: None,
                linked_canonical: None,
            })
            .await
            .unwrap();
        let id = store
            .append_message(NewMessage::inbound("t1", &conv.id, "6281", "halo", None))
            .await
            .unwrap();
        store
            .update_message_classification(&id, "customer_greeting", 0.9, SenderKind::Customer, None)
            .await
            .unwrap();

        let messages = store.recent_messages(&conv.id, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].intent.as_deref(), Some("customer_greeting"));
        assert_eq!(messages[0].status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn staff_and_alias_links() {
        let store = LibSqlStore::new_memory().await.unwrap();
        store
            .upsert_staff(
                "t1",
                StaffMember {
                    address: "6281".into(),
                    role: StaffRole::Owner,
                    name: Some("Sari".into()),
                    known_aliases: vec!["99@lid".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.find_canonical_identity("t1", "6281").await.unwrap(),
            Some(StaffRole::Owner)
        );
        let staff = store.list_registered_staff("t1").await.unwrap();
        assert_eq!(staff[0].known_aliases, vec!["99@lid".to_string()]);

        let link = AliasLink {
            tenant_id: "t1".into(),
            alias: "99@lid".into(),
            canonical: "6281".into(),
            source: LinkSource::Recency,
            created_at: Utc::now(),
        };
        store.save_alias_link(link.clone()).await.unwrap();
        store
            .save_alias_link(AliasLink {
                source: LinkSource::Verified,
                ..link
            })
            .await
            .unwrap();
        let found = store.find_alias_link("t1", "99@lid").await.unwrap().unwrap();
        assert_eq!(found.source, LinkSource::Verified);
        assert_eq!(store.list_alias_links("t1", "6281").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn records_are_idempotent_and_collect_photos() {
        let dir = tempfile::tempdir().unwrap();
        let store = LibSqlStore::new_local(&dir.path().join("orchestrator.db"))
            .await
            .unwrap();

        let id = store.create_record("t1", "draft-1", &draft()).await.unwrap();
        let again = store.create_record("t1", "draft-1", &draft()).await.unwrap();
        assert_eq!(id, again);

        store.attach_file_to_record("t1", &id, "p1").await.unwrap();
        store.attach_file_to_record("t1", &id, "p2").await.unwrap();
        store.attach_file_to_record("t1", &id, "p1").await.unwrap();
        let record = store.get_record("t1", &id.to_lowercase()).await.unwrap().unwrap();
        assert_eq!(record.photos, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(record.price, dec!(150000000));
        assert_eq!(record.mileage_km, Some(45000));

        store
            .update_record("t1", &id, &RecordUpdate::Status(RecordStatus::Booked))
            .await
            .unwrap();
        let stats = store.record_stats("t1").await.unwrap();
        assert_eq!(stats.booked, 1);
        let booked = store
            .list_records("t1", Some(RecordStatus::Booked), 10)
            .await
            .unwrap();
        assert_eq!(booked.len(), 1);

        let missing = store.attach_file_to_record("t1", "NOPE", "p3").await;
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }
}
