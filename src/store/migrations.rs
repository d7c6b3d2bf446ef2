//! Schema migrations for the libSQL backend.
//!
//! Versions are applied in order, each in its own transaction together with
//! its `schema_migrations` row, so a crash never leaves a half-applied step.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; never edit a released step.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "conversations_and_messages",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                channel_account TEXT NOT NULL,
                participant TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                flow TEXT NOT NULL DEFAULT '{"state":"idle"}',
                is_staff INTEGER NOT NULL DEFAULT 0,
                staff_role TEXT,
                linked_canonical TEXT,
                last_intent TEXT,
                created_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_participant
                ON conversations(tenant_id, channel_account, participant, status);
            CREATE INDEX IF NOT EXISTS idx_conversations_last_message
                ON conversations(tenant_id, channel_account, last_message_at);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                direction TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                attachment TEXT,
                intent TEXT,
                confidence REAL,
                sender_kind TEXT NOT NULL,
                sender_level TEXT,
                status TEXT NOT NULL,
                gateway_message_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "identity_registry",
        sql: r#"
            CREATE TABLE IF NOT EXISTS staff_members (
                tenant_id TEXT NOT NULL,
                address TEXT NOT NULL,
                role TEXT NOT NULL,
                name TEXT,
                known_aliases TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (tenant_id, address)
            );

            CREATE TABLE IF NOT EXISTS alias_links (
                tenant_id TEXT NOT NULL,
                alias TEXT NOT NULL,
                canonical TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, alias)
            );
            CREATE INDEX IF NOT EXISTS idx_alias_links_canonical
                ON alias_links(tenant_id, canonical);
        "#,
    },
    Migration {
        version: 3,
        name: "records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                draft_key TEXT NOT NULL,
                make TEXT NOT NULL,
                model TEXT NOT NULL,
                year INTEGER NOT NULL,
                price TEXT NOT NULL,
                color TEXT,
                mileage_km INTEGER,
                status TEXT NOT NULL DEFAULT 'available',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, draft_key)
            );
            CREATE INDEX IF NOT EXISTS idx_records_status ON records(tenant_id, status);

            CREATE TABLE IF NOT EXISTS record_photos (
                record_id TEXT NOT NULL REFERENCES records(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                file_ref TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (record_id, position)
            );
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn migrate(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_migrations: {e}")))?;

    let applied = applied_version(conn).await?;
    for step in MIGRATIONS.iter().filter(|m| m.version > applied) {
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // The failed batch may have left a transaction open.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "v{} {}: {e}",
                step.version, step.name
            )));
        }
        tracing::info!(version = step.version, name = step.name, "Schema migrated");
    }
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(e.to_string())),
        None => Ok(0),
    }
}
