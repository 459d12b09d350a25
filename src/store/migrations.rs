//! Schema versioning. V1 is the legacy layout: a lone `sessions` table with
//! conversation history serialized into `history_json`. V2 adds messages,
//! file references, compaction audit, and embeddings, and replays each
//! session's legacy history into message rows.

use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::ContextError;
use crate::tokens::estimate_tokens;

pub(crate) const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    context TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    last_used TEXT NOT NULL DEFAULT (datetime('now')),
    max_context_tokens INTEGER NOT NULL DEFAULT 64000,
    history_json TEXT,
    metadata_json TEXT,
    model_name TEXT,
    system_prompt TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_last_used ON sessions(last_used);
CREATE INDEX IF NOT EXISTS idx_sessions_model ON sessions(model_name);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tokens INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL,
    is_summary INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, timestamp);

CREATE TABLE IF NOT EXISTS file_references (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    mode TEXT NOT NULL,
    tokens INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_file_references_message ON file_references(message_id);

CREATE TABLE IF NOT EXISTS compaction_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    level INTEGER NOT NULL,
    tokens_before INTEGER NOT NULL,
    tokens_after INTEGER NOT NULL,
    tokens_freed INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    details TEXT
);

CREATE INDEX IF NOT EXISTS idx_compaction_session ON compaction_history(session_id, timestamp);

CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    model TEXT NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_message ON embeddings(message_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Bring the database at `path` to the current schema version, creating it
/// if absent. Upgrades copy the file to a timestamped `.backup.` sibling
/// first and run inside a single transaction.
pub(crate) fn ensure_schema(path: &Path) -> Result<(), ContextError> {
    let mut conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", true)?;

    let version = detect_version(&conn)?;
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    if version == 0 {
        // Fresh database: create the current layout directly, no backup.
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        tx.commit()?;
        return Ok(());
    }

    let backup = backup_path(path);
    std::fs::copy(path, &backup)?;
    info!(from = version, to = SCHEMA_VERSION, backup = %backup, "migrating schema");

    let tx = conn.transaction().map_err(|e| migration_error(&backup, e))?;
    if version < 2 {
        migrate_v1_to_v2(&tx).map_err(|e| migration_error(&backup, e))?;
    }
    tx.execute("DELETE FROM schema_version", [])
        .map_err(|e| migration_error(&backup, e))?;
    tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])
        .map_err(|e| migration_error(&backup, e))?;
    tx.commit().map_err(|e| migration_error(&backup, e))?;
    Ok(())
}

/// Version of an existing database. No version table but a `sessions` table
/// means V1; a bare file is 0 (fresh).
fn detect_version(conn: &Connection) -> Result<i64, ContextError> {
    if table_exists(conn, "schema_version")? {
        let version: Option<i64> =
            conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        return Ok(version.unwrap_or(0));
    }
    if table_exists(conn, "sessions")? {
        return Ok(1);
    }
    Ok(0)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, ContextError> {
    Ok(conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Create the V2 tables and replay legacy serialized history into message
/// rows, preserving insertion order with synthesized timestamps. The legacy
/// blob stays in place; sessions that already have message rows are skipped,
/// so replaying twice is harmless.
fn migrate_v1_to_v2(tx: &rusqlite::Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(SCHEMA)?;

    let sessions: Vec<(String, String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT session_id, created_at, history_json FROM sessions
             WHERE history_json IS NOT NULL AND history_json != ''",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    for (session_id, created_at, history_json) in sessions {
        let already_migrated: bool = tx
            .query_row(
                "SELECT 1 FROM messages WHERE session_id = ?1 LIMIT 1",
                params![&session_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if already_migrated {
            continue;
        }

        let entries = match parse_legacy_history(&history_json) {
            Some(entries) => entries,
            None => {
                warn!(session = %session_id, "unparseable legacy history, leaving blob in place");
                continue;
            }
        };

        let base = DateTime::parse_from_rfc3339(&created_at)
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        for (i, (role, content)) in entries.iter().enumerate() {
            let ts = (base + Duration::seconds(i as i64))
                .to_rfc3339_opts(SecondsFormat::Micros, true);
            tx.execute(
                "INSERT INTO messages (session_id, role, content, tokens, timestamp, is_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![&session_id, role, content, estimate_tokens(content), ts],
            )?;
        }
        info!(session = %session_id, messages = entries.len(), "replayed legacy history");
    }

    Ok(())
}

/// Legacy history is either a bare JSON array of `{role, content}` objects
/// or wrapped as `{"messages": [...]}`.
fn parse_legacy_history(history_json: &str) -> Option<Vec<(String, String)>> {
    let value: serde_json::Value = serde_json::from_str(history_json).ok()?;
    let entries = match &value {
        serde_json::Value::Array(entries) => entries,
        serde_json::Value::Object(map) => map.get("messages")?.as_array()?,
        _ => return None,
    };
    Some(
        entries
            .iter()
            .map(|entry| {
                let role = match entry.get("role").and_then(|r| r.as_str()) {
                    Some("assistant") => "assistant",
                    Some("system") => "system",
                    _ => "user",
                };
                let content = entry
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default();
                (role.to_string(), content.to_string())
            })
            .collect(),
    )
}

fn backup_path(path: &Path) -> String {
    format!(
        "{}.backup.{}",
        path.display(),
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

fn migration_error(backup: &str, cause: rusqlite::Error) -> ContextError {
    ContextError::Migration {
        reason: cause.to_string(),
        backup: backup.to_string(),
    }
}
