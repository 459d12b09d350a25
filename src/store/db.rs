use std::path::{Path, PathBuf};

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::ContextError;

use super::migrations;
use super::types::{
    CompactionEvent, CompactionStrategy, FileMode, FileReference, MessageRecord, Role,
    SessionConfig, SessionRecord, SessionSummary, SessionUpdate,
};

/// Current timestamp in the store's canonical text format.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed persistence for sessions, messages, file references,
/// compaction audit, and embeddings.
///
/// Connections are acquired per operation and dropped on return; every
/// handle has foreign keys enabled, so CASCADE deletes always apply.
/// Multi-row mutations run inside a single transaction.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Open (or create) the database at `path`, running any pending schema
    /// migrations first. A migration failure refuses the open and names the
    /// pre-migration backup file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        migrations::ensure_schema(&path)?;
        harden_permissions(&path)?;
        Ok(Self { path })
    }

    /// Open the database at the platform-default location:
    /// `%APPDATA%\vesper\sessions.db` on Windows,
    /// `~/.config/vesper/sessions.db` elsewhere.
    pub fn open_default() -> Result<Self, ContextError> {
        let base = dirs::config_dir().ok_or_else(|| {
            ContextError::InvalidArgument("no config directory on this platform".into())
        })?;
        Self::open(base.join("vesper").join("sessions.db"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection, ContextError> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(conn)
    }

    // -- sessions ----------------------------------------------------------

    pub fn create_session(&self, config: &SessionConfig) -> Result<(), ContextError> {
        let now = now_timestamp();
        let result = self.conn()?.execute(
            "INSERT INTO sessions (session_id, context, created_at, last_used,
                 max_context_tokens, history_json, metadata_json, model_name, system_prompt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                config.id,
                config.context,
                now,
                now,
                config.max_context_tokens,
                config.history_json,
                config.metadata_json,
                config.model_name,
                config.system_prompt,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(ContextError::InvalidArgument(format!(
                "session already exists: {}",
                config.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, ContextError> {
        let record = self
            .conn()?
            .query_row(
                "SELECT session_id, context, created_at, last_used, max_context_tokens,
                        history_json, metadata_json, model_name, system_prompt
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        context: row.get(1)?,
                        created_at: row.get(2)?,
                        last_used: row.get(3)?,
                        max_context_tokens: row.get(4)?,
                        history_json: row.get(5)?,
                        metadata_json: row.get(6)?,
                        model_name: row.get(7)?,
                        system_prompt: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Apply a set of field updates to a session. The updatable columns are
    /// the closed `SessionUpdate` enum — there is no string-keyed path into
    /// the schema.
    pub fn update_session(
        &self,
        session_id: &str,
        updates: &[SessionUpdate],
    ) -> Result<(), ContextError> {
        if updates.is_empty() {
            return Ok(());
        }
        let set_clause = updates
            .iter()
            .enumerate()
            .map(|(i, u)| format!("{} = ?{}", u.column(), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE sessions SET {set_clause} WHERE session_id = ?{}",
            updates.len() + 1
        );

        let values: Vec<Box<dyn rusqlite::ToSql + '_>> = updates.iter().map(|u| u.value()).collect();
        let mut bound: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        bound.push(&session_id as &dyn rusqlite::ToSql);

        let affected = self.conn()?.execute(&sql, bound.as_slice())?;
        if affected == 0 {
            return Err(ContextError::NotFound(format!("session: {session_id}")));
        }
        Ok(())
    }

    pub fn touch_session(&self, session_id: &str) -> Result<(), ContextError> {
        self.update_session(session_id, &[SessionUpdate::LastUsed(now_timestamp())])
    }

    /// Delete a session and, via CASCADE, all its messages, file
    /// references, embeddings, and compaction history.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, ContextError> {
        let affected = self
            .conn()?
            .execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;
        Ok(affected > 0)
    }

    pub fn list_sessions(&self, limit: Option<usize>) -> Result<Vec<SessionSummary>, ContextError> {
        if limit == Some(0) {
            return Err(ContextError::InvalidArgument(
                "list limit must be positive".into(),
            ));
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, created_at, last_used, max_context_tokens, model_name
             FROM sessions ORDER BY last_used DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.map(|l| l as i64).unwrap_or(-1)], |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                created_at: row.get(1)?,
                last_used: row.get(2)?,
                max_context_tokens: row.get(3)?,
                model_name: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn session_count(&self) -> Result<i64, ContextError> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
    }

    /// Delete sessions whose `last_used` is older than `days` days.
    /// Returns the number of sessions removed.
    pub fn purge_sessions(&self, days: i64) -> Result<usize, ContextError> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339_opts(SecondsFormat::Micros, true);
        let affected = self
            .conn()?
            .execute("DELETE FROM sessions WHERE last_used < ?1", params![cutoff])?;
        debug!(days, purged = affected, "purged old sessions");
        Ok(affected)
    }

    // -- messages ----------------------------------------------------------

    pub fn save_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tokens: i64,
        timestamp: Option<&str>,
        is_summary: bool,
    ) -> Result<i64, ContextError> {
        if tokens < 0 {
            return Err(ContextError::InvalidArgument(
                "message tokens must be non-negative".into(),
            ));
        }
        let ts = timestamp.map(str::to_string).unwrap_or_else(now_timestamp);
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO messages (session_id, role, content, tokens, timestamp, is_summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, role.as_str(), content, tokens, ts, is_summary],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => {
                Err(ContextError::NotFound(format!("session: {session_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load messages in insertion order. `limit` restricts to the newest N
    /// (still returned oldest-first); `include_summaries = false` filters
    /// out summary rows.
    pub fn load_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
        include_summaries: bool,
    ) -> Result<Vec<MessageRecord>, ContextError> {
        let summary_filter = if include_summaries { "" } else { " AND is_summary = 0" };
        let sql = format!(
            "SELECT id, role, content, tokens, timestamp, is_summary FROM (
                 SELECT id, role, content, tokens, timestamp, is_summary
                 FROM messages WHERE session_id = ?1{summary_filter}
                 ORDER BY timestamp DESC, id DESC LIMIT ?2)
             ORDER BY timestamp ASC, id ASC"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![session_id, limit.map(|l| l as i64).unwrap_or(-1)],
            row_to_message,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Delete the given messages (one transaction). File references and
    /// embeddings cascade. Returns the number of rows removed.
    pub fn delete_messages(&self, ids: &[i64]) -> Result<usize, ContextError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let placeholders = placeholders(ids.len());
        let sql = format!("DELETE FROM messages WHERE id IN ({placeholders})");
        let bound: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let affected = tx.execute(&sql, bound.as_slice())?;
        tx.commit()?;
        Ok(affected)
    }

    /// Delete messages older than `before`, always sparing the `keep_count`
    /// newest (which may overlap the cutoff).
    pub fn delete_messages_before(
        &self,
        session_id: &str,
        before: &str,
        keep_count: usize,
    ) -> Result<usize, ContextError> {
        let affected = self.conn()?.execute(
            "DELETE FROM messages
             WHERE session_id = ?1 AND timestamp < ?2
               AND id NOT IN (
                   SELECT id FROM messages WHERE session_id = ?1
                   ORDER BY timestamp DESC, id DESC LIMIT ?3)",
            params![session_id, before, keep_count as i64],
        )?;
        Ok(affected)
    }

    /// Sum of live message tokens — the accounting view the threshold
    /// ladder reads.
    pub fn get_message_tokens(&self, session_id: &str) -> Result<i64, ContextError> {
        Ok(self.conn()?.query_row(
            "SELECT COALESCE(SUM(tokens), 0) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    /// Atomically delete `delete_ids` and insert the replacement summary
    /// message. One transaction: the session is observed either fully
    /// pre- or fully post-swap.
    pub fn replace_with_summary(
        &self,
        session_id: &str,
        delete_ids: &[i64],
        content: &str,
        tokens: i64,
    ) -> Result<i64, ContextError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if !delete_ids.is_empty() {
            let sql = format!(
                "DELETE FROM messages WHERE id IN ({})",
                placeholders(delete_ids.len())
            );
            let bound: Vec<&dyn rusqlite::ToSql> =
                delete_ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
            tx.execute(&sql, bound.as_slice())?;
        }
        tx.execute(
            "INSERT INTO messages (session_id, role, content, tokens, timestamp, is_summary)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![session_id, Role::System.as_str(), content, tokens, now_timestamp()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    // -- file references ---------------------------------------------------

    pub fn track_file_reference(
        &self,
        message_id: i64,
        file_path: &str,
        mode: FileMode,
        tokens: i64,
    ) -> Result<i64, ContextError> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO file_references (message_id, file_path, mode, tokens)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, file_path, mode.as_str(), tokens],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => {
                Err(ContextError::NotFound(format!("message: {message_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// References for a session, newest first, optionally restricted to one
    /// file path.
    pub fn get_file_references(
        &self,
        session_id: &str,
        file_path: Option<&str>,
    ) -> Result<Vec<FileReference>, ContextError> {
        let path_filter = if file_path.is_some() { " AND fr.file_path = ?2" } else { "" };
        let sql = format!(
            "SELECT fr.id, fr.message_id, fr.file_path, fr.mode, fr.tokens
             FROM file_references fr
             JOIN messages m ON m.id = fr.message_id
             WHERE m.session_id = ?1{path_filter}
             ORDER BY m.timestamp DESC, fr.id DESC"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = match file_path {
            Some(path) => stmt.query_map(params![session_id, path], row_to_file_reference)?,
            None => stmt.query_map(params![session_id], row_to_file_reference)?,
        };
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Per file, the most recent reference whose owning message is *not*
    /// among the session's `recent_n` newest messages. A file that also
    /// appears inside the recent window is live and excluded. Optionally
    /// filtered to a single mode.
    pub fn get_stale_files(
        &self,
        session_id: &str,
        recent_n: usize,
        mode_filter: Option<FileMode>,
    ) -> Result<Vec<FileReference>, ContextError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT fr.id, fr.message_id, fr.file_path, fr.mode, fr.tokens,
                    fr.message_id IN (
                        SELECT id FROM messages WHERE session_id = ?1
                        ORDER BY timestamp DESC, id DESC LIMIT ?2) AS live
             FROM file_references fr
             JOIN messages m ON m.id = fr.message_id
             WHERE m.session_id = ?1
             ORDER BY m.timestamp DESC, fr.id DESC",
        )?;
        let rows = stmt.query_map(params![session_id, recent_n as i64], |row| {
            let reference = row_to_file_reference(row)?;
            let live: bool = row.get(5)?;
            Ok((reference, live))
        })?;

        let mut seen = std::collections::HashSet::new();
        let mut stale = Vec::new();
        for row in rows {
            let (reference, live) = row?;
            // Rows arrive newest-first, so the first hit per path is the
            // file's most recent reference.
            if !seen.insert(reference.file_path.clone()) {
                continue;
            }
            if live {
                continue;
            }
            if mode_filter.is_some_and(|m| m != reference.mode) {
                continue;
            }
            stale.push(reference);
        }
        Ok(stale)
    }

    /// Change a reference's presentation mode and token budget. The owning
    /// message's token count absorbs the same delta in the same
    /// transaction, so the per-session aggregate stays exact.
    pub fn update_file_reference_mode(
        &self,
        ref_id: i64,
        new_mode: FileMode,
        new_tokens: i64,
    ) -> Result<(), ContextError> {
        if new_tokens < 0 {
            return Err(ContextError::InvalidArgument(
                "reference tokens must be non-negative".into(),
            ));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let row = tx
            .query_row(
                "SELECT message_id, tokens FROM file_references WHERE id = ?1",
                params![ref_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((message_id, old_tokens)) = row else {
            return Err(ContextError::NotFound(format!("file reference: {ref_id}")));
        };
        tx.execute(
            "UPDATE file_references SET mode = ?1, tokens = ?2 WHERE id = ?3",
            params![new_mode.as_str(), new_tokens, ref_id],
        )?;
        tx.execute(
            "UPDATE messages SET tokens = MAX(0, tokens - ?1) WHERE id = ?2",
            params![old_tokens - new_tokens, message_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -- compaction audit --------------------------------------------------

    pub fn record_compaction(
        &self,
        session_id: &str,
        level: i64,
        tokens_before: i64,
        tokens_after: i64,
        strategy: CompactionStrategy,
        details: Option<&str>,
    ) -> Result<i64, ContextError> {
        if !(1..=3).contains(&level) {
            return Err(ContextError::InvalidArgument(format!(
                "compaction level must be 1..=3, got {level}"
            )));
        }
        if tokens_after > tokens_before {
            return Err(ContextError::Invariant(format!(
                "compaction grew the session: {tokens_before} -> {tokens_after}"
            )));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO compaction_history
                 (session_id, timestamp, level, tokens_before, tokens_after, tokens_freed,
                  strategy, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                now_timestamp(),
                level,
                tokens_before,
                tokens_after,
                tokens_before - tokens_after,
                strategy.as_str(),
                details,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Audit trail, newest first.
    pub fn get_compaction_history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CompactionEvent>, ContextError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, level, tokens_before, tokens_after, tokens_freed,
                    strategy, details
             FROM compaction_history WHERE session_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![session_id, limit.map(|l| l as i64).unwrap_or(-1)],
            row_to_compaction,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_total_tokens_freed(&self, session_id: &str) -> Result<i64, ContextError> {
        Ok(self.conn()?.query_row(
            "SELECT COALESCE(SUM(tokens_freed), 0) FROM compaction_history WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?)
    }

    pub fn get_last_compaction(
        &self,
        session_id: &str,
    ) -> Result<Option<CompactionEvent>, ContextError> {
        Ok(self.get_compaction_history(session_id, Some(1))?.into_iter().next())
    }

    // -- embeddings --------------------------------------------------------

    pub fn save_embedding(
        &self,
        message_id: i64,
        model: &str,
        vector: &[f32],
    ) -> Result<i64, ContextError> {
        let blob = encode_vector(vector);
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO embeddings (message_id, model, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![message_id, model, blob, now_timestamp()],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => {
                Err(ContextError::NotFound(format!("message: {message_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Latest stored embedding for a message, optionally pinned to one
    /// model. A message may hold vectors from several models; the newest
    /// wins.
    pub fn get_embedding(
        &self,
        message_id: i64,
        model: Option<&str>,
    ) -> Result<Option<Vec<f32>>, ContextError> {
        let model_filter = if model.is_some() { " AND model = ?2" } else { "" };
        let sql = format!(
            "SELECT embedding FROM embeddings WHERE message_id = ?1{model_filter}
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let conn = self.conn()?;
        let blob: Option<Vec<u8>> = match model {
            Some(m) => conn
                .query_row(&sql, params![message_id, m], |row| row.get(0))
                .optional()?,
            None => conn
                .query_row(&sql, params![message_id], |row| row.get(0))
                .optional()?,
        };
        Ok(blob.map(|b| decode_vector(&b)))
    }

    pub fn has_embedding(&self, message_id: i64, model: Option<&str>) -> Result<bool, ContextError> {
        Ok(self.get_embedding(message_id, model)?.is_some())
    }

    pub fn delete_embeddings(&self, message_id: i64) -> Result<usize, ContextError> {
        Ok(self
            .conn()?
            .execute("DELETE FROM embeddings WHERE message_id = ?1", params![message_id])?)
    }

    pub fn embedding_count(&self) -> Result<i64, ContextError> {
        Ok(self
            .conn()?
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get(1)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        role: Role::from_db(&role)?,
        content: row.get(2)?,
        tokens: row.get(3)?,
        timestamp: row.get(4)?,
        is_summary: row.get(5)?,
    })
}

fn row_to_file_reference(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileReference> {
    let mode: String = row.get(3)?;
    Ok(FileReference {
        id: row.get(0)?,
        message_id: row.get(1)?,
        file_path: row.get(2)?,
        mode: FileMode::from_db(&mode)?,
        tokens: row.get(4)?,
    })
}

fn row_to_compaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompactionEvent> {
    let strategy: String = row.get(6)?;
    Ok(CompactionEvent {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        level: row.get(2)?,
        tokens_before: row.get(3)?,
        tokens_after: row.get(4)?,
        tokens_freed: row.get(5)?,
        strategy: CompactionStrategy::from_db(&strategy)?,
        details: row.get(7)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(unix)]
fn harden_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn harden_permissions(_path: &Path) -> std::io::Result<()> {
    // Windows: the user-profile ACL already restricts access.
    Ok(())
}
