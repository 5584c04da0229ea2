//! Stable local user identities.
//!
//! One row per (provider, external id, instance). The row carries the cached
//! agent-side user id from prior interactions; the cache is scoped to the
//! session prefix so an instance switch never leaks identity across tenants.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const PRAGMA_SQL: &str =
    "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
    id                 TEXT PRIMARY KEY,
    provider           TEXT NOT NULL,
    external_id        TEXT NOT NULL,
    instance_name      TEXT NOT NULL,
    display_name       TEXT,
    last_session_name  TEXT,
    last_agent_user_id TEXT,
    message_count      INTEGER NOT NULL DEFAULT 0,
    last_seen_at       TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    UNIQUE (provider, external_id, instance_name)
);";

/// A resolved local user, as seen before this message was applied.
#[derive(Debug, Clone)]
pub struct LocalUser {
    pub id: String,
    /// Agent-side user id valid for the current session prefix, if any.
    pub cached_agent_user_id: Option<String>,
    pub message_count: i64,
}

/// SQLite-backed user identity store.
pub struct UserStore {
    conn: Arc<Mutex<Connection>>,
}

impl UserStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open user db {}", path.display()))?;
        conn.execute_batch(PRAGMA_SQL)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Resolve (or create) the local user for a sender and record this
    /// interaction.
    ///
    /// The returned `cached_agent_user_id` is only populated when the stored
    /// session shares a prefix with `session_name` — a different prefix means
    /// the user moved to another instance, and the stale agent id is cleared
    /// rather than reused.
    pub fn resolve(
        &self,
        provider: &str,
        external_id: &str,
        instance_name: &str,
        display_name: Option<&str>,
        session_name: &str,
    ) -> Result<LocalUser> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();

        let existing: Option<(String, Option<String>, Option<String>, i64)> = conn
            .query_row(
                "SELECT id, last_session_name, last_agent_user_id, message_count
                 FROM users
                 WHERE provider = ?1 AND external_id = ?2 AND instance_name = ?3",
                params![provider, external_id, instance_name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()?;

        if let Some((id, last_session, last_agent_id, message_count)) = existing {
            let same_prefix = match &last_session {
                Some(stored) => session_prefix(stored) == session_prefix(session_name),
                None => false,
            };
            let cached = if same_prefix { last_agent_id } else { None };
            if !same_prefix {
                tracing::info!(
                    user = %id,
                    "instance switch detected ({:?} -> {}), clearing cached agent user id",
                    last_session.as_deref().map(session_prefix),
                    session_prefix(session_name)
                );
            }

            conn.execute(
                "UPDATE users SET
                    display_name = COALESCE(?1, display_name),
                    last_session_name = ?2,
                    last_agent_user_id = ?3,
                    message_count = message_count + 1,
                    last_seen_at = ?4
                 WHERE id = ?5",
                params![display_name, session_name, cached, now, id],
            )?;

            return Ok(LocalUser {
                id,
                cached_agent_user_id: cached,
                message_count: message_count + 1,
            });
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO users (
                id, provider, external_id, instance_name, display_name,
                last_session_name, message_count, last_seen_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
            params![id, provider, external_id, instance_name, display_name, session_name, now],
        )
        .context("failed to insert user row")?;

        Ok(LocalUser {
            id,
            cached_agent_user_id: None,
            message_count: 1,
        })
    }

    /// Cache the agent-side user id learned from a response, for next time.
    /// Last write wins; the cache is a soft optimization.
    pub fn set_agent_user_id(&self, local_id: &str, agent_user_id: &str) -> Result<()> {
        if agent_user_id.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_agent_user_id = ?1 WHERE id = ?2",
            params![agent_user_id, local_id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn agent_user_id(&self, local_id: &str) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT last_agent_user_id FROM users WHERE id = ?1",
            params![local_id],
            |row| row.get(0),
        )
        .ok()
        .flatten()
    }
}

/// The session prefix is everything before the first underscore — the
/// instance portion of `{instance}_{user}` session names.
fn session_prefix(session_name: &str) -> &str {
    session_name.split('_').next().unwrap_or(session_name)
}
