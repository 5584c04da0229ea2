//! SQLite persistence for message traces.
//!
//! One file-backed database holds the trace header rows and the append-only
//! stage payload snapshots. Every stage write is its own committed row: a
//! crash mid-pipeline leaves a durable partial trace with the last known
//! stage, which is exactly what the forensic use case wants.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

const PRAGMA_SQL: &str =
    "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS message_traces (
    trace_id                 TEXT PRIMARY KEY,
    instance_name            TEXT NOT NULL,
    channel_type             TEXT NOT NULL,
    provider_message_id      TEXT,
    sender_id                TEXT,
    sender_display_name      TEXT,
    message_type             TEXT NOT NULL,
    has_media                INTEGER NOT NULL DEFAULT 0,
    has_quoted_message       INTEGER NOT NULL DEFAULT 0,
    message_length           INTEGER NOT NULL DEFAULT 0,
    status                   TEXT NOT NULL,
    session_name             TEXT,
    agent_session_id         TEXT,
    received_at              TEXT NOT NULL,
    agent_request_at         TEXT,
    agent_response_at        TEXT,
    evolution_send_at        TEXT,
    completed_at             TEXT,
    agent_processing_time_ms INTEGER,
    agent_response_success   INTEGER,
    evolution_response_code  INTEGER,
    evolution_success        INTEGER,
    total_processing_time_ms INTEGER,
    error_message            TEXT,
    error_stage              TEXT
);
CREATE INDEX IF NOT EXISTS idx_traces_instance ON message_traces (instance_name, received_at);
CREATE INDEX IF NOT EXISTS idx_traces_sender ON message_traces (sender_id, received_at);
CREATE TABLE IF NOT EXISTS trace_payloads (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id                TEXT NOT NULL,
    stage                   TEXT NOT NULL,
    payload_type            TEXT NOT NULL,
    status_code             INTEGER,
    error_details           TEXT,
    payload_gz              BLOB NOT NULL,
    payload_size            INTEGER NOT NULL,
    payload_size_compressed INTEGER NOT NULL,
    created_at              TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_payloads_trace ON trace_payloads (trace_id, id);";

/// Header row of one message trace.
#[derive(Debug, Clone)]
pub struct TraceRow {
    pub trace_id: String,
    pub instance_name: String,
    pub channel_type: String,
    pub provider_message_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_display_name: Option<String>,
    pub message_type: String,
    pub has_media: bool,
    pub has_quoted_message: bool,
    pub message_length: i64,
    pub status: String,
    pub session_name: Option<String>,
    pub agent_session_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub agent_request_at: Option<DateTime<Utc>>,
    pub agent_response_at: Option<DateTime<Utc>>,
    pub evolution_send_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent_processing_time_ms: Option<i64>,
    pub agent_response_success: Option<bool>,
    pub evolution_response_code: Option<i64>,
    pub evolution_success: Option<bool>,
    pub total_processing_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_stage: Option<String>,
}

/// New trace header to insert.
#[derive(Debug, Clone, Default)]
pub struct NewTrace {
    pub trace_id: String,
    pub instance_name: String,
    pub channel_type: String,
    pub provider_message_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_display_name: Option<String>,
    pub message_type: String,
    pub has_media: bool,
    pub has_quoted_message: bool,
    pub message_length: usize,
    pub status: String,
    pub session_name: Option<String>,
}

/// Optional fields applied alongside a status update.
#[derive(Debug, Clone, Default)]
pub struct TraceFields {
    pub error_message: Option<String>,
    pub error_stage: Option<String>,
    pub session_name: Option<String>,
    pub agent_session_id: Option<String>,
    pub agent_request_at: Option<DateTime<Utc>>,
    pub agent_response_at: Option<DateTime<Utc>>,
    pub evolution_send_at: Option<DateTime<Utc>>,
    pub agent_processing_time_ms: Option<i64>,
    pub agent_response_success: Option<bool>,
    pub evolution_response_code: Option<i64>,
    pub evolution_success: Option<bool>,
}

/// One stage payload snapshot, decompressed.
#[derive(Debug, Clone)]
pub struct PayloadRow {
    pub stage: String,
    pub payload_type: String,
    pub status_code: Option<i64>,
    pub error_details: Option<String>,
    pub payload: serde_json::Value,
}

/// Shared SQLite handle for the trace tables.
pub struct TraceStore {
    conn: Arc<Mutex<Connection>>,
    max_payload_bytes: usize,
}

impl TraceStore {
    pub fn open(path: &Path, max_payload_bytes: usize) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open trace db {}", path.display()))?;
        conn.execute_batch(PRAGMA_SQL)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_payload_bytes,
        })
    }

    pub fn insert_trace(&self, row: &NewTrace) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO message_traces (
                trace_id, instance_name, channel_type, provider_message_id,
                sender_id, sender_display_name, message_type, has_media,
                has_quoted_message, message_length, status, session_name,
                received_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                row.trace_id,
                row.instance_name,
                row.channel_type,
                row.provider_message_id,
                row.sender_id,
                row.sender_display_name,
                row.message_type,
                row.has_media,
                row.has_quoted_message,
                row.message_length as i64,
                row.status,
                row.session_name,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("failed to insert trace row")?;
        Ok(())
    }

    /// Apply a status change plus any accompanying fields in one UPDATE.
    pub fn update_trace(&self, trace_id: &str, status: &str, fields: &TraceFields) -> Result<()> {
        let mut set = vec!["status = ?".to_string()];
        let mut values: Vec<rusqlite::types::Value> = vec![status.to_string().into()];

        macro_rules! push_field {
            ($name:literal, $value:expr) => {
                if let Some(v) = $value {
                    set.push(concat!($name, " = ?").to_string());
                    values.push(v.into());
                }
            };
        }

        push_field!("error_message", fields.error_message.clone());
        push_field!("error_stage", fields.error_stage.clone());
        push_field!("session_name", fields.session_name.clone());
        push_field!("agent_session_id", fields.agent_session_id.clone());
        push_field!(
            "agent_request_at",
            fields.agent_request_at.map(|t| t.to_rfc3339())
        );
        push_field!(
            "agent_response_at",
            fields.agent_response_at.map(|t| t.to_rfc3339())
        );
        push_field!(
            "evolution_send_at",
            fields.evolution_send_at.map(|t| t.to_rfc3339())
        );
        push_field!(
            "agent_processing_time_ms",
            fields.agent_processing_time_ms
        );
        push_field!(
            "agent_response_success",
            fields.agent_response_success.map(i64::from)
        );
        push_field!("evolution_response_code", fields.evolution_response_code);
        push_field!("evolution_success", fields.evolution_success.map(i64::from));

        let sql = format!(
            "UPDATE message_traces SET {} WHERE trace_id = ?",
            set.join(", ")
        );
        values.push(trace_id.to_string().into());

        let conn = self.conn.lock();
        conn.execute(&sql, rusqlite::params_from_iter(values))
            .context("failed to update trace row")?;
        Ok(())
    }

    /// Stamp a terminal status: sets `completed_at` and computes
    /// `total_processing_time_ms` from the stored `received_at`.
    pub fn finalize_trace(&self, trace_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let received: Option<String> = conn
            .query_row(
                "SELECT received_at FROM message_traces WHERE trace_id = ?1",
                params![trace_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(received) = received else {
            anyhow::bail!("trace '{trace_id}' not found");
        };

        let now = Utc::now();
        let total_ms = DateTime::parse_from_rfc3339(&received)
            .map(|r| (now - r.with_timezone(&Utc)).num_milliseconds().max(0))
            .unwrap_or(0);

        conn.execute(
            "UPDATE message_traces
             SET completed_at = ?1, total_processing_time_ms = ?2
             WHERE trace_id = ?3",
            params![now.to_rfc3339(), total_ms, trace_id],
        )?;
        Ok(())
    }

    /// Append one stage payload. Never updated afterwards; ordering is
    /// insertion order.
    pub fn append_payload(
        &self,
        trace_id: &str,
        stage: &str,
        payload_type: &str,
        status_code: Option<i64>,
        error_details: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let raw = serde_json::to_vec(payload)?;
        let (raw, original_size) = if raw.len() > self.max_payload_bytes {
            let marker = serde_json::json!({
                "truncated": true,
                "original_size_bytes": raw.len(),
                "max_payload_bytes": self.max_payload_bytes,
            });
            (serde_json::to_vec(&marker)?, raw.len())
        } else {
            let len = raw.len();
            (raw, len)
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;
        let compressed_size = compressed.len();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trace_payloads (
                trace_id, stage, payload_type, status_code, error_details,
                payload_gz, payload_size, payload_size_compressed, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trace_id,
                stage,
                payload_type,
                status_code,
                error_details,
                compressed,
                original_size as i64,
                compressed_size as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("failed to append trace payload")?;
        Ok(())
    }

    pub fn get_trace(&self, trace_id: &str) -> Result<Option<TraceRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trace_id, instance_name, channel_type, provider_message_id,
                    sender_id, sender_display_name, message_type, has_media,
                    has_quoted_message, message_length, status, session_name,
                    agent_session_id, received_at, agent_request_at,
                    agent_response_at, evolution_send_at, completed_at,
                    agent_processing_time_ms, agent_response_success,
                    evolution_response_code, evolution_success,
                    total_processing_time_ms, error_message, error_stage
             FROM message_traces WHERE trace_id = ?1",
        )?;
        stmt.query_row(params![trace_id], map_trace_row)
            .optional()
            .map_err(Into::into)
    }

    pub fn payloads(&self, trace_id: &str) -> Result<Vec<PayloadRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT stage, payload_type, status_code, error_details, payload_gz
             FROM trace_payloads WHERE trace_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![trace_id], |row| {
            let blob: Vec<u8> = row.get(4)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                blob,
            ))
        })?;

        let mut payloads = Vec::new();
        for row in rows {
            let (stage, payload_type, status_code, error_details, blob) = row?;
            let mut decoder = GzDecoder::new(blob.as_slice());
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            payloads.push(PayloadRow {
                stage,
                payload_type,
                status_code,
                error_details,
                payload: serde_json::from_slice(&decompressed)?,
            });
        }
        Ok(payloads)
    }

    /// Retention sweep: delete traces (and their payloads) older than the
    /// given number of days. Returns the number of trace rows removed.
    pub fn cleanup_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = (Utc::now() - ChronoDuration::days(i64::from(days))).to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM trace_payloads WHERE trace_id IN
                (SELECT trace_id FROM message_traces WHERE received_at < ?1)",
            params![cutoff],
        )?;
        let removed = conn.execute(
            "DELETE FROM message_traces WHERE received_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn map_trace_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TraceRow> {
    Ok(TraceRow {
        trace_id: row.get(0)?,
        instance_name: row.get(1)?,
        channel_type: row.get(2)?,
        provider_message_id: row.get(3)?,
        sender_id: row.get(4)?,
        sender_display_name: row.get(5)?,
        message_type: row.get(6)?,
        has_media: row.get(7)?,
        has_quoted_message: row.get(8)?,
        message_length: row.get(9)?,
        status: row.get(10)?,
        session_name: row.get(11)?,
        agent_session_id: row.get(12)?,
        received_at: parse_ts(row.get(13)?).unwrap_or_else(Utc::now),
        agent_request_at: parse_ts(row.get(14)?),
        agent_response_at: parse_ts(row.get(15)?),
        evolution_send_at: parse_ts(row.get(16)?),
        completed_at: parse_ts(row.get(17)?),
        agent_processing_time_ms: row.get(18)?,
        agent_response_success: row.get::<_, Option<i64>>(19)?.map(|v| v != 0),
        evolution_response_code: row.get(20)?,
        evolution_success: row.get::<_, Option<i64>>(21)?.map(|v| v != 0),
        total_processing_time_ms: row.get(22)?,
        error_message: row.get(23)?,
        error_stage: row.get(24)?,
    })
}
