//! Message lifecycle tracing.
//!
//! A trace is the durable record of one inbound message's processing: a
//! status-bearing header row plus an append-only sequence of stage payload
//! snapshots. Traces are observability, not transactional state — every
//! persistence failure in this module is caught and logged, never allowed to
//! abort message processing.

pub mod store;

pub use store::{NewTrace, PayloadRow, TraceFields, TraceRow, TraceStore};

use crate::config::TracingConfig;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Trace status state machine:
/// `received → processing → agent_called → processing → {completed | failed}`.
///
/// Re-entering `processing` after `agent_called` is legal (the message is
/// awaiting channel delivery). Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Received,
    Processing,
    AgentCalled,
    Completed,
    Failed,
}

impl TraceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceStatus::Received => "received",
            TraceStatus::Processing => "processing",
            TraceStatus::AgentCalled => "agent_called",
            TraceStatus::Completed => "completed",
            TraceStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TraceStatus::Completed | TraceStatus::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition(self, next: TraceStatus) -> bool {
        use TraceStatus::{AgentCalled, Completed, Failed, Processing, Received};
        match (self, next) {
            (Received, Processing)
            | (Processing, AgentCalled)
            | (AgentCalled, Processing)
            | (Processing | AgentCalled, Completed) => true,
            (s, Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

/// Message type sniffed from a WhatsApp message object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Unknown,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::Document => "document",
            MessageType::Unknown => "unknown",
        }
    }
}

/// Determine the message type from an Evolution `message` object.
pub fn determine_message_type(message_obj: &Value) -> MessageType {
    if message_obj.get("conversation").is_some()
        || message_obj.get("extendedTextMessage").is_some()
    {
        MessageType::Text
    } else if message_obj.get("imageMessage").is_some() {
        MessageType::Image
    } else if message_obj.get("videoMessage").is_some() {
        MessageType::Video
    } else if message_obj.get("audioMessage").is_some() {
        MessageType::Audio
    } else if message_obj.get("documentMessage").is_some() {
        MessageType::Document
    } else {
        MessageType::Unknown
    }
}

/// Whether an Evolution `message` object carries media.
pub fn has_media(message_obj: &Value) -> bool {
    ["imageMessage", "videoMessage", "audioMessage", "documentMessage"]
        .iter()
        .any(|key| message_obj.get(*key).is_some())
}

/// Extract the phone portion of a WhatsApp JID (`123@s.whatsapp.net` → `123`).
pub fn extract_phone(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

fn message_text_length(message_obj: &Value) -> usize {
    if let Some(text) = message_obj.get("conversation").and_then(Value::as_str) {
        text.len()
    } else if let Some(text) = message_obj
        .get("extendedTextMessage")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
    {
        text.len()
    } else {
        0
    }
}

/// Creates traces and owns the backing store handle.
pub struct TraceService {
    store: Option<Arc<TraceStore>>,
}

impl TraceService {
    pub fn new(config: &TracingConfig) -> anyhow::Result<Self> {
        if !config.enabled {
            return Ok(Self { store: None });
        }
        let store = TraceStore::open(&config.db_path, config.max_payload_bytes)?;
        Ok(Self {
            store: Some(Arc::new(store)),
        })
    }

    /// A service that never records anything (tracing disabled).
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<Arc<TraceStore>> {
        self.store.clone()
    }

    /// Create a trace for an inbound event. Returns `None` when tracing is
    /// disabled or the write failed — callers proceed either way.
    pub fn create_trace(&self, event: &Value, instance_name: &str) -> Option<TraceContext> {
        let store = self.store.clone()?;

        let channel = event
            .get("channel_type")
            .or_else(|| event.get("platform"))
            .and_then(Value::as_str)
            .unwrap_or("whatsapp");

        let row = if channel == "discord" {
            Self::discord_trace_row(event, instance_name)
        } else {
            Self::whatsapp_trace_row(event, instance_name)
        };

        if let Err(e) = store.insert_trace(&row) {
            tracing::error!("failed to create message trace: {e:#}");
            return None;
        }

        tracing::info!(
            trace_id = %row.trace_id,
            instance = instance_name,
            message_type = %row.message_type,
            "created message trace"
        );

        let ctx = TraceContext {
            trace_id: row.trace_id,
            store,
            status: Mutex::new(TraceStatus::Received),
        };
        ctx.log_stage("webhook_received", event, "webhook", None, None);
        Some(ctx)
    }

    fn whatsapp_trace_row(event: &Value, instance_name: &str) -> NewTrace {
        let key = event.get("key").cloned().unwrap_or_default();
        let message_obj = event.get("message").cloned().unwrap_or_default();
        let jid = key.get("remoteJid").and_then(Value::as_str).unwrap_or("");
        let has_quoted = event
            .get("contextInfo")
            .map(|c| c.get("quotedMessage").is_some())
            .unwrap_or(false);

        NewTrace {
            trace_id: Uuid::new_v4().to_string(),
            instance_name: instance_name.to_string(),
            channel_type: "whatsapp".into(),
            provider_message_id: key
                .get("id")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            sender_id: (!jid.is_empty()).then(|| extract_phone(jid).to_string()),
            sender_display_name: event
                .get("pushName")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            message_type: determine_message_type(&message_obj).as_str().into(),
            has_media: has_media(&message_obj),
            has_quoted_message: has_quoted,
            message_length: message_text_length(&message_obj),
            status: TraceStatus::Received.as_str().into(),
            session_name: None,
        }
    }

    fn discord_trace_row(event: &Value, instance_name: &str) -> NewTrace {
        let payload = event.get("event").cloned().unwrap_or_default();
        let metadata = event.get("metadata").cloned().unwrap_or_default();
        let author = payload.get("author").cloned().unwrap_or_default();
        let content = payload.get("content").and_then(Value::as_str).unwrap_or("");
        let attachments = payload
            .get("attachments")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        let author_id = author
            .get("id")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty());

        NewTrace {
            trace_id: Uuid::new_v4().to_string(),
            instance_name: instance_name.to_string(),
            channel_type: "discord".into(),
            provider_message_id: payload.get("id").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            sender_id: author_id,
            sender_display_name: author
                .get("display_name")
                .or_else(|| author.get("username"))
                .or_else(|| metadata.get("author_name"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
            message_type: if attachments > 0 { "image" } else { "text" }.into(),
            has_media: attachments > 0,
            has_quoted_message: false,
            message_length: content.len(),
            status: TraceStatus::Received.as_str().into(),
            session_name: event
                .get("session_name")
                .or_else(|| metadata.get("session_name"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }
    }

    /// Persist a standalone outbound-send trace when there is no inbound
    /// context (IPC-initiated sends). Returns the trace id when recorded.
    #[allow(clippy::too_many_arguments)]
    pub fn record_outbound(
        &self,
        instance_name: &str,
        channel_type: &str,
        payload: &Value,
        response: Option<&Value>,
        success: bool,
        session_name: Option<&str>,
        error: Option<&str>,
    ) -> Option<String> {
        let store = self.store.clone()?;

        let row = NewTrace {
            trace_id: Uuid::new_v4().to_string(),
            instance_name: instance_name.to_string(),
            channel_type: channel_type.to_string(),
            sender_id: payload
                .get("recipient")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            message_type: "text".into(),
            message_length: payload
                .get("message_text")
                .and_then(Value::as_str)
                .map_or(0, str::len),
            status: TraceStatus::Processing.as_str().into(),
            session_name: session_name.map(ToString::to_string),
            ..NewTrace::default()
        };

        if let Err(e) = store.insert_trace(&row) {
            tracing::error!("failed to record outbound trace: {e:#}");
            return None;
        }

        let ctx = TraceContext {
            trace_id: row.trace_id.clone(),
            store,
            status: Mutex::new(TraceStatus::Processing),
        };

        let stage = format!("{channel_type}_send");
        ctx.log_stage(&stage, payload, "request", None, None);
        if let Some(response) = response {
            let status_code = response.get("status_code").and_then(Value::as_i64);
            ctx.log_stage(
                &format!("{stage}_response"),
                response,
                "response",
                status_code,
                error,
            );
        }

        if success {
            ctx.update_status(TraceStatus::Completed, TraceFields::default());
        } else {
            ctx.update_status(
                TraceStatus::Failed,
                TraceFields {
                    error_message: error.map(ToString::to_string),
                    error_stage: Some(stage),
                    ..TraceFields::default()
                },
            );
        }
        Some(row.trace_id)
    }

    /// Retention sweep. Returns the number of traces removed.
    pub fn cleanup_older_than(&self, days: u32) -> usize {
        let Some(store) = &self.store else { return 0 };
        match store.cleanup_older_than(days) {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!("removed {removed} traces older than {days} days");
                }
                removed
            }
            Err(e) => {
                tracing::error!("trace retention sweep failed: {e:#}");
                0
            }
        }
    }
}

/// Context object that follows one message through its lifecycle.
pub struct TraceContext {
    trace_id: String,
    store: Arc<TraceStore>,
    status: Mutex<TraceStatus>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn current_status(&self) -> TraceStatus {
        *self.status.lock()
    }

    /// Append one stage payload snapshot.
    pub fn log_stage(
        &self,
        stage: &str,
        payload: &Value,
        payload_type: &str,
        status_code: Option<i64>,
        error_details: Option<&str>,
    ) {
        if let Err(e) = self.store.append_payload(
            &self.trace_id,
            stage,
            payload_type,
            status_code,
            error_details,
            payload,
        ) {
            tracing::error!(
                trace_id = %self.trace_id,
                "failed to log trace payload for stage {stage}: {e:#}"
            );
        }
    }

    /// Advance the trace status, applying any accompanying fields.
    ///
    /// Illegal transitions are logged and ignored — the trace keeps its last
    /// known stage. Returns whether the transition was applied.
    pub fn update_status(&self, next: TraceStatus, mut fields: TraceFields) -> bool {
        let mut current = self.status.lock();
        if !current.can_transition(next) {
            tracing::warn!(
                trace_id = %self.trace_id,
                "ignoring illegal trace transition {} -> {}",
                current.as_str(),
                next.as_str()
            );
            return false;
        }

        if next == TraceStatus::Failed && fields.error_stage.is_none() {
            fields.error_stage = Some("processing".into());
        }

        if let Err(e) = self
            .store
            .update_trace(&self.trace_id, next.as_str(), &fields)
        {
            tracing::error!(trace_id = %self.trace_id, "failed to update trace status: {e:#}");
            return false;
        }
        if next.is_terminal() {
            if let Err(e) = self.store.finalize_trace(&self.trace_id) {
                tracing::error!(trace_id = %self.trace_id, "failed to finalize trace: {e:#}");
            }
        }
        *current = next;
        true
    }

    /// Log the agent request payload and mark the agent as called.
    pub fn log_agent_request(&self, payload: &Value) {
        self.log_stage("agent_request", payload, "request", None, None);
        self.update_status(
            TraceStatus::AgentCalled,
            TraceFields {
                agent_request_at: Some(Utc::now()),
                ..TraceFields::default()
            },
        );
    }

    /// Log the agent response payload with timing, returning to `processing`
    /// while channel delivery is pending.
    pub fn log_agent_response(&self, response: &Value, processing_time_ms: i64) {
        self.log_stage("agent_response", response, "response", Some(200), None);

        let success = response
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        self.update_status(
            TraceStatus::Processing,
            TraceFields {
                agent_response_at: Some(Utc::now()),
                agent_processing_time_ms: Some(processing_time_ms),
                agent_response_success: Some(success),
                agent_session_id: response
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                ..TraceFields::default()
            },
        );
    }

    /// Log a channel send attempt and finalize the trace.
    pub fn log_channel_send(&self, channel: &str, payload: &Value, response_code: i64, success: bool) {
        let stage = format!("{channel}_send");
        self.log_stage(&stage, payload, "request", Some(response_code), None);

        if success {
            self.update_status(
                TraceStatus::Completed,
                TraceFields {
                    evolution_send_at: Some(Utc::now()),
                    evolution_response_code: Some(response_code),
                    evolution_success: Some(true),
                    ..TraceFields::default()
                },
            );
        } else {
            self.update_status(
                TraceStatus::Failed,
                TraceFields {
                    error_message: Some(format!("channel send returned {response_code}")),
                    error_stage: Some(stage),
                    evolution_send_at: Some(Utc::now()),
                    evolution_response_code: Some(response_code),
                    evolution_success: Some(false),
                    ..TraceFields::default()
                },
            );
        }
    }

    /// Update the trace with session info learned during agent processing.
    pub fn update_session_info(&self, session_name: &str, agent_session_id: Option<&str>) {
        if let Err(e) = self.store.update_trace(
            &self.trace_id,
            self.status.lock().as_str(),
            &TraceFields {
                session_name: Some(session_name.to_string()),
                agent_session_id: agent_session_id.map(ToString::to_string),
                ..TraceFields::default()
            },
        ) {
            tracing::error!(trace_id = %self.trace_id, "failed to update session info: {e:#}");
        }
    }

    /// Mark the trace failed at a named stage.
    pub fn fail(&self, stage: &str, message: &str) {
        self.update_status(
            TraceStatus::Failed,
            TraceFields {
                error_message: Some(message.to_string()),
                error_stage: Some(stage.to_string()),
                ..TraceFields::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracingConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn service(tmp: &TempDir) -> TraceService {
        TraceService::new(&TracingConfig {
            db_path: tmp.path().join("traces.db"),
            ..TracingConfig::default()
        })
        .unwrap()
    }

    fn whatsapp_event(text: &str) -> Value {
        json!({
            "key": {"remoteJid": "5511999990000@s.whatsapp.net", "id": "MSG1", "fromMe": false},
            "message": {"conversation": text},
            "pushName": "Alice",
            "messageTimestamp": 1_700_000_000u64,
        })
    }

    #[test]
    fn state_machine_allows_documented_path() {
        use TraceStatus::{AgentCalled, Completed, Failed, Processing, Received};
        assert!(Received.can_transition(Processing));
        assert!(Processing.can_transition(AgentCalled));
        assert!(AgentCalled.can_transition(Processing));
        assert!(Processing.can_transition(Completed));
        assert!(AgentCalled.can_transition(Failed));
        assert!(!Completed.can_transition(Processing));
        assert!(!Failed.can_transition(Failed));
        assert!(!Received.can_transition(Completed));
    }

    #[test]
    fn disabled_service_yields_no_context() {
        let service = TraceService::disabled();
        assert!(!service.is_enabled());
        assert!(service
            .create_trace(&whatsapp_event("Hi"), "inst")
            .is_none());
        assert_eq!(service.cleanup_older_than(0), 0);
    }

    #[test]
    fn create_trace_records_whatsapp_fields() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp);
        let ctx = service
            .create_trace(&whatsapp_event("Hi"), "my-instance")
            .unwrap();

        let row = service
            .store()
            .unwrap()
            .get_trace(ctx.trace_id())
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "received");
        assert_eq!(row.channel_type, "whatsapp");
        assert_eq!(row.sender_id.as_deref(), Some("5511999990000"));
        assert_eq!(row.sender_display_name.as_deref(), Some("Alice"));
        assert_eq!(row.message_type, "text");
        assert_eq!(row.message_length, 2);
        assert!(!row.has_media);

        let payloads = service.store().unwrap().payloads(ctx.trace_id()).unwrap();
        assert_eq!(payloads[0].stage, "webhook_received");
        assert_eq!(payloads[0].payload_type, "webhook");
    }

    #[test]
    fn full_lifecycle_reaches_completed_with_duration() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp);
        let ctx = service
            .create_trace(&whatsapp_event("Hi"), "my-instance")
            .unwrap();

        assert!(ctx.update_status(TraceStatus::Processing, TraceFields::default()));
        ctx.log_agent_request(&json!({"message": "Hi"}));
        ctx.log_agent_response(
            &json!({"message": "Hello!", "success": true, "session_id": "sess-1"}),
            150,
        );
        ctx.log_channel_send("evolution", &json!({"recipient": "5511999990000"}), 201, true);

        let row = service
            .store()
            .unwrap()
            .get_trace(ctx.trace_id())
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.agent_session_id.as_deref(), Some("sess-1"));
        assert_eq!(row.evolution_success, Some(true));
        assert!(row.completed_at.is_some());
        assert!(row.total_processing_time_ms.unwrap() >= 0);
        assert!(row.agent_request_at.is_some());
        assert!(row.agent_response_at.is_some());
    }

    #[test]
    fn failed_send_records_error_stage() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp);
        let ctx = service
            .create_trace(&whatsapp_event("Hi"), "my-instance")
            .unwrap();
        ctx.update_status(TraceStatus::Processing, TraceFields::default());
        ctx.log_channel_send("evolution", &json!({"recipient": "x"}), 400, false);

        let row = service
            .store()
            .unwrap()
            .get_trace(ctx.trace_id())
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_stage.as_deref(), Some("evolution_send"));
        assert!(row.error_message.is_some());
        assert!(row.completed_at.is_some());
        assert_eq!(row.evolution_success, Some(false));
    }

    #[test]
    fn terminal_trace_ignores_further_updates() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp);
        let ctx = service
            .create_trace(&whatsapp_event("Hi"), "my-instance")
            .unwrap();
        ctx.update_status(TraceStatus::Processing, TraceFields::default());
        ctx.update_status(TraceStatus::Completed, TraceFields::default());

        assert!(!ctx.update_status(TraceStatus::Processing, TraceFields::default()));
        assert!(!ctx.update_status(TraceStatus::Failed, TraceFields::default()));
        let row = service
            .store()
            .unwrap()
            .get_trace(ctx.trace_id())
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "completed");
    }

    #[test]
    fn failure_requires_and_defaults_error_stage() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp);
        let ctx = service
            .create_trace(&whatsapp_event("Hi"), "my-instance")
            .unwrap();
        ctx.update_status(TraceStatus::Processing, TraceFields::default());
        ctx.fail("agent_call", "boom");

        let row = service
            .store()
            .unwrap()
            .get_trace(ctx.trace_id())
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_stage.as_deref(), Some("agent_call"));
    }

    #[test]
    fn discord_trace_uses_event_metadata() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp);
        let event = json!({
            "channel_type": "discord",
            "session_name": "discord_1_2",
            "event": {
                "id": "111222333",
                "content": "hello bot",
                "author": {"id": "42", "username": "bob", "display_name": "Bob"},
                "attachments": [],
            },
            "metadata": {"instance_name": "disc-1"},
        });
        let ctx = service.create_trace(&event, "disc-1").unwrap();
        let row = service
            .store()
            .unwrap()
            .get_trace(ctx.trace_id())
            .unwrap()
            .unwrap();
        assert_eq!(row.channel_type, "discord");
        assert_eq!(row.sender_id.as_deref(), Some("42"));
        assert_eq!(row.sender_display_name.as_deref(), Some("Bob"));
        assert_eq!(row.session_name.as_deref(), Some("discord_1_2"));
        assert_eq!(row.message_length, "hello bot".len() as i64);
    }

    #[test]
    fn outbound_record_completes_or_fails() {
        let tmp = TempDir::new().unwrap();
        let service = service(&tmp);
        let ok_id = service
            .record_outbound(
                "disc-1",
                "discord",
                &json!({"recipient": "123", "message_text": "hi"}),
                Some(&json!({"status_code": 200})),
                true,
                Some("discord_1_2"),
                None,
            )
            .unwrap();
        let row = service.store().unwrap().get_trace(&ok_id).unwrap().unwrap();
        assert_eq!(row.status, "completed");

        let fail_id = service
            .record_outbound(
                "disc-1",
                "discord",
                &json!({"recipient": "123", "message_text": "hi"}),
                None,
                false,
                None,
                Some("forbidden"),
            )
            .unwrap();
        let row = service
            .store()
            .unwrap()
            .get_trace(&fail_id)
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_stage.as_deref(), Some("discord_send"));
    }

    #[test]
    fn message_type_sniffing_matches_bridge_shapes() {
        assert_eq!(
            determine_message_type(&json!({"conversation": "hi"})),
            MessageType::Text
        );
        assert_eq!(
            determine_message_type(&json!({"extendedTextMessage": {"text": "hi"}})),
            MessageType::Text
        );
        assert_eq!(
            determine_message_type(&json!({"imageMessage": {}})),
            MessageType::Image
        );
        assert_eq!(
            determine_message_type(&json!({"audioMessage": {}})),
            MessageType::Audio
        );
        assert_eq!(
            determine_message_type(&json!({"documentMessage": {}})),
            MessageType::Document
        );
        assert_eq!(
            determine_message_type(&json!({"reactionMessage": {}})),
            MessageType::Unknown
        );
        assert!(has_media(&json!({"videoMessage": {}})));
        assert!(!has_media(&json!({"conversation": "hi"})));
    }

    #[test]
    fn phone_extraction_strips_suffix() {
        assert_eq!(extract_phone("5511999990000@s.whatsapp.net"), "5511999990000");
        assert_eq!(extract_phone("5511999990000"), "5511999990000");
    }
}
