//! Leo workflow-engine backend: SSE streaming protocol.
//!
//! `POST {base}/workflow-engine/{workflow_id}/stream` answers with
//! newline-delimited `data: {...}` events. Text arrives as incremental
//! deltas; a `STATE_SNAPSHOT` event carries the same text nested under known
//! key paths and is only consulted when no deltas arrived at all. The first
//! `RUN_FINISHED` terminates the read — the socket may stay open past it.

use super::{
    AgentClient, AgentError, AgentRequest, NormalizedReply, EMPTY_STREAM_REPLY,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

const LEO_TIMEOUT: Duration = Duration::from_secs(120);

/// One parsed SSE event we care about.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// Incremental text; concatenation order is arrival order.
    Delta(String),
    /// Structured fallback used only when zero deltas were observed.
    Snapshot(Value),
    /// End of stream; stop reading immediately.
    RunFinished,
}

/// Parse one SSE line into an event. Lines that are not `data:` payloads, or
/// whose JSON does not decode, yield `None` and are skipped.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    // Both "data:{...}" and "data: {...}" appear in the wild.
    let data = line
        .strip_prefix("data:")
        .or_else(|| line.strip_prefix("data :"))?
        .trim();
    if data.is_empty() {
        return None;
    }

    let event: Value = serde_json::from_str(data).ok()?;
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "TEXT_MESSAGE_CONTENT" => {
            let delta = event.get("delta").and_then(Value::as_str).unwrap_or("");
            (!delta.is_empty()).then(|| SseEvent::Delta(delta.to_string()))
        }
        "TEXT_DELTA" => {
            // Providers have shipped the delta under several keys.
            let delta = event
                .get("delta")
                .or_else(|| event.get("content"))
                .or_else(|| event.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("");
            (!delta.is_empty()).then(|| SseEvent::Delta(delta.to_string()))
        }
        "MESSAGE" => {
            let content = event.get("content").and_then(Value::as_str).unwrap_or("");
            (!content.is_empty()).then(|| SseEvent::Delta(content.to_string()))
        }
        "STATE_SNAPSHOT" => Some(SseEvent::Snapshot(event)),
        "RUN_FINISHED" => Some(SseEvent::RunFinished),
        _ => None,
    }
}

/// Mine the snapshot's known key paths for the reply text.
pub fn extract_snapshot_text(snapshot: &Value) -> Option<String> {
    let entries = snapshot.get("snapshot").and_then(Value::as_array)?;
    let vars = entries.get(1).filter(|v| v.is_object())?;

    for root in ["agent_0", "final_response"] {
        let text = vars
            .get(root)
            .and_then(|r| r.get("variables"))
            .and_then(|v| v.get("nodes"))
            .and_then(|n| n.get("agent_0"))
            .and_then(|a| a.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    None
}

pub struct LeoAgentClient {
    base_url: String,
    workflow_id: String,
    bearer_token: String,
    subscription_key: String,
    bpc: String,
    environment: String,
    version: String,
    client: reqwest::Client,
}

impl LeoAgentClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: String,
        workflow_id: String,
        bearer_token: String,
        subscription_key: String,
        bpc: String,
        environment: String,
        version: String,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            workflow_id,
            bearer_token,
            subscription_key,
            bpc,
            environment,
            version,
            client: reqwest::Client::new(),
        }
    }

    /// Leo expects session ids of the form `session_<millis>`.
    fn format_session_id(session_id: &str) -> String {
        if session_id.starts_with("session_") {
            session_id.to_string()
        } else {
            format!("session_{}", Utc::now().timestamp_millis())
        }
    }

    fn build_payload(&self, message: &str, session_id: &str) -> Value {
        let runtime_token = if self.bearer_token.starts_with("Bearer ") {
            self.bearer_token.clone()
        } else {
            format!("Bearer {}", self.bearer_token)
        };

        json!({
            "bpc": self.bpc,
            "environment": self.environment,
            "version": self.version,
            "interface": {
                "inputs": { "message": message }
            },
            "options": {
                "sessionId": Self::format_session_id(session_id),
                "runtimeToken": runtime_token,
                "streamMode": "verbose"
            }
        })
    }

    /// Issue the streaming POST and classify failure statuses. A 401 is a
    /// credentials problem, not a network problem; callers must not retry it.
    async fn open_stream(&self, request: &AgentRequest) -> Result<reqwest::Response, AgentError> {
        let url = format!("{}/workflow-engine/{}/stream", self.base_url, self.workflow_id);
        let payload = self.build_payload(&request.message, &request.session_name);

        tracing::debug!(session = %request.session_name, "calling Leo workflow engine at {url}");

        let response = self
            .client
            .post(&url)
            .header("accept", "*/*")
            .header("authorization", format!("Bearer {}", self.bearer_token))
            .header("ocp-apim-subscription-key", &self.subscription_key)
            .json(&payload)
            .timeout(LEO_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout {
                        secs: LEO_TIMEOUT.as_secs(),
                    }
                } else {
                    AgentError::Transport(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::CredentialsExpired(
                crate::util::truncate_with_ellipsis(&body, 200),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Api {
                status: status.as_u16(),
                body: crate::util::truncate_with_ellipsis(&body, 500),
            });
        }
        Ok(response)
    }

    /// Read the SSE body and forward deltas until the first `RUN_FINISHED`.
    /// When no deltas arrived, fall back to the snapshot, then to the canned
    /// empty-stream reply.
    fn spawn_reader(response: reqwest::Response, tx: mpsc::Sender<String>) {
        tokio::spawn(async move {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut delta_count = 0usize;
            let mut snapshot: Option<Value> = None;
            let mut finished = false;

            'read: while let Some(item) = bytes_stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Leo stream interrupted: {e}");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    match parse_sse_line(&line) {
                        Some(SseEvent::Delta(delta)) => {
                            delta_count += 1;
                            if tx.send(delta).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        Some(SseEvent::Snapshot(value)) => snapshot = Some(value),
                        Some(SseEvent::RunFinished) => {
                            tracing::debug!("Leo stream completed after {delta_count} deltas");
                            finished = true;
                            break 'read;
                        }
                        None => {}
                    }
                }
            }

            if !finished {
                tracing::debug!("Leo stream ended without RUN_FINISHED ({delta_count} deltas)");
            }

            if delta_count == 0 {
                let fallback = snapshot
                    .as_ref()
                    .and_then(extract_snapshot_text)
                    .unwrap_or_else(|| EMPTY_STREAM_REPLY.to_string());
                let _ = tx.send(fallback).await;
            }
        });
    }
}

#[async_trait]
impl AgentClient for LeoAgentClient {
    async fn run(&self, request: &AgentRequest) -> Result<NormalizedReply, AgentError> {
        let mut rx = self.stream(request).await?;
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text.push_str(&chunk);
        }

        tracing::info!(
            session = %request.session_name,
            chars = text.len(),
            "Leo reply assembled"
        );

        Ok(NormalizedReply {
            text,
            success: true,
            session_id: Some(Self::format_session_id(&request.session_name)),
            ..NormalizedReply::default()
        })
    }

    async fn stream(
        &self,
        request: &AgentRequest,
    ) -> Result<mpsc::Receiver<String>, AgentError> {
        let response = self.open_stream(request).await?;
        let (tx, rx) = mpsc::channel(64);
        Self::spawn_reader(response, tx);
        Ok(rx)
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_message_content_delta() {
        let event = parse_sse_line(r#"data: {"type": "TEXT_MESSAGE_CONTENT", "delta": "He"}"#);
        assert_eq!(event, Some(SseEvent::Delta("He".into())));
    }

    #[test]
    fn parses_text_delta_under_alternate_keys() {
        assert_eq!(
            parse_sse_line(r#"data: {"type": "TEXT_DELTA", "delta": "a"}"#),
            Some(SseEvent::Delta("a".into()))
        );
        assert_eq!(
            parse_sse_line(r#"data: {"type": "TEXT_DELTA", "content": "b"}"#),
            Some(SseEvent::Delta("b".into()))
        );
        assert_eq!(
            parse_sse_line(r#"data: {"type": "TEXT_DELTA", "text": "c"}"#),
            Some(SseEvent::Delta("c".into()))
        );
    }

    #[test]
    fn parses_data_prefix_variants() {
        assert_eq!(
            parse_sse_line(r#"data:{"type": "TEXT_MESSAGE_CONTENT", "delta": "x"}"#),
            Some(SseEvent::Delta("x".into()))
        );
        assert_eq!(
            parse_sse_line(r#"data : {"type": "TEXT_MESSAGE_CONTENT", "delta": "y"}"#),
            Some(SseEvent::Delta("y".into()))
        );
    }

    #[test]
    fn skips_noise_lines() {
        assert_eq!(parse_sse_line(""), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("event: message"), None);
        assert_eq!(parse_sse_line("data: not-json"), None);
        assert_eq!(
            parse_sse_line(r#"data: {"type": "RUN_STARTED"}"#),
            None,
            "unknown event types are skipped"
        );
        assert_eq!(
            parse_sse_line(r#"data: {"type": "TEXT_MESSAGE_CONTENT", "delta": ""}"#),
            None,
            "empty deltas are skipped"
        );
    }

    #[test]
    fn recognizes_run_finished_and_snapshot() {
        assert_eq!(
            parse_sse_line(r#"data: {"type": "RUN_FINISHED"}"#),
            Some(SseEvent::RunFinished)
        );
        match parse_sse_line(r#"data: {"type": "STATE_SNAPSHOT", "snapshot": []}"#) {
            Some(SseEvent::Snapshot(v)) => assert_eq!(v["type"], "STATE_SNAPSHOT"),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_text_extracted_from_agent_path() {
        let snapshot = json!({
            "type": "STATE_SNAPSHOT",
            "snapshot": [
                {"ignored": true},
                {"agent_0": {"variables": {"nodes": {"agent_0": {"text": "from snapshot"}}}}}
            ]
        });
        assert_eq!(
            extract_snapshot_text(&snapshot).as_deref(),
            Some("from snapshot")
        );
    }

    #[test]
    fn snapshot_text_extracted_from_final_response_path() {
        let snapshot = json!({
            "snapshot": [
                {},
                {"final_response": {"variables": {"nodes": {"agent_0": {"text": "final"}}}}}
            ]
        });
        assert_eq!(extract_snapshot_text(&snapshot).as_deref(), Some("final"));
    }

    #[test]
    fn snapshot_without_known_paths_yields_none() {
        assert_eq!(extract_snapshot_text(&json!({"snapshot": []})), None);
        assert_eq!(
            extract_snapshot_text(&json!({"snapshot": [{}, {"other": {}}]})),
            None
        );
    }

    #[test]
    fn session_id_coerced_to_leo_form() {
        assert_eq!(
            LeoAgentClient::format_session_id("session_1700000000000"),
            "session_1700000000000"
        );
        assert!(LeoAgentClient::format_session_id("inst_5511").starts_with("session_"));
    }

    #[test]
    fn payload_carries_workflow_options() {
        let c = LeoAgentClient::new(
            "https://api.example.com/runtime".into(),
            "wf-1".into(),
            "tok".into(),
            "sub".into(),
            "20210511".into(),
            "DEV".into(),
            "v1".into(),
        );
        let payload = c.build_payload("hello", "session_1");
        assert_eq!(payload["interface"]["inputs"]["message"], "hello");
        assert_eq!(payload["options"]["sessionId"], "session_1");
        assert_eq!(payload["options"]["runtimeToken"], "Bearer tok");
        assert_eq!(payload["options"]["streamMode"], "verbose");
        assert_eq!(payload["bpc"], "20210511");
    }

    fn sse_body(lines: &[&str]) -> String {
        let mut body = String::new();
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
        body
    }

    async fn client_against(server: &wiremock::MockServer) -> LeoAgentClient {
        LeoAgentClient::new(
            server.uri(),
            "wf-1".into(),
            "tok".into(),
            "sub".into(),
            "20210511".into(),
            "DEV".into(),
            "v1".into(),
        )
    }

    #[tokio::test]
    async fn assembles_deltas_in_arrival_order() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflow-engine/wf-1/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&[
                r#"data: {"type": "TEXT_MESSAGE_CONTENT", "delta": "He"}"#,
                r#"data: {"type": "TEXT_MESSAGE_CONTENT", "delta": "llo"}"#,
                r#"data: {"type": "TEXT_MESSAGE_CONTENT", "delta": " world"}"#,
                r#"data: {"type": "RUN_FINISHED"}"#,
            ])))
            .mount(&server)
            .await;

        let c = client_against(&server).await;
        let reply = c
            .run(&AgentRequest {
                message: "hi".into(),
                session_name: "session_1".into(),
                ..AgentRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(reply.text, "Hello world");
        assert!(reply.success);
    }

    #[tokio::test]
    async fn stops_reading_at_first_run_finished() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflow-engine/wf-1/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&[
                r#"data: {"type": "TEXT_MESSAGE_CONTENT", "delta": "kept"}"#,
                r#"data: {"type": "RUN_FINISHED"}"#,
                r#"data: {"type": "TEXT_MESSAGE_CONTENT", "delta": " dropped"}"#,
            ])))
            .mount(&server)
            .await;

        let c = client_against(&server).await;
        let reply = c
            .run(&AgentRequest {
                message: "hi".into(),
                session_name: "session_1".into(),
                ..AgentRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(reply.text, "kept");
    }

    #[tokio::test]
    async fn empty_stream_falls_back_to_snapshot_then_canned_reply() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let snapshot_line = format!(
            "data: {}",
            json!({
                "type": "STATE_SNAPSHOT",
                "snapshot": [
                    {},
                    {"agent_0": {"variables": {"nodes": {"agent_0": {"text": "snapshot text"}}}}}
                ]
            })
        );
        Mock::given(method("POST"))
            .and(path("/workflow-engine/wf-1/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse_body(&[
                snapshot_line.as_str(),
                r#"data: {"type": "RUN_FINISHED"}"#,
            ])))
            .mount(&server)
            .await;

        let c = client_against(&server).await;
        let reply = c
            .run(&AgentRequest {
                message: "hi".into(),
                session_name: "session_1".into(),
                ..AgentRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(reply.text, "snapshot text");

        // Now a stream with nothing at all.
        let empty = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflow-engine/wf-1/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&[r#"data: {"type": "RUN_FINISHED"}"#])),
            )
            .mount(&empty)
            .await;
        let c = client_against(&empty).await;
        let reply = c
            .run(&AgentRequest {
                message: "hi".into(),
                session_name: "session_1".into(),
                ..AgentRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(reply.text, EMPTY_STREAM_REPLY);
    }

    #[tokio::test]
    async fn unauthorized_surfaces_credentials_error() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflow-engine/wf-1/stream"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Session has expired"))
            .mount(&server)
            .await;

        let c = client_against(&server).await;
        let err = c
            .run(&AgentRequest {
                message: "hi".into(),
                session_name: "session_1".into(),
                ..AgentRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CredentialsExpired(_)));
    }

    #[tokio::test]
    async fn other_server_errors_surface_api_error() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflow-engine/wf-1/stream"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let c = client_against(&server).await;
        let err = c
            .run(&AgentRequest {
                message: "hi".into(),
                session_name: "session_1".into(),
                ..AgentRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Api { status: 503, .. }));
    }
}
