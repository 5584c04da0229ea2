//! Agent backend clients.
//!
//! Two protocol families sit behind one seam: plain JSON REST
//! (Automagik/Hive) and the Leo workflow engine's SSE streaming protocol.
//! Whatever the backend speaks, callers get a [`NormalizedReply`] — the only
//! value channel senders consume.

pub mod rest;
pub mod sse;

pub use rest::RestAgentClient;
pub use sse::LeoAgentClient;

use crate::config::AgentBackend;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Localized user-facing fallbacks. The original deployment serves Brazilian
/// Portuguese users; the strings travel with the behavior.
pub const TIMEOUT_REPLY: &str =
    "Desculpe, está demorando mais do que o esperado para responder. Por favor, tente novamente.";
pub const TRANSPORT_ERROR_REPLY: &str =
    "Desculpe, encontrei um erro ao me comunicar com meu cérebro. Por favor, tente novamente.";
pub const UNEXPECTED_ERROR_REPLY: &str =
    "Desculpe, encontrei um erro inesperado. Por favor, tente novamente.";
pub const CREDENTIALS_EXPIRED_REPLY: &str =
    "Agent API authentication failed: credentials have expired. Please update the agent configuration with fresh credentials.";

/// Returned when a stream produced neither deltas nor a usable snapshot.
pub const EMPTY_STREAM_REPLY: &str =
    "I processed your request, but couldn't extract a response.";

/// Channel-agnostic result of an agent call.
#[derive(Debug, Clone, Default)]
pub struct NormalizedReply {
    pub text: String,
    pub success: bool,
    pub session_id: Option<String>,
    /// Agent-side user id, when the backend reported one.
    pub agent_user_id: Option<String>,
    pub tool_calls: Vec<Value>,
    pub usage: Value,
    /// Pre-chunked progressive parts, when the backend supplies them.
    pub streaming_chunks: Option<Vec<String>>,
    /// Set when the reply must not be delivered (sentinel-prefixed payloads).
    pub suppressed: bool,
}

impl NormalizedReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            ..Self::default()
        }
    }

    /// A user-facing fallback reply for a failed agent call.
    pub fn apology(text: &str) -> Self {
        Self {
            text: text.to_string(),
            success: false,
            ..Self::default()
        }
    }

    /// Whether a channel sender should deliver this reply.
    pub fn should_deliver(&self) -> bool {
        !self.suppressed && !self.text.trim().is_empty()
    }
}

/// Request handed to an agent backend.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub message: String,
    pub session_name: String,
    /// Cached agent-side user id from a prior interaction, when known.
    pub user_id: Option<String>,
    /// User-creation descriptor sent when no cached id exists; the backend
    /// mints the stable id.
    pub user: Option<Value>,
    pub message_type: String,
    pub media_contents: Option<Vec<Value>>,
    pub session_origin: String,
    pub context: Option<Value>,
}

/// Errors an agent backend call can surface.
///
/// `CredentialsExpired` is deliberately distinct from transport failures:
/// downstream UX prompts credential rotation instead of retrying.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent credentials expired or invalid (HTTP 401): {0}")]
    CredentialsExpired(String),

    #[error("agent call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("agent transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("agent API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("agent response could not be parsed: {0}")]
    Parse(String),
}

impl AgentError {
    /// Map an error to the localized reply a user should see.
    pub fn to_reply(&self) -> NormalizedReply {
        match self {
            AgentError::Timeout { .. } => NormalizedReply::apology(TIMEOUT_REPLY),
            AgentError::CredentialsExpired(_) => {
                NormalizedReply::apology(CREDENTIALS_EXPIRED_REPLY)
            }
            AgentError::Transport(_) | AgentError::Api { .. } => {
                NormalizedReply::apology(TRANSPORT_ERROR_REPLY)
            }
            AgentError::Parse(_) => NormalizedReply::apology(UNEXPECTED_ERROR_REPLY),
        }
    }
}

/// One agent backend. `stream` is lazy and finite; every call re-issues the
/// network request.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn run(&self, request: &AgentRequest) -> Result<NormalizedReply, AgentError>;

    /// Stream the reply as ordered text chunks. Backends without native
    /// streaming fall back to one chunk carrying the whole reply.
    async fn stream(
        &self,
        request: &AgentRequest,
    ) -> Result<mpsc::Receiver<String>, AgentError> {
        let reply = self.run(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let text = if reply.text.is_empty() {
            UNEXPECTED_ERROR_REPLY.to_string()
        } else {
            reply.text
        };
        // Receiver may be dropped before reading; that is not an error.
        let _ = tx.send(text).await;
        Ok(rx)
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Authoritative agent-side user id for a session, when the backend can
    /// report one. Best-effort; `None` is always acceptable.
    async fn session_user_id(&self, _session_name: &str) -> Option<String> {
        None
    }
}

/// Build the client for an instance's configured backend.
pub fn client_for(backend: &AgentBackend) -> Box<dyn AgentClient> {
    match backend {
        AgentBackend::Automagik {
            api_url,
            api_key,
            agent_id,
            timeout_secs,
        }
        | AgentBackend::Hive {
            api_url,
            api_key,
            agent_id,
            timeout_secs,
            ..
        } => Box::new(RestAgentClient::new(
            api_url.clone(),
            api_key.clone(),
            agent_id.clone(),
            *timeout_secs,
        )),
        AgentBackend::Leo {
            api_url,
            workflow_id,
            bearer_token,
            subscription_key,
            bpc,
            environment,
            version,
        } => Box::new(LeoAgentClient::new(
            api_url.clone(),
            workflow_id.clone(),
            bearer_token.clone(),
            subscription_key.clone(),
            bpc.clone(),
            environment.clone(),
            version.clone(),
        )),
    }
}

/// Deterministic session id from a session name: retries and re-deliveries
/// for the same session must map to the same id.
pub fn deterministic_session_id(session_name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, session_name.as_bytes()).to_string()
}

/// Coerce an arbitrary identifier into the uuid form the agent API requires.
/// Valid uuids pass through; anything else maps deterministically.
pub fn coerce_user_id(raw: &str) -> String {
    if Uuid::parse_str(raw).is_ok() {
        raw.to_string()
    } else {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes()).to_string()
    }
}
