//! Message routing mediator.
//!
//! Given a normalized inbound message and the tenant's instance snapshot,
//! the router resolves a stable local user identity, builds the agent
//! request, dispatches it through the configured backend, and hands back a
//! [`NormalizedReply`]. Outbound delivery is the channel sender's job — the
//! router never touches a channel.

pub mod identity;

pub use identity::{LocalUser, UserStore};

use crate::agent::{self, AgentRequest, NormalizedReply};
use crate::config::{ChannelKind, InstanceConfig};
use crate::trace::TraceContext;
use crate::util::truncate_with_ellipsis;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// Agent payloads starting with this prefix are control traffic, not
/// conversation: swallowed silently, never delivered.
pub const SUPPRESS_SENTINEL: &str = "AUTOMAGIK:";

/// A normalized inbound message, channel differences already flattened.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub channel: Option<ChannelKind>,
    /// Raw channel-side sender id (WhatsApp JID, Discord user id).
    pub sender_id: String,
    /// Normalized stable id (digit phone / Discord user id).
    pub external_id: String,
    pub display_name: Option<String>,
    pub text: String,
    pub message_type: String,
    /// Pre-built media entries for the agent API (inline base64 preferred).
    pub media_contents: Option<Vec<Value>>,
    /// Extracted text of the message being replied to, if any.
    pub quoted_text: Option<String>,
    pub session_name: String,
}

/// An agent request plus the identity bookkeeping needed afterwards.
pub struct PreparedRequest {
    pub request: AgentRequest,
    pub local_user_id: Option<String>,
}

pub struct MessageRouter {
    users: Arc<UserStore>,
}

impl MessageRouter {
    pub fn new(users: Arc<UserStore>) -> Self {
        Self { users }
    }

    /// Resolve identity and assemble the agent request for an inbound
    /// message. Shared by the synchronous route path and the Discord
    /// streaming path.
    pub fn prepare(&self, inbound: &InboundMessage, instance: &InstanceConfig) -> PreparedRequest {
        let provider = inbound
            .channel
            .map_or("whatsapp", ChannelKind::as_str);

        let local_user = match self.users.resolve(
            provider,
            &inbound.external_id,
            &instance.name,
            inbound.display_name.as_deref(),
            &inbound.session_name,
        ) {
            Ok(user) => Some(user),
            Err(e) => {
                // Identity is an optimization; the agent can mint its own id.
                tracing::error!("failed to resolve local user: {e:#}");
                None
            }
        };

        let cached_agent_id = local_user
            .as_ref()
            .and_then(|u| u.cached_agent_user_id.clone());

        let user_descriptor = if cached_agent_id.is_none() {
            Some(self.user_descriptor(inbound))
        } else {
            None
        };

        let message = decorate_message(
            &inbound.text,
            inbound.quoted_text.as_deref(),
            inbound.display_name.as_deref(),
        );

        PreparedRequest {
            request: AgentRequest {
                message,
                session_name: inbound.session_name.clone(),
                user_id: cached_agent_id,
                user: user_descriptor,
                message_type: inbound.message_type.clone(),
                media_contents: inbound.media_contents.clone(),
                session_origin: provider.to_string(),
                context: None,
            },
            local_user_id: local_user.map(|u| u.id),
        }
    }

    /// Route one inbound message to the instance's agent backend.
    pub async fn route(
        &self,
        inbound: &InboundMessage,
        instance: &InstanceConfig,
        trace: Option<&TraceContext>,
    ) -> NormalizedReply {
        let prepared = self.prepare(inbound, instance);
        let client = agent::client_for(&instance.agent);

        if let Some(trace) = trace {
            trace.log_agent_request(&json!({
                "agent_backend": instance.agent.kind(),
                "session_name": prepared.request.session_name,
                "message": prepared.request.message,
                "message_type": prepared.request.message_type,
                "user_id": prepared.request.user_id,
                "user": prepared.request.user,
                "media_count": prepared
                    .request
                    .media_contents
                    .as_ref()
                    .map_or(0, Vec::len),
                "session_origin": prepared.request.session_origin,
            }));
        }

        let started = Instant::now();
        let mut reply = match client.run(&prepared.request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(
                    instance = %instance.name,
                    session = %prepared.request.session_name,
                    "agent call failed: {e}"
                );
                e.to_reply()
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as i64;

        if let Some(trace) = trace {
            trace.log_agent_response(
                &json!({
                    "message": reply.text,
                    "success": reply.success,
                    "session_id": reply.session_id,
                    "tool_calls": reply.tool_calls,
                    "usage": reply.usage,
                }),
                elapsed_ms,
            );
            trace.update_session_info(&prepared.request.session_name, reply.session_id.as_deref());
        }

        // Learn the agent-side user id for next time: the response itself is
        // preferred, the session endpoint is the fallback.
        if reply.success {
            let agent_user_id = match reply.agent_user_id.clone() {
                Some(id) => Some(id),
                None => client.session_user_id(&prepared.request.session_name).await,
            };
            if let (Some(local_id), Some(agent_id)) =
                (prepared.local_user_id.as_deref(), agent_user_id.as_deref())
            {
                if let Err(e) = self.users.set_agent_user_id(local_id, agent_id) {
                    tracing::warn!("failed to cache agent user id: {e:#}");
                }
                reply.agent_user_id = Some(agent_id.to_string());
            }
        }

        if reply.text.starts_with(SUPPRESS_SENTINEL) {
            tracing::warn!(
                session = %prepared.request.session_name,
                "swallowing control payload: {}",
                truncate_with_ellipsis(&reply.text, 80)
            );
            reply.suppressed = true;
        }

        reply
    }

    /// Cache an agent-side user id learned outside `route` (streaming path).
    pub fn record_agent_user(&self, local_user_id: &str, agent_user_id: &str) {
        if let Err(e) = self.users.set_agent_user_id(local_user_id, agent_user_id) {
            tracing::warn!("failed to cache agent user id: {e:#}");
        }
    }

    /// Channel-specific user-creation descriptor for the agent API.
    fn user_descriptor(&self, inbound: &InboundMessage) -> Value {
        let name = inbound.display_name.clone();
        match inbound.channel {
            Some(ChannelKind::Discord) => json!({
                "email": format!("{}@discord.user", inbound.external_id),
                "phone_number": null,
                "user_data": {
                    "name": name.unwrap_or_else(|| "Discord User".into()),
                    "discord_id": inbound.sender_id,
                    "source": "discord",
                },
            }),
            _ => json!({
                "phone_number": format!("+{}", inbound.external_id),
                "email": null,
                "user_data": {
                    "name": name.unwrap_or_else(|| "WhatsApp User".into()),
                    "whatsapp_id": inbound.sender_id,
                    "source": "whatsapp",
                },
            }),
        }
    }
}

/// Decorate the outgoing message text: prepend the quoted-reply context,
/// then tag the speaker, so multi-party history reads naturally to the agent.
pub fn decorate_message(text: &str, quoted: Option<&str>, display_name: Option<&str>) -> String {
    let mut content = text.to_string();

    if let Some(quoted) = quoted.filter(|q| !q.is_empty()) {
        let quoted = truncate_with_ellipsis(quoted, 200);
        content = format!("**Replying to:** {quoted}\n\n{content}");
    }

    if let Some(name) = display_name.filter(|n| !n.is_empty()) {
        content = format!("[{name}]: {content}");
    }

    content
}
