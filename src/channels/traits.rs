use async_trait::async_trait;

/// Narrow seam over an outbound channel: enough for the gateway and the IPC
/// surface to deliver replies without knowing provider details. Concrete
/// senders keep their richer inherent APIs (quotes, mentions, streaming).
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name ("whatsapp", "discord").
    fn name(&self) -> &str;

    /// Deliver a plain text reply to a recipient (JID / channel id).
    async fn send_text(&self, recipient: &str, text: &str) -> bool;

    /// Signal that a reply is being composed. Implementations repeat the
    /// indicator as their platform requires.
    async fn start_typing(&self, _recipient: &str) {}

    /// Stop any active typing indicator. Must be idempotent.
    async fn stop_typing(&self, _recipient: &str) {}

    /// Whether the provider side currently looks reachable.
    async fn health_check(&self) -> bool {
        true
    }
}
