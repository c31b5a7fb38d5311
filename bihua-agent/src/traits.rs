// ABOUTME: Handler-facing traits: MessageHandler receives events, Replier sends answers.
// ABOUTME: Both are object-safe so the registry can hand out Arc<dyn MessageHandler>.

use crate::InboundMessage;
use anyhow::Result;
use async_trait::async_trait;

/// Callback bound to one agent identity.
///
/// An agent session calls `on_message` once per inbound message, in arrival order.
/// Returning an error is logged by the session and does not stop it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message. `replier` speaks as the agent that received it.
    async fn on_message(&self, event: &InboundMessage, replier: &dyn Replier) -> Result<()>;
}

/// Outbound side of an agent connection, as seen by handlers.
#[async_trait]
pub trait Replier: Send + Sync {
    /// Resident id the replies are sent as
    fn agent_id(&self) -> &str;

    /// Send a plain-text message to a room
    async fn send_text(&self, room_id: &str, body: &str) -> Result<()>;
}
