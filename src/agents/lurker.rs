// ABOUTME: Lurker agent: sits in the room and logs what it hears without answering.
// ABOUTME: Keeps a running count of overheard messages for its own log lines.

use anyhow::Result;
use async_trait::async_trait;
use bihua_agent::{InboundMessage, MessageHandler, Replier};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct LurkerHandler {
    agent_id: String,
    heard: AtomicU64,
}

impl LurkerHandler {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            heard: AtomicU64::new(0),
        }
    }

    pub fn heard(&self) -> u64 {
        self.heard.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageHandler for LurkerHandler {
    async fn on_message(&self, event: &InboundMessage, _replier: &dyn Replier) -> Result<()> {
        let heard = self.heard.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            agent_id = %self.agent_id,
            room = %event.room_id,
            sender = %event.sender,
            chars = event.body.chars().count(),
            heard,
            "Overheard message"
        );
        Ok(())
    }
}
