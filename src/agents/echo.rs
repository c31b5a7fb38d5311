// ABOUTME: Echo agent: repeats the text after its trigger back into the room.
// ABOUTME: "!echo hello there" is answered with "hello there"; everything else is ignored.

use anyhow::Result;
use async_trait::async_trait;
use bihua_agent::{InboundMessage, MessageHandler, Replier};

const DEFAULT_TRIGGER: &str = "!echo";

pub struct EchoHandler {
    trigger: String,
}

impl EchoHandler {
    pub fn with_trigger(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
        }
    }

    /// Text to echo, if the message starts with the trigger followed by whitespace
    fn payload<'a>(&self, body: &'a str) -> Option<&'a str> {
        let rest = body.trim_start().strip_prefix(self.trigger.as_str())?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let text = rest.trim();
        (!text.is_empty()).then_some(text)
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::with_trigger(DEFAULT_TRIGGER)
    }
}

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn on_message(&self, event: &InboundMessage, replier: &dyn Replier) -> Result<()> {
        let Some(text) = self.payload(&event.body) else {
            return Ok(());
        };
        tracing::debug!(agent_id = %replier.agent_id(), room = %event.room_id, "Echoing message");
        replier.send_text(&event.room_id, text).await
    }
}
