// ABOUTME: Greeter agent: answers "hello" or "hi" with a greeting addressed to the sender.
// ABOUTME: The greeting word can be changed through the handler manifest's params.

use anyhow::Result;
use async_trait::async_trait;
use bihua_agent::{InboundMessage, MessageHandler, Replier};

const GREETING_WORDS: [&str; 2] = ["hello", "hi"];

pub struct GreeterHandler {
    greeting: String,
}

impl GreeterHandler {
    pub fn with_greeting(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
        }
    }
}

impl Default for GreeterHandler {
    fn default() -> Self {
        Self::with_greeting("Hello")
    }
}

fn is_greeting(body: &str) -> bool {
    let word = body
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase();
    GREETING_WORDS.contains(&word.as_str())
}

#[async_trait]
impl MessageHandler for GreeterHandler {
    async fn on_message(&self, event: &InboundMessage, replier: &dyn Replier) -> Result<()> {
        if !is_greeting(&event.body) {
            return Ok(());
        }
        let reply = format!("{}, {}!", self.greeting, event.sender);
        replier.send_text(&event.room_id, &reply).await
    }
}
