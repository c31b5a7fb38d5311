// ABOUTME: Recording handler and replier that capture traffic for assertions.
// ABOUTME: RecordingHandler can optionally answer every message with a fixed prefix.

use crate::{InboundMessage, MessageHandler, Replier};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Handler that records every event it sees
#[derive(Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<InboundMessage>>>,
    reply_prefix: Option<String>,
    notify: Arc<Notify>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer each message with `<prefix><body>` in the same room
    pub fn replying(prefix: &str) -> Self {
        Self {
            reply_prefix: Some(prefix.to_string()),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<InboundMessage> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait until at least `count` events have been recorded
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.events.lock().unwrap_or_else(|e| e.into_inner()).len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, event: &InboundMessage, replier: &dyn Replier) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        self.notify.notify_waiters();

        if let Some(prefix) = &self.reply_prefix {
            replier
                .send_text(&event.room_id, &format!("{}{}", prefix, event.body))
                .await?;
        }
        Ok(())
    }
}

/// Handler that always fails, for checking that errors stay contained
#[derive(Clone, Default)]
pub struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn on_message(&self, event: &InboundMessage, _replier: &dyn Replier) -> Result<()> {
        anyhow::bail!("handler refused event {}", event.event_id)
    }
}

/// Replier that records `(room_id, body)` pairs instead of sending them
#[derive(Clone)]
pub struct RecordingReplier {
    agent_id: String,
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingReplier {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Replier for RecordingReplier {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn send_text(&self, room_id: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((room_id.to_string(), body.to_string()));
        Ok(())
    }
}
