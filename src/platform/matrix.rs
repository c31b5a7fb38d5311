// ABOUTME: Matrix implementation of the per-agent connection on top of matrix-sdk.
// ABOUTME: One Client per agent with its own sqlite store; sync cycles feed the session's channel.

use async_trait::async_trait;
use bihua_agent::{InboundMessage, Replier, ResidentId};
use bihua_core::error::FleetError;
use bihua_core::traits::{ChatConnection, SessionConnector};
use bihua_core::utils::now_epoch_ms;
use bihua_core::{paths, Config};
use matrix_sdk::{
    config::SyncSettings,
    event_handler::EventHandlerHandle,
    room::Room,
    ruma::{
        events::room::message::{
            MessageType, OriginalSyncRoomMessageEvent, RoomMessageEventContent,
            SyncRoomMessageEvent,
        },
        OwnedRoomId, OwnedRoomOrAliasId,
    },
    Client,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Opens a Matrix client per agent against the configured home server
pub struct MatrixConnector {
    config: Arc<Config>,
}

impl MatrixConnector {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for MatrixConnector {
    async fn connect(&self, agent_id: &str) -> Result<Box<dyn ChatConnection>, FleetError> {
        let id = ResidentId::parse(agent_id)
            .ok_or_else(|| FleetError::InvalidId(agent_id.to_string()))?;
        let store_dir = paths::session_store_dir(&self.config.data_home(), id.local_part());
        tokio::fs::create_dir_all(&store_dir)
            .await
            .map_err(|e| FleetError::io(&store_dir, e))?;

        let client = Client::builder()
            .homeserver_url(&self.config.messenger.home_server)
            .sqlite_store(&store_dir, None)
            .build()
            .await
            .map_err(|e| FleetError::Transport(format!("failed to create Matrix client: {}", e)))?;
        tracing::debug!(agent_id = %agent_id, store = %store_dir.display(), "Matrix client created");

        Ok(Box::new(MatrixConnection {
            agent_id: agent_id.to_string(),
            device_name: self.config.messenger.device_name.clone(),
            client,
            store_dir,
            sync_token: None,
            handler: None,
        }))
    }
}

pub struct MatrixConnection {
    agent_id: String,
    device_name: String,
    client: Client,
    store_dir: PathBuf,
    sync_token: Option<String>,
    handler: Option<EventHandlerHandle>,
}

impl fmt::Debug for MatrixConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixConnection")
            .field("agent_id", &self.agent_id)
            .field("store_dir", &self.store_dir)
            .field("synced", &self.sync_token.is_some())
            .finish()
    }
}

/// Plain-text body of a message event, if it carries one
fn text_body(msgtype: &MessageType) -> Option<&str> {
    match msgtype {
        MessageType::Text(text) => Some(&text.body),
        MessageType::Notice(notice) => Some(&notice.body),
        MessageType::Emote(emote) => Some(&emote.body),
        _ => None,
    }
}

/// Normalized form of a timeline message. None for non-text bodies and for
/// events older than `since_ms`.
fn to_inbound(
    event: &OriginalSyncRoomMessageEvent,
    room_id: &str,
    since_ms: i64,
) -> Option<InboundMessage> {
    let body = text_body(&event.content.msgtype)?;
    let millis: u64 = event.origin_server_ts.0.into();
    let timestamp_ms = millis as i64;
    if timestamp_ms < since_ms {
        return None;
    }
    Some(
        InboundMessage::new(
            event.event_id.to_string(),
            event.sender.to_string(),
            room_id,
            body,
        )
        .with_timestamp(timestamp_ms)
        .with_raw(serde_json::to_value(event).unwrap_or_default()),
    )
}

// sync_once awaits the event handler, so queueing must never wait on the session
fn enqueue(tx: &mpsc::UnboundedSender<InboundMessage>, agent_id: &str, message: InboundMessage) {
    if tx.send(message).is_err() {
        tracing::warn!(agent_id = %agent_id, "Inbound receiver dropped");
    }
}

#[async_trait]
impl ChatConnection for MatrixConnection {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        // backlog from the first sync predates the session and is not dispatched
        let since_ms = now_epoch_ms();
        let agent_id = self.agent_id.clone();

        let handle = self
            .client
            .add_event_handler(move |event: SyncRoomMessageEvent, room: Room| {
                let tx = tx.clone();
                let agent_id = agent_id.clone();
                async move {
                    let Some(original) = event.as_original() else {
                        return;
                    };
                    if let Some(message) = to_inbound(original, room.room_id().as_str(), since_ms) {
                        enqueue(&tx, &agent_id, message);
                    }
                }
            });

        if let Some(previous) = self.handler.replace(handle) {
            self.client.remove_event_handler(previous);
        }
        rx
    }

    async fn login(&mut self, secret: &str) -> Result<(), FleetError> {
        self.client
            .matrix_auth()
            .login_username(&self.agent_id, secret)
            .device_id(&self.device_name)
            .initial_device_display_name(&self.device_name)
            .send()
            .await
            .map_err(|e| FleetError::Auth {
                agent_id: self.agent_id.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(agent_id = %self.agent_id, "Logged in");
        Ok(())
    }

    async fn join(&mut self, room: &str) -> Result<(), FleetError> {
        let target: OwnedRoomOrAliasId = room
            .parse()
            .map_err(|e| FleetError::InvalidId(format!("{}: {}", room, e)))?;
        self.client
            .join_room_by_id_or_alias(&target, &[])
            .await
            .map_err(|e| FleetError::Transport(format!("failed to join {}: {}", room, e)))?;
        tracing::info!(agent_id = %self.agent_id, room = %room, "Joined room");
        Ok(())
    }

    async fn sync_cycle(&mut self, timeout: Duration) -> Result<(), FleetError> {
        let mut settings = SyncSettings::default().timeout(timeout);
        if let Some(token) = &self.sync_token {
            settings = settings.token(token.clone());
        }
        let response = self
            .client
            .sync_once(settings)
            .await
            .map_err(|e| FleetError::Transport(format!("sync failed: {}", e)))?;
        self.sync_token = Some(response.next_batch);
        Ok(())
    }

    fn replier(&self) -> Arc<dyn Replier> {
        Arc::new(MatrixReplier {
            agent_id: self.agent_id.clone(),
            client: self.client.clone(),
        })
    }

    async fn logout(&mut self) -> Result<(), FleetError> {
        if let Some(handle) = self.handler.take() {
            self.client.remove_event_handler(handle);
        }
        self.client
            .matrix_auth()
            .logout()
            .await
            .map_err(|e| FleetError::Transport(format!("logout failed: {}", e)))?;

        // the device is gone server-side, so its crypto store cannot be reused
        if let Err(e) = tokio::fs::remove_dir_all(&self.store_dir).await {
            tracing::warn!(
                agent_id = %self.agent_id,
                path = %self.store_dir.display(),
                error = %e,
                "Failed to remove session store"
            );
        }
        tracing::info!(agent_id = %self.agent_id, "Logged out");
        Ok(())
    }
}

/// Sends plain-text replies as one agent
struct MatrixReplier {
    agent_id: String,
    client: Client,
}

#[async_trait]
impl Replier for MatrixReplier {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn send_text(&self, room_id: &str, body: &str) -> anyhow::Result<()> {
        use anyhow::Context;

        let room_id: OwnedRoomId = room_id.parse().context("Invalid room ID")?;
        let room = self
            .client
            .get_room(&room_id)
            .context("Room not found")?;
        room.send(RoomMessageEventContent::text_plain(body))
            .await
            .context("Failed to send message")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_sdk::ruma::events::room::message::TextMessageEventContent;
    use serde_json::json;

    fn text_event(body: &str, origin_server_ts: i64) -> OriginalSyncRoomMessageEvent {
        serde_json::from_value(json!({
            "type": "m.room.message",
            "event_id": "$abc:example.org",
            "sender": "@carol:example.org",
            "origin_server_ts": origin_server_ts,
            "content": { "msgtype": "m.text", "body": body },
        }))
        .unwrap()
    }

    #[test]
    fn test_connection_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MatrixConnection>();
        assert_send_sync::<MatrixConnector>();
    }

    #[test]
    fn test_text_body() {
        let text = MessageType::Text(TextMessageEventContent::plain("hello"));
        assert_eq!(text_body(&text), Some("hello"));
    }

    #[test]
    fn test_to_inbound_keeps_whole_event_as_raw() {
        let event = text_event("hi there", 1_700_000_000_000);
        let message = to_inbound(&event, "!r:example.org", 0).unwrap();

        assert_eq!(message.body, "hi there");
        assert_eq!(message.sender, "@carol:example.org");
        assert_eq!(message.room_id, "!r:example.org");
        assert_eq!(message.raw["event_id"], "$abc:example.org");
        assert_eq!(message.raw["sender"], "@carol:example.org");
        assert_eq!(message.raw["origin_server_ts"], 1_700_000_000_000_i64);
        assert_eq!(message.raw["content"]["body"], "hi there");
    }

    #[test]
    fn test_to_inbound_skips_backlog() {
        let event = text_event("old news", 1_000);
        assert!(to_inbound(&event, "!r:example.org", 2_000).is_none());
    }

    #[test]
    fn test_enqueue_never_blocks_on_a_busy_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..1_000 {
            enqueue(
                &tx,
                "@echo:example.org",
                InboundMessage::new(format!("${}", i), "@carol:example.org", "!r:example.org", "hi"),
            );
        }

        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, 1_000);

        drop(rx);
        enqueue(
            &tx,
            "@echo:example.org",
            InboundMessage::new("$late", "@carol:example.org", "!r:example.org", "hi"),
        );
    }
}
