// ABOUTME: AgentSession drives one agent: login, optional join, then the receive-dispatch loop.
// ABOUTME: Publishes its lifecycle state on a watch channel and stops on cancellation.

use crate::entity::{ResidentPatch, ResidentRecord};
use crate::error::FleetError;
use crate::store::EntityStateCache;
use crate::traits::ChatConnection;
use crate::utils::now_epoch_ms;
use bihua_agent::{InboundMessage, MessageHandler, Replier};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Lifecycle of an agent session.
///
/// `Created -> Authenticating -> Listening -> Stopped`, with `Failed` reachable
/// from `Authenticating` and `Listening`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Authenticating,
    Listening,
    Stopped,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Listening => f.write_str("listening"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Everything a session needs besides its connection and handler
pub struct SessionSettings {
    /// Secret resolved from the agent's credential reference
    pub secret: String,
    /// Room to join after login, when the agent is not a member yet
    pub join_room: Option<String>,
    pub sync_timeout: Duration,
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("secret", &"[REDACTED]")
            .field("join_room", &self.join_room)
            .field("sync_timeout", &self.sync_timeout)
            .finish()
    }
}

pub struct AgentSession {
    agent_id: String,
    connection: Box<dyn ChatConnection>,
    handler: Arc<dyn MessageHandler>,
    residents: Arc<EntityStateCache<ResidentRecord>>,
    settings: SessionSettings,
    state_tx: watch::Sender<SessionState>,
}

impl AgentSession {
    pub fn new(
        agent_id: impl Into<String>,
        connection: Box<dyn ChatConnection>,
        handler: Arc<dyn MessageHandler>,
        residents: Arc<EntityStateCache<ResidentRecord>>,
        settings: SessionSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Created);
        Self {
            agent_id: agent_id.into(),
            connection,
            handler,
            residents,
            settings,
            state_tx,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, state: SessionState) {
        tracing::debug!(agent_id = %self.agent_id, state = %state, "Session state changed");
        self.state_tx.send_replace(state);
    }

    /// Run until cancelled or failed, returning the terminal state
    pub async fn run(mut self, cancel: CancellationToken) -> SessionState {
        let mut inbound = self.connection.subscribe();

        self.transition(SessionState::Authenticating);
        if let Err(e) = self.connection.login(&self.settings.secret).await {
            return self.fail("login", e);
        }
        tracing::info!(agent_id = %self.agent_id, "Agent logged in");

        // logged in from here on: every exit goes through logout
        let outcome = self.serve(&mut inbound, &cancel).await;

        if let Err(e) = self.connection.logout().await {
            tracing::debug!(agent_id = %self.agent_id, error = %e, "Logout failed");
        }
        if outcome == SessionState::Stopped {
            tracing::info!(agent_id = %self.agent_id, "Agent session stopped");
        }
        self.transition(outcome.clone());
        outcome
    }

    async fn serve(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<InboundMessage>,
        cancel: &CancellationToken,
    ) -> SessionState {
        if let Err(e) = self
            .residents
            .patch(&self.agent_id, &ResidentPatch::last_login(now_epoch_ms()))
            .await
        {
            tracing::warn!(agent_id = %self.agent_id, error = %e, "Failed to record last login");
        }

        if let Some(room) = self.settings.join_room.clone() {
            if let Err(e) = self.connection.join(&room).await {
                return self.failed_state("join", e);
            }
            tracing::info!(agent_id = %self.agent_id, room = %room, "Agent joined room");
        }

        self.transition(SessionState::Listening);
        metrics::counter!("bihua_sessions_listening_total").increment(1);
        let replier = self.connection.replier();

        loop {
            if cancel.is_cancelled() {
                break SessionState::Stopped;
            }
            if let Err(e) = self.connection.sync_cycle(self.settings.sync_timeout).await {
                break self.failed_state("sync", e);
            }
            self.dispatch_pending(inbound, replier.as_ref()).await;
        }
    }

    /// Deliver everything received during the last cycle, in arrival order
    async fn dispatch_pending(
        &self,
        inbound: &mut mpsc::UnboundedReceiver<InboundMessage>,
        replier: &dyn Replier,
    ) {
        while let Ok(event) = inbound.try_recv() {
            if event.is_from(&self.agent_id) {
                continue;
            }
            tracing::debug!(
                agent_id = %self.agent_id,
                room = %event.room_id,
                sender = %event.sender,
                "Dispatching message"
            );
            metrics::counter!("bihua_messages_dispatched_total").increment(1);
            if let Err(e) = self.handler.on_message(&event, replier).await {
                metrics::counter!("bihua_handler_errors_total").increment(1);
                tracing::warn!(
                    agent_id = %self.agent_id,
                    event_id = %event.event_id,
                    error = %e,
                    "Handler failed on message"
                );
            }
        }
    }

    fn failed_state(&self, stage: &str, error: FleetError) -> SessionState {
        tracing::error!(agent_id = %self.agent_id, stage, error = %error, "Agent session failed");
        metrics::counter!("bihua_sessions_failed_total", "stage" => stage.to_string()).increment(1);
        SessionState::Failed(format!("{}: {}", stage, error))
    }

    fn fail(&self, stage: &str, error: FleetError) -> SessionState {
        let state = self.failed_state(stage, error);
        self.transition(state.clone());
        state
    }
}
