// ABOUTME: Scripted SessionConnector whose connections accept or reject logins on demand.
// ABOUTME: A ConnectionProbe per agent injects inbound messages and exposes what was sent.

use crate::error::FleetError;
use crate::traits::{ChatConnection, SessionConnector};
use async_trait::async_trait;
use bihua_agent::{InboundMessage, Replier};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Test-side view of one agent's connection
#[derive(Clone, Default)]
pub struct ConnectionProbe {
    agent_id: String,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>>,
    wake: Arc<Notify>,
    logins: Arc<Mutex<Vec<String>>>,
    joined: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    fail_sync: Arc<AtomicBool>,
    logged_out: Arc<AtomicBool>,
}

impl ConnectionProbe {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            ..Self::default()
        }
    }

    /// Queue a message for the next receive cycle. False when nobody subscribed yet.
    pub fn deliver(&self, event: InboundMessage) -> bool {
        let sender = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let delivered = sender.is_some_and(|tx| tx.send(event).is_ok());
        self.wake.notify_one();
        delivered
    }

    /// Make the next receive cycle fail
    pub fn break_sync(&self) {
        self.fail_sync.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Secrets presented at login, in order
    pub fn logins(&self) -> Vec<String> {
        self.logins.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn joined(&self) -> Vec<String> {
        self.joined.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `(room, body)` pairs sent through the replier
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ConnectorState {
    rejected_logins: HashSet<String>,
    rejected_joins: HashSet<String>,
    unreachable: HashSet<String>,
    probes: HashMap<String, ConnectionProbe>,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logins for this agent fail with an auth error
    pub fn reject_login(&self, agent_id: &str) -> &Self {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rejected_logins
            .insert(agent_id.to_string());
        self
    }

    /// Joins for this agent fail after a successful login
    pub fn reject_join(&self, agent_id: &str) -> &Self {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rejected_joins
            .insert(agent_id.to_string());
        self
    }

    /// Connecting this agent fails before any login
    pub fn unreachable(&self, agent_id: &str) -> &Self {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unreachable
            .insert(agent_id.to_string());
        self
    }

    pub fn probe(&self, agent_id: &str) -> Option<ConnectionProbe> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .probes
            .get(agent_id)
            .cloned()
    }

    /// Agents that were connected, sorted
    pub fn connected(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = state.probes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SessionConnector for MockConnector {
    async fn connect(&self, agent_id: &str) -> Result<Box<dyn ChatConnection>, FleetError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.unreachable.contains(agent_id) {
            return Err(FleetError::Transport(format!("{} unreachable", agent_id)));
        }
        let probe = ConnectionProbe::new(agent_id);
        state.probes.insert(agent_id.to_string(), probe.clone());
        Ok(Box::new(MockConnection {
            reject_login: state.rejected_logins.contains(agent_id),
            reject_join: state.rejected_joins.contains(agent_id),
            probe,
        }))
    }
}

struct MockConnection {
    reject_login: bool,
    reject_join: bool,
    probe: ConnectionProbe,
}

#[async_trait]
impl ChatConnection for MockConnection {
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .probe
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    async fn login(&mut self, secret: &str) -> Result<(), FleetError> {
        self.probe
            .logins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(secret.to_string());
        if self.reject_login {
            return Err(FleetError::Auth {
                agent_id: self.probe.agent_id.clone(),
                reason: "M_FORBIDDEN: invalid password".to_string(),
            });
        }
        Ok(())
    }

    async fn join(&mut self, room: &str) -> Result<(), FleetError> {
        self.probe
            .joined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(room.to_string());
        if self.reject_join {
            return Err(FleetError::Remote {
                status: 403,
                body: "M_FORBIDDEN: not invited".to_string(),
            });
        }
        Ok(())
    }

    async fn sync_cycle(&mut self, timeout: Duration) -> Result<(), FleetError> {
        let _ = tokio::time::timeout(timeout, self.probe.wake.notified()).await;
        if self.probe.fail_sync.load(Ordering::SeqCst) {
            return Err(FleetError::Transport("sync connection dropped".to_string()));
        }
        Ok(())
    }

    fn replier(&self) -> Arc<dyn Replier> {
        Arc::new(ProbeReplier {
            agent_id: self.probe.agent_id.clone(),
            sent: Arc::clone(&self.probe.sent),
        })
    }

    async fn logout(&mut self) -> Result<(), FleetError> {
        self.probe.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ProbeReplier {
    agent_id: String,
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Replier for ProbeReplier {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn send_text(&self, room_id: &str, body: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((room_id.to_string(), body.to_string()));
        Ok(())
    }
}
