// ABOUTME: Seams to the remote chat service: admin directory, rooms, and per-agent connections.
// ABOUTME: The Matrix binary implements these; tests substitute in-memory doubles.

use crate::entity::EntityKind;
use crate::error::{FleetError, Lookup};
use async_trait::async_trait;
use bihua_agent::{InboundMessage, Replier};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Read and register access to the remote entity directory
#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    /// One page of raw snapshots starting at offset `from`. An empty page ends pagination.
    async fn fetch_page(
        &self,
        kind: EntityKind,
        from: u64,
        limit: u64,
    ) -> Result<Vec<Value>, FleetError>;

    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<Lookup<Value>, FleetError>;

    /// Create or update an entity remotely
    async fn put(&self, kind: EntityKind, id: &str, body: &Value) -> Result<(), FleetError>;
}

/// What the orchestrator asks for when the shared room does not exist yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomCreation {
    /// Fully qualified alias, `#name:server`
    pub alias: String,
    pub name: String,
    pub topic: String,
}

#[async_trait]
pub trait RoomService: Send + Sync {
    /// Room id behind an alias
    async fn resolve_alias(&self, alias: &str) -> Result<Lookup<String>, FleetError>;

    /// Create a public, federated room and return its id
    async fn create_room(&self, request: &RoomCreation) -> Result<String, FleetError>;

    async fn joined_members(&self, room_id: &str) -> Result<HashSet<String>, FleetError>;
}

/// Opens one authenticated connection per agent
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, agent_id: &str) -> Result<Box<dyn ChatConnection>, FleetError>;
}

/// A single agent's connection to the chat service
#[async_trait]
pub trait ChatConnection: Send + Sync {
    /// Inbound text messages are delivered on the returned channel. Delivery
    /// never waits on the receiver. Must be called before `login` so no event
    /// is missed.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<InboundMessage>;

    /// Fails with `FleetError::Auth` when the secret is rejected
    async fn login(&mut self, secret: &str) -> Result<(), FleetError>;

    async fn join(&mut self, room: &str) -> Result<(), FleetError>;

    /// One receive cycle, bounded by `timeout`. Events land on the subscribed channel.
    async fn sync_cycle(&mut self, timeout: Duration) -> Result<(), FleetError>;

    /// Sends replies as this agent
    fn replier(&self) -> Arc<dyn Replier>;

    async fn logout(&mut self) -> Result<(), FleetError>;
}
