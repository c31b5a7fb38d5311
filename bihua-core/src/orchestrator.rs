// ABOUTME: FleetOrchestrator bootstraps the shared room, registers agents and supervises sessions.
// ABOUTME: One agent's failure is contained to that agent; the run ends with a per-agent report.

use crate::config::Config;
use crate::directory::{fetch_all_snapshots, DirectoryItem};
use crate::entity::{
    Entity, EntityKind, GroupRecord, GroupSnapshot, ResidentRecord, ResidentSnapshot,
    AGENT_USER_TYPE,
};
use crate::error::{FleetError, Lookup};
use crate::session::{AgentSession, SessionSettings, SessionState};
use crate::store::EntityStateCache;
use crate::traits::{RemoteDirectory, RoomCreation, RoomService, SessionConnector};
use crate::utils::{qualify_room_alias, room_alias_local_part};
use bihua_agent::{discover_handler_sources, HandlerRegistry, Resolution, ResidentId};
use futures_util::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

type StatusBoard = Arc<Mutex<BTreeMap<String, SessionState>>>;

/// What to run: the shared room and where agents are discovered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetRequest {
    /// `lobby` or `#lobby:server`
    pub room_alias: String,
    pub room_topic: String,
    pub handler_dir: PathBuf,
}

impl FleetRequest {
    pub fn from_config(config: &Config) -> Result<Self, FleetError> {
        let room_alias = config.fleet.room_alias.clone().ok_or_else(|| {
            FleetError::Config(
                "fleet.room_alias is required (set in config.toml or BIHUA_ROOM_ALIAS env var)"
                    .to_string(),
            )
        })?;
        Ok(Self {
            room_alias,
            room_topic: config.fleet.room_topic.clone(),
            handler_dir: config.handler_dir(),
        })
    }
}

/// How the shared room was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomOutcome {
    Existing(String),
    Created(String),
}

impl RoomOutcome {
    pub fn room_id(&self) -> &str {
        match self {
            Self::Existing(id) | Self::Created(id) => id,
        }
    }
}

/// Final result for one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// Reached listening and stopped on shutdown
    Stopped,
    Failed { stage: String, reason: String },
    /// Not launched (no handler, disabled, deactivated)
    Skipped { reason: String },
    /// Did not stop within the shutdown grace period
    Aborted { last_state: String },
}

#[derive(Debug, Clone)]
pub struct FleetReport {
    pub room: RoomOutcome,
    pub agents: BTreeMap<String, AgentOutcome>,
}

impl FleetReport {
    fn ids_where(&self, pred: impl Fn(&AgentOutcome) -> bool) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.ids_where(|o| matches!(o, AgentOutcome::Stopped))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids_where(|o| matches!(o, AgentOutcome::Failed { .. } | AgentOutcome::Aborted { .. }))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.ids_where(|o| matches!(o, AgentOutcome::Skipped { .. }))
    }
}

pub struct FleetOrchestrator {
    config: Arc<Config>,
    directory: Arc<dyn RemoteDirectory>,
    rooms: Arc<dyn RoomService>,
    connector: Arc<dyn SessionConnector>,
    registry: Arc<HandlerRegistry>,
    residents: Arc<EntityStateCache<ResidentRecord>>,
    groups: Arc<EntityStateCache<GroupRecord>>,
    status: StatusBoard,
}

impl FleetOrchestrator {
    pub fn new(
        config: Arc<Config>,
        directory: Arc<dyn RemoteDirectory>,
        rooms: Arc<dyn RoomService>,
        connector: Arc<dyn SessionConnector>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let residents = Arc::new(EntityStateCache::from_config(&config, Arc::clone(&directory)));
        let groups = Arc::new(EntityStateCache::from_config(&config, Arc::clone(&directory)));
        Self {
            config,
            directory,
            rooms,
            connector,
            registry,
            residents,
            groups,
            status: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn residents(&self) -> Arc<EntityStateCache<ResidentRecord>> {
        Arc::clone(&self.residents)
    }

    pub fn groups(&self) -> Arc<EntityStateCache<GroupRecord>> {
        Arc::clone(&self.groups)
    }

    /// Current session state of every launched agent
    pub fn status(&self) -> BTreeMap<String, SessionState> {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn server_name(&self) -> Result<String, FleetError> {
        self.config.server_name().ok_or_else(|| {
            FleetError::Config("messenger.server_name is not configured".to_string())
        })
    }

    /// Resolve the alias, creating the room when it does not exist
    pub async fn ensure_room(&self, alias: &str, topic: &str) -> Result<RoomOutcome, FleetError> {
        if let Lookup::Found(room_id) = self.rooms.resolve_alias(alias).await? {
            tracing::info!(room = %room_id, alias = %alias, "Using existing room");
            return Ok(RoomOutcome::Existing(room_id));
        }

        let request = RoomCreation {
            alias: alias.to_string(),
            name: room_alias_local_part(alias).to_string(),
            topic: topic.to_string(),
        };
        match self.rooms.create_room(&request).await {
            Ok(room_id) => {
                tracing::info!(room = %room_id, alias = %alias, "Created room");
                Ok(RoomOutcome::Created(room_id))
            }
            Err(create_err) => {
                // someone else may have claimed the alias in the meantime
                match self.rooms.resolve_alias(alias).await {
                    Ok(Lookup::Found(room_id)) => {
                        tracing::info!(room = %room_id, alias = %alias, "Room appeared while creating, using it");
                        Ok(RoomOutcome::Existing(room_id))
                    }
                    _ => Err(create_err),
                }
            }
        }
    }

    async fn fetch_group_record(&self, room_id: &str) -> Result<Option<GroupRecord>, FleetError> {
        match self.directory.fetch_one(EntityKind::Group, room_id).await? {
            Lookup::Found(value) => {
                let snapshot: GroupSnapshot = serde_json::from_value(value)
                    .map_err(|e| FleetError::decode("group snapshot", e))?;
                self.groups
                    .create_or_update_from_remote(room_id, &snapshot)
                    .await
                    .map(Some)
            }
            Lookup::NotFound => Ok(None),
        }
    }

    async fn materialize_group(&self, room_id: &str) {
        match self.fetch_group_record(room_id).await {
            Ok(Some(_)) => tracing::debug!(room = %room_id, "Group record materialized"),
            Ok(None) => tracing::warn!(room = %room_id, "Room not visible in the admin directory"),
            Err(e) => tracing::warn!(room = %room_id, error = %e, "Failed to materialize group record"),
        }
    }

    /// Snapshot of every remote resident. Fails only when nothing could be fetched.
    async fn prefetch_residents(&self) -> Result<HashMap<String, ResidentSnapshot>, FleetError> {
        let mut snapshots = HashMap::new();
        let mut fetch_error = None;
        let mut stream =
            fetch_all_snapshots::<ResidentRecord>(self.directory.as_ref(), self.config.fleet.page_size);
        while let Some(item) = stream.next().await {
            match item {
                Ok(DirectoryItem::Snapshot(snapshot)) => {
                    snapshots.insert(ResidentRecord::snapshot_id(&snapshot).to_string(), snapshot);
                }
                Ok(DirectoryItem::Undecodable(e)) => {
                    tracing::warn!(error = %e, "Skipping undecodable resident");
                }
                Err(e) => fetch_error = Some(e),
            }
        }

        match fetch_error {
            Some(e) if snapshots.is_empty() => Err(e),
            Some(e) => {
                tracing::warn!(fetched = snapshots.len(), error = %e, "Resident directory only partially fetched");
                Ok(snapshots)
            }
            None => Ok(snapshots),
        }
    }

    /// Bring up every discovered agent and supervise it until all sessions end
    /// or `shutdown` fires.
    pub async fn run(
        &self,
        request: &FleetRequest,
        shutdown: CancellationToken,
    ) -> Result<FleetReport, FleetError> {
        let server_name = self.server_name()?;
        let alias = qualify_room_alias(&request.room_alias, &server_name);
        let room = self.ensure_room(&alias, &request.room_topic).await?;
        let room_id = room.room_id().to_string();
        self.materialize_group(&room_id).await;

        let short_names = discover_handler_sources(&request.handler_dir)
            .await
            .map_err(|e| FleetError::Config(e.to_string()))?;
        tracing::info!(count = short_names.len(), dir = %request.handler_dir.display(), "Discovered agents");

        let mut remote = self.prefetch_residents().await?;
        let members = match self.rooms.joined_members(&room_id).await {
            Ok(members) => Some(members),
            Err(e) => {
                tracing::warn!(room = %room_id, error = %e, "Could not list room members, agents will join");
                None
            }
        };

        let mut tasks = JoinSet::new();
        let mut task_agents = HashMap::new();
        for short_name in short_names {
            let agent_id = ResidentId::new(&short_name, &server_name).to_string();
            let launch = AgentLaunch {
                join_room: join_target(members.as_ref(), &agent_id, &room_id),
                remote: remote.remove(&agent_id),
                agent_id: agent_id.clone(),
                handler_dir: request.handler_dir.clone(),
                config: Arc::clone(&self.config),
                directory: Arc::clone(&self.directory),
                connector: Arc::clone(&self.connector),
                registry: Arc::clone(&self.registry),
                residents: Arc::clone(&self.residents),
                status: Arc::clone(&self.status),
                cancel: shutdown.child_token(),
            };
            let handle = tasks.spawn(launch.run());
            task_agents.insert(handle.id(), agent_id);
        }

        let mut agents = BTreeMap::new();
        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    Some(joined) => self.record(joined, &task_agents, &mut agents),
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }

        if !tasks.is_empty() {
            tracing::info!(remaining = tasks.len(), "Shutting down agent sessions");
            let grace = self.config.shutdown_grace();
            let drained = tokio::time::timeout(grace, async {
                while let Some(joined) = tasks.join_next_with_id().await {
                    self.record(joined, &task_agents, &mut agents);
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!(remaining = tasks.len(), "Grace period elapsed, aborting sessions");
                tasks.abort_all();
                while let Some(joined) = tasks.join_next_with_id().await {
                    self.record(joined, &task_agents, &mut agents);
                }
            }
        }

        let report = FleetReport { room, agents };
        tracing::info!(
            stopped = report.succeeded().len(),
            failed = report.failed().len(),
            skipped = report.skipped().len(),
            "Fleet run finished"
        );
        Ok(report)
    }

    fn record(
        &self,
        joined: Result<(tokio::task::Id, AgentOutcome), JoinError>,
        task_agents: &HashMap<tokio::task::Id, String>,
        agents: &mut BTreeMap<String, AgentOutcome>,
    ) {
        let (task_id, outcome) = match joined {
            Ok((task_id, outcome)) => (task_id, outcome),
            Err(e) => {
                let last_state = task_agents
                    .get(&e.id())
                    .and_then(|agent_id| self.status().get(agent_id).map(ToString::to_string))
                    .unwrap_or_else(|| SessionState::Created.to_string());
                let outcome = if e.is_cancelled() {
                    AgentOutcome::Aborted { last_state }
                } else {
                    AgentOutcome::Failed {
                        stage: "task".to_string(),
                        reason: e.to_string(),
                    }
                };
                (e.id(), outcome)
            }
        };
        if let Some(agent_id) = task_agents.get(&task_id) {
            agents.insert(agent_id.clone(), outcome);
        }
    }
}

/// `None` when the agent already sits in the room
fn join_target(members: Option<&HashSet<String>>, agent_id: &str, room_id: &str) -> Option<String> {
    match members {
        Some(members) if members.contains(agent_id) => None,
        _ => Some(room_id.to_string()),
    }
}

/// Everything one agent's task owns
struct AgentLaunch {
    agent_id: String,
    handler_dir: PathBuf,
    join_room: Option<String>,
    remote: Option<ResidentSnapshot>,
    config: Arc<Config>,
    directory: Arc<dyn RemoteDirectory>,
    connector: Arc<dyn SessionConnector>,
    registry: Arc<HandlerRegistry>,
    residents: Arc<EntityStateCache<ResidentRecord>>,
    status: StatusBoard,
    cancel: CancellationToken,
}

impl AgentLaunch {
    fn failed(&self, stage: &str, error: impl std::fmt::Display) -> AgentOutcome {
        tracing::error!(agent_id = %self.agent_id, stage, error = %error, "Agent setup failed");
        metrics::counter!("bihua_sessions_failed_total", "stage" => stage.to_string()).increment(1);
        AgentOutcome::Failed {
            stage: stage.to_string(),
            reason: error.to_string(),
        }
    }

    fn skipped(&self, reason: String) -> AgentOutcome {
        tracing::info!(agent_id = %self.agent_id, reason = %reason, "Agent skipped");
        AgentOutcome::Skipped { reason }
    }

    async fn run(self) -> AgentOutcome {
        let resolved = match self.registry.resolve(&self.agent_id, &self.handler_dir).await {
            Ok(Resolution::Found(resolved)) => resolved,
            Ok(Resolution::NotFound(missing)) => {
                return self.skipped(format!("no handler: {}", missing))
            }
            Err(e) => return self.failed("handler", e),
        };
        if !resolved.manifest.enabled {
            return self.skipped("disabled in handler manifest".to_string());
        }

        let display_name = resolved.manifest.display_name.clone();
        let record = match self.ensure_registered(display_name.as_deref()).await {
            Ok(record) => record,
            Err(e) => return self.failed("register", e),
        };
        if !record.is_active() {
            return self.skipped("resident is deactivated".to_string());
        }

        let secret = match self
            .config
            .resolve_credential(&self.agent_id, &record.credential_ref)
        {
            Ok(secret) => secret,
            Err(e) => return self.failed("credential", e),
        };

        let connection = match self.connector.connect(&self.agent_id).await {
            Ok(connection) => connection,
            Err(e) => return self.failed("connect", e),
        };

        let session = AgentSession::new(
            self.agent_id.clone(),
            connection,
            resolved.handler,
            Arc::clone(&self.residents),
            SessionSettings {
                secret,
                join_room: self.join_room.clone(),
                sync_timeout: self.config.sync_timeout(),
            },
        );
        self.mirror_state(&session);
        metrics::counter!("bihua_sessions_started_total").increment(1);

        match session.run(self.cancel.clone()).await {
            SessionState::Failed(reason) => AgentOutcome::Failed {
                stage: "session".to_string(),
                reason,
            },
            _ => AgentOutcome::Stopped,
        }
    }

    /// Copy session state transitions onto the orchestrator's status board
    fn mirror_state(&self, session: &AgentSession) {
        let mut states = session.subscribe_state();
        let status = Arc::clone(&self.status);
        let agent_id = self.agent_id.clone();
        tokio::spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                status
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(agent_id.clone(), state);
                if states.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Make sure the agent exists remotely and has a local record
    async fn ensure_registered(
        &self,
        display_name: Option<&str>,
    ) -> Result<ResidentRecord, FleetError> {
        if let Some(snapshot) = &self.remote {
            return self
                .residents
                .create_or_update_from_remote(&self.agent_id, snapshot)
                .await;
        }

        if let Some(snapshot) = self.fetch_remote().await? {
            return self
                .residents
                .create_or_update_from_remote(&self.agent_id, &snapshot)
                .await;
        }

        let password = self.config.fleet.agent_password.clone().ok_or_else(|| FleetError::Auth {
            agent_id: self.agent_id.clone(),
            reason: "no agent password configured for registration".to_string(),
        })?;
        let local_part = ResidentId::parse(&self.agent_id)
            .map(|id| id.local_part().to_string())
            .unwrap_or_else(|| self.agent_id.clone());
        let body = json!({
            "password": password,
            "displayname": display_name.unwrap_or(&local_part),
            "admin": self.config.fleet.register_as_admin,
            "deactivated": false,
            "user_type": AGENT_USER_TYPE,
        });
        self.directory
            .put(EntityKind::Resident, &self.agent_id, &body)
            .await?;
        tracing::info!(agent_id = %self.agent_id, "Registered agent");

        let snapshot = self.fetch_remote().await?.ok_or_else(|| FleetError::NotFound {
            kind: EntityKind::Resident.to_string(),
            id: self.agent_id.clone(),
        })?;
        self.residents
            .create_or_update_from_remote(&self.agent_id, &snapshot)
            .await
    }

    async fn fetch_remote(&self) -> Result<Option<ResidentSnapshot>, FleetError> {
        match self
            .directory
            .fetch_one(EntityKind::Resident, &self.agent_id)
            .await?
        {
            Lookup::Found(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| FleetError::decode("resident snapshot", e)),
            Lookup::NotFound => Ok(None),
        }
    }
}
