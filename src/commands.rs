// ABOUTME: Implementations of the CLI subcommands on top of bihua-core.
// ABOUTME: run drives the fleet orchestrator; the rest operate on one entity kind's cache.

use crate::agents::register_builtin;
use crate::platform::MatrixConnector;
use anyhow::{Context, Result};
use bihua_agent::HandlerRegistry;
use bihua_core::{
    resync, AgentOutcome, Config, Entity, EntityKind, EntityStateCache, FieldPatch,
    FleetOrchestrator, FleetReport, FleetRequest, GroupRecord, RemoteDirectory,
    RemoteDirectoryClient, ResidentRecord,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// CLI overrides for `run`
#[derive(Debug, Default)]
pub struct RunOptions {
    pub room_alias: Option<String>,
    pub room_topic: Option<String>,
    pub handler_dir: Option<PathBuf>,
}

impl RunOptions {
    fn request(self, config: &Config) -> Result<FleetRequest> {
        let room_alias = self
            .room_alias
            .or_else(|| config.fleet.room_alias.clone())
            .context("No room alias given (use --room-alias, fleet.room_alias or BIHUA_ROOM_ALIAS)")?;
        Ok(FleetRequest {
            room_alias,
            room_topic: self
                .room_topic
                .unwrap_or_else(|| config.fleet.room_topic.clone()),
            handler_dir: self.handler_dir.unwrap_or_else(|| config.handler_dir()),
        })
    }
}

fn directory(config: &Config) -> Result<Arc<RemoteDirectoryClient>> {
    let client = RemoteDirectoryClient::from_config(config)
        .context("Failed to create directory client")?;
    Ok(Arc::new(client))
}

fn cache<E: Entity>(config: &Config) -> Result<EntityStateCache<E>> {
    let directory: Arc<dyn RemoteDirectory> = directory(config)?;
    Ok(EntityStateCache::from_config(config, directory))
}

/// Run the fleet until every session ends or Ctrl-C is pressed
pub async fn run(config: Arc<Config>, options: RunOptions) -> Result<FleetReport> {
    let request = options.request(&config)?;
    let directory = directory(&config)?;
    let registry = register_builtin(HandlerRegistry::new());
    tracing::info!(symbols = ?registry.symbols(), "Handlers registered");

    let orchestrator = FleetOrchestrator::new(
        Arc::clone(&config),
        directory.clone(),
        directory,
        Arc::new(MatrixConnector::new(Arc::clone(&config))),
        Arc::new(registry),
    );

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, stopping agents");
                on_signal.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let report = orchestrator
        .run(&request, shutdown)
        .await
        .context("Fleet run aborted")?;
    Ok(report)
}

/// Human-readable fleet report, one line per agent
pub fn format_report(report: &FleetReport) -> String {
    let mut out = format!("room {}\n", report.room.room_id());
    for (agent_id, outcome) in &report.agents {
        let line = match outcome {
            AgentOutcome::Stopped => "stopped".to_string(),
            AgentOutcome::Failed { stage, reason } => format!("failed at {}: {}", stage, reason),
            AgentOutcome::Skipped { reason } => format!("skipped: {}", reason),
            AgentOutcome::Aborted { last_state } => format!("aborted while {}", last_state),
        };
        out.push_str(&format!("  {:<32} {}\n", agent_id, line));
    }
    out.push_str(&format!(
        "{} stopped, {} failed, {} skipped",
        report.succeeded().len(),
        report.failed().len(),
        report.skipped().len()
    ));
    out
}

pub async fn sync(config: &Config, kind: EntityKind) -> Result<()> {
    match kind {
        EntityKind::Resident => sync_kind::<ResidentRecord>(config).await,
        EntityKind::Group => sync_kind::<GroupRecord>(config).await,
    }
}

async fn sync_kind<E: Entity>(config: &Config) -> Result<()> {
    let directory = directory(config)?;
    let cache = EntityStateCache::<E>::from_config(config, directory.clone());
    let report = resync(&cache, &*directory, config.fleet.page_size).await;

    println!("merged {} {}", report.merged.len(), E::KIND);
    for error in &report.errors {
        println!("  error: {}", error);
    }
    if let Some(e) = report.fetch_error {
        anyhow::bail!("Directory listing stopped early: {}", e);
    }
    Ok(())
}

/// One-line summary used by `list`
pub trait Summary {
    fn summary(&self) -> String;
}

impl Summary for ResidentRecord {
    fn summary(&self) -> String {
        format!(
            "{:<32} {:<24} {:?}/{:?}/{:?}",
            self.id, self.display_name, self.kind, self.role, self.lifecycle_state
        )
    }
}

impl Summary for GroupRecord {
    fn summary(&self) -> String {
        format!(
            "{:<32} {:<24} {} members, {:?}",
            self.id, self.display_name, self.member_count, self.visibility
        )
    }
}

pub async fn list(config: &Config, kind: EntityKind) -> Result<()> {
    match kind {
        EntityKind::Resident => list_kind::<ResidentRecord>(config).await,
        EntityKind::Group => list_kind::<GroupRecord>(config).await,
    }
}

async fn list_kind<E: Entity + Summary>(config: &Config) -> Result<()> {
    let mut records = cache::<E>(config)?.list_all().await?;
    records.sort_by(|a, b| a.id().cmp(b.id()));
    for record in &records {
        println!("{}", record.summary());
    }
    println!("{} {}", records.len(), E::KIND);
    Ok(())
}

pub async fn set(config: &Config, kind: EntityKind, id: &str, fields: &[(String, String)]) -> Result<()> {
    match kind {
        EntityKind::Resident => set_kind::<ResidentRecord>(config, id, fields).await,
        EntityKind::Group => set_kind::<GroupRecord>(config, id, fields).await,
    }
}

async fn set_kind<E>(config: &Config, id: &str, fields: &[(String, String)]) -> Result<()>
where
    E: Entity,
    E::Patch: FieldPatch,
{
    let patch = <E::Patch as FieldPatch>::from_pairs(fields.iter().map(|(k, v)| (k, v)))?;
    let record = cache::<E>(config)?
        .patch(id, &patch)
        .await
        .with_context(|| format!("Failed to update {} {}", E::KIND, id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn note(config: &Config, kind: EntityKind, id: &str, text: Option<String>) -> Result<()> {
    match kind {
        EntityKind::Resident => note_kind::<ResidentRecord>(config, id, text).await,
        EntityKind::Group => note_kind::<GroupRecord>(config, id, text).await,
    }
}

async fn note_kind<E: Entity>(config: &Config, id: &str, text: Option<String>) -> Result<()> {
    let cache = cache::<E>(config)?;
    match text {
        Some(text) => {
            cache.write_note(id, &text).await?;
            println!("note for {} updated", id);
        }
        None => match cache.read_note(id).await? {
            Some(note) => println!("{}", note),
            None => anyhow::bail!("No profile note for {} {}", E::KIND, id),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bihua_core::RoomOutcome;
    use std::collections::BTreeMap;

    fn config() -> Config {
        Config::parse(
            "[messenger]\nhome_server = \"https://hs.example.org\"\nadmin_access_token = \"t\"\n\n[fleet]\nroom_alias = \"lobby\"\n",
        )
        .unwrap()
    }

    #[test]
    fn test_run_options_fall_back_to_config() {
        let request = RunOptions::default().request(&config()).unwrap();
        assert_eq!(request.room_alias, "lobby");
        assert_eq!(request.room_topic, "Where the bihua agents live");
        assert_eq!(request.handler_dir, PathBuf::from("./agents"));

        let request = RunOptions {
            room_alias: Some("#ops:example.org".to_string()),
            handler_dir: Some(PathBuf::from("/srv/agents")),
            ..RunOptions::default()
        }
        .request(&config())
        .unwrap();
        assert_eq!(request.room_alias, "#ops:example.org");
        assert_eq!(request.handler_dir, PathBuf::from("/srv/agents"));
    }

    #[test]
    fn test_run_requires_room_alias() {
        let mut config = config();
        config.fleet.room_alias = None;
        assert!(RunOptions::default().request(&config).is_err());
    }

    #[test]
    fn test_format_report() {
        let mut agents = BTreeMap::new();
        agents.insert("@a:example.org".to_string(), AgentOutcome::Stopped);
        agents.insert(
            "@b:example.org".to_string(),
            AgentOutcome::Failed {
                stage: "session".to_string(),
                reason: "login: rejected".to_string(),
            },
        );
        let report = FleetReport {
            room: RoomOutcome::Existing("!r:example.org".to_string()),
            agents,
        };

        let text = format_report(&report);
        assert!(text.starts_with("room !r:example.org\n"));
        assert!(text.contains("failed at session: login: rejected"));
        assert!(text.ends_with("1 stopped, 1 failed, 0 skipped"));
    }
}
