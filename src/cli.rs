// ABOUTME: Command-line interface for the bihua binary.
// ABOUTME: Runs the agent fleet and offers operator commands over the local entity cache.

use bihua_core::EntityKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run and manage a fleet of chat agents on a Matrix home server
#[derive(Debug, Parser)]
#[command(name = "bihua", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bring up every agent found in the handler directory and keep it listening
    Run {
        /// Shared room alias, `lobby` or `#lobby:server` (defaults to fleet.room_alias)
        #[arg(long)]
        room_alias: Option<String>,
        /// Topic used when the room has to be created
        #[arg(long)]
        room_topic: Option<String>,
        /// Directory holding one `<agent>.toml` per agent
        #[arg(long)]
        handler_dir: Option<PathBuf>,
    },
    /// Mirror every remote entity of a kind into the local cache
    Sync {
        /// `residents` or `groups`
        kind: EntityKind,
    },
    /// Print every locally cached entity of a kind
    List { kind: EntityKind },
    /// Update fields of one entity, e.g. `set residents @a:example.org role=admin`
    Set {
        kind: EntityKind,
        id: String,
        #[arg(required = true, value_parser = parse_assignment)]
        fields: Vec<(String, String)>,
    },
    /// Show or replace the free-text profile note of an entity
    Note {
        kind: EntityKind,
        id: String,
        /// New note text
        #[arg(long)]
        set: Option<String>,
    },
}

/// `key=value`, split on the first `=`
fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.trim().is_empty() {
        return Err(format!("missing field name in '{}'", raw));
    }
    Ok((key.trim().to_string(), value.to_string()))
}
