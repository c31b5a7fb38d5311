// ABOUTME: Platform-agnostic core of the bihua agent fleet.
// ABOUTME: Entity state cache, directory client, agent sessions and the fleet orchestrator.

pub mod config;
pub mod directory;
pub mod entity;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod session;
pub mod store;
pub mod sync;
pub mod traits;
pub mod utils;

pub mod testing;

pub use config::Config;
pub use directory::{fetch_all, fetch_all_snapshots, DirectoryItem, RemoteDirectoryClient};
pub use entity::{
    Entity, EntityKind, FieldPatch, GroupPatch, GroupRecord, GroupSnapshot, LifecycleState,
    ResidentKind, ResidentPatch, ResidentRecord, ResidentSnapshot, Role, Visibility,
};
pub use error::{FleetError, LoadOutcome, Lookup};
pub use orchestrator::{AgentOutcome, FleetOrchestrator, FleetReport, FleetRequest, RoomOutcome};
pub use session::{AgentSession, SessionSettings, SessionState};
pub use store::EntityStateCache;
pub use sync::{resync, SyncReport};
pub use traits::{ChatConnection, RemoteDirectory, RoomCreation, RoomService, SessionConnector};
