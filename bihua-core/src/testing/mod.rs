// ABOUTME: In-memory doubles for the remote directory, room service and chat connections.
// ABOUTME: Lets the cache, sessions and orchestrator run deterministically without a server.

pub mod connection;
pub mod directory;

pub use connection::{ConnectionProbe, MockConnector};
pub use directory::MemoryDirectory;
