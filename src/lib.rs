// ABOUTME: Root library of the bihua binary: CLI, commands, Matrix platform and built-in agents.
// ABOUTME: Platform-agnostic pieces are re-exported from bihua-core and bihua-agent.

pub mod agents;
pub mod cli;
pub mod commands;
pub mod platform;

// Re-export platform-agnostic modules from bihua-core
pub use bihua_core::config;
pub use bihua_core::orchestrator;
pub use bihua_core::paths;
pub use bihua_core::store;

pub use bihua_agent::{HandlerRegistry, MessageHandler, Replier};
