// ABOUTME: Error taxonomy shared by the entity cache, directory client, sessions and orchestrator.
// ABOUTME: "Not found" is modelled as a value (Lookup / LoadOutcome), never as an error.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Entity absent both locally and remotely where presence was required
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    /// Non-success HTTP status from a remote service
    #[error("remote call failed with status {status}: {body}")]
    Remote { status: u16, body: String },

    /// Connection-level failure that never produced a status (DNS, TLS, timeout)
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted record or remote payload could not be decoded
    #[error("failed to decode {context}: {reason}")]
    Decode { context: String, reason: String },

    /// Login rejected or no usable credential for the agent
    #[error("authentication failed for {agent_id}: {reason}")]
    Auth { agent_id: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// Entity id unusable as a path component
    #[error("invalid entity id {0:?}")]
    InvalidId(String),

    /// Patch key that does not name a patchable field
    #[error("unknown field {field:?} for {kind}")]
    UnknownField { kind: String, field: String },

    /// Malformed patch value for a known field
    #[error("invalid value {value:?} for field {field}")]
    InvalidValue { field: String, value: String },

    #[error("{0} is not supported by this directory")]
    Unsupported(String),
}

impl FleetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn decode(context: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            context: context.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Remote {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None if err.is_decode() => Self::decode("remote response", err),
            None => Self::Transport(err.to_string()),
        }
    }
}

/// Result of a remote lookup where absence is a normal outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

/// Result of reading a persisted record from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome<T> {
    Found(T),
    /// No file at the record path
    Missing,
    /// File exists but holds no record (blank, `{}` or `null`)
    Empty,
}

impl<T> LoadOutcome<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::Missing | Self::Empty => None,
        }
    }
}
