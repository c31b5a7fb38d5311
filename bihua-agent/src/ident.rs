// ABOUTME: Resident identity helpers: `@local:server` parsing and username rules.
// ABOUTME: Also owns the handler symbol naming convention derived from the local part.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::registry::HANDLER_SYMBOL_PREFIX;

/// A resident identity of the form `@local:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResidentId {
    local: String,
    server: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid resident id '{0}': expected @local:server")]
pub struct InvalidResidentId(pub String);

impl ResidentId {
    pub fn new(local: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            server: server.into(),
        }
    }

    /// Parse `@local:server`. Both parts must be non-empty.
    pub fn parse(input: &str) -> Option<Self> {
        let rest = input.strip_prefix('@')?;
        let (local, server) = rest.split_once(':')?;
        if local.is_empty() || server.is_empty() {
            return None;
        }
        Some(Self::new(local, server))
    }

    /// The part before the colon, without the sigil. Used as the agent's short name.
    pub fn local_part(&self) -> &str {
        &self.local
    }

    pub fn server(&self) -> &str {
        &self.server
    }
}

impl fmt::Display for ResidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}:{}", self.local, self.server)
    }
}

impl FromStr for ResidentId {
    type Err = InvalidResidentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidResidentId(s.to_string()))
    }
}

/// Usernames start with an ASCII letter and continue with letters, digits or `_`.
pub fn is_valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Name under which an agent's callback is registered: `on_message_received_<short>`.
pub fn handler_symbol(short_name: &str) -> String {
    format!("{}{}", HANDLER_SYMBOL_PREFIX, short_name)
}
