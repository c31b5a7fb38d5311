// ABOUTME: Registration table mapping agent ids to their message handlers.
// ABOUTME: Handlers register factories by symbol; resolution reads the agent's source unit first.

use crate::ident::{handler_symbol, is_valid_username, ResidentId};
use crate::traits::MessageHandler;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Extension of per-agent handler source units in the handler directory
pub const HANDLER_SOURCE_EXT: &str = "toml";

/// Callback symbols are named `on_message_received_<short name>`
pub const HANDLER_SYMBOL_PREFIX: &str = "on_message_received_";

/// Factory that builds the handler for one agent from its resolution context
pub type HandlerFactory =
    Box<dyn Fn(&HandlerContext) -> anyhow::Result<Arc<dyn MessageHandler>> + Send + Sync>;

/// Contents of `<handler_dir>/<short>.toml`. An empty file is a valid manifest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HandlerManifest {
    /// Disabled agents are discovered but never launched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Display name used when the agent is registered with the remote service
    #[serde(default)]
    pub display_name: Option<String>,
    /// Free-form parameters passed through to the handler factory
    #[serde(default)]
    pub params: toml::Table,
}

fn default_enabled() -> bool {
    true
}

impl Default for HandlerManifest {
    fn default() -> Self {
        Self {
            enabled: true,
            display_name: None,
            params: toml::Table::new(),
        }
    }
}

/// Everything a factory gets to know about the agent it builds a handler for
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub agent_id: String,
    pub short_name: String,
    pub source_path: PathBuf,
    pub manifest: HandlerManifest,
}

/// A handler bound to an agent, together with the manifest it was built from
#[derive(Clone)]
pub struct ResolvedHandler {
    pub handler: Arc<dyn MessageHandler>,
    pub manifest: HandlerManifest,
}

impl std::fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

/// Why resolution came back empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingHandler {
    /// No source unit at the conventional path
    SourceUnit(PathBuf),
    /// Source unit exists but no callback is registered under the conventional symbol
    Symbol(String),
}

impl std::fmt::Display for MissingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceUnit(path) => write!(f, "no handler source at {}", path.display()),
            Self::Symbol(symbol) => write!(f, "no handler registered as {}", symbol),
        }
    }
}

/// Outcome of a successful lookup
#[derive(Debug, Clone)]
pub enum Resolution {
    Found(ResolvedHandler),
    NotFound(MissingHandler),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent id '{0}' is not of the form @local:server")]
    InvalidAgentId(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse handler source {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("handler factory {symbol} failed: {source}")]
    Factory {
        symbol: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Registration table for agent handlers.
///
/// Populated once at startup; resolved handlers are cached per agent id for the
/// lifetime of the registry and never reloaded.
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
    resolved: Mutex<HashMap<String, ResolvedHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler factory under an explicit symbol name
    pub fn register<F>(mut self, symbol: &str, factory: F) -> Self
    where
        F: Fn(&HandlerContext) -> anyhow::Result<Arc<dyn MessageHandler>> + Send + Sync + 'static,
    {
        self.factories.insert(symbol.to_string(), Box::new(factory));
        self
    }

    /// Register the factory for an agent short name under the conventional symbol
    pub fn register_agent<F>(self, short_name: &str, factory: F) -> Self
    where
        F: Fn(&HandlerContext) -> anyhow::Result<Arc<dyn MessageHandler>> + Send + Sync + 'static,
    {
        let symbol = handler_symbol(short_name);
        self.register(&symbol, factory)
    }

    /// Share one handler instance between every agent that resolves to `short_name`
    pub fn register_instance(self, short_name: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.register_agent(short_name, move |_ctx| Ok(Arc::clone(&handler)))
    }

    /// Registered symbol names, sorted
    pub fn symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn is_registered(&self, short_name: &str) -> bool {
        self.factories.contains_key(&handler_symbol(short_name))
    }

    /// Resolve the handler bound to `agent_id`.
    ///
    /// Reads `<source_dir>/<local part>.toml`, then looks up
    /// `on_message_received_<local part>`. Missing pieces are `NotFound`; an
    /// unreadable or malformed source unit is an error.
    pub async fn resolve(
        &self,
        agent_id: &str,
        source_dir: &Path,
    ) -> Result<Resolution, RegistryError> {
        if let Some(cached) = self.cached(agent_id) {
            return Ok(Resolution::Found(cached));
        }

        let id = ResidentId::parse(agent_id)
            .ok_or_else(|| RegistryError::InvalidAgentId(agent_id.to_string()))?;
        let short_name = id.local_part().to_string();
        let source_path = source_dir.join(format!("{}.{}", short_name, HANDLER_SOURCE_EXT));

        let text = match tokio::fs::read_to_string(&source_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    agent_id = %agent_id,
                    path = %source_path.display(),
                    "Handler source unit not found"
                );
                return Ok(Resolution::NotFound(MissingHandler::SourceUnit(source_path)));
            }
            Err(source) => {
                tracing::error!(
                    agent_id = %agent_id,
                    path = %source_path.display(),
                    error = %source,
                    "Failed to read handler source unit"
                );
                return Err(RegistryError::Io {
                    path: source_path,
                    source,
                });
            }
        };

        let manifest: HandlerManifest = toml::from_str(&text).map_err(|source| {
            tracing::error!(
                agent_id = %agent_id,
                path = %source_path.display(),
                error = %source,
                "Failed to parse handler source unit"
            );
            RegistryError::Parse {
                path: source_path.clone(),
                source,
            }
        })?;

        let symbol = handler_symbol(&short_name);
        let Some(factory) = self.factories.get(&symbol) else {
            tracing::warn!(agent_id = %agent_id, symbol = %symbol, "Handler symbol not registered");
            return Ok(Resolution::NotFound(MissingHandler::Symbol(symbol)));
        };

        let ctx = HandlerContext {
            agent_id: agent_id.to_string(),
            short_name,
            source_path,
            manifest: manifest.clone(),
        };
        let handler = factory(&ctx).map_err(|source| RegistryError::Factory {
            symbol: symbol.clone(),
            source,
        })?;

        let resolved = ResolvedHandler { handler, manifest };
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), resolved.clone());

        tracing::info!(agent_id = %agent_id, symbol = %symbol, "Handler resolved");
        Ok(Resolution::Found(resolved))
    }

    fn cached(&self, agent_id: &str) -> Option<ResolvedHandler> {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// List the agent short names that have a source unit in `source_dir`.
///
/// Order follows directory enumeration and is not stable across runs. Files whose
/// stem is not a valid username are skipped with a warning.
pub async fn discover_handler_sources(source_dir: &Path) -> Result<Vec<String>, RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: source_dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(source_dir).await.map_err(io_err)?;
    let mut names = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(HANDLER_SOURCE_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_valid_username(stem) {
            tracing::warn!(path = %path.display(), "Skipping handler source with invalid name");
            continue;
        }
        names.push(stem.to_string());
    }

    Ok(names)
}
