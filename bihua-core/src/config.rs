// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Loaded once at startup and handed to every component; nothing reads the env afterwards
use crate::error::FleetError;
use crate::paths;
use crate::utils::server_name_from_url;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Credential reference that resolves to `[fleet] agent_password`
pub const DEFAULT_CREDENTIAL_REF: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    pub home_server: String,
    /// Server part of resident ids; derived from `home_server` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Access token of an administrator account, used for the admin and room APIs
    #[serde(default)]
    pub admin_access_token: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for MessengerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerConfig")
            .field("home_server", &self.home_server)
            .field("server_name", &self.server_name)
            .field("admin_access_token", &"[REDACTED]")
            .field("device_name", &self.device_name)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_home")]
    pub data_home: String,
    /// Text written to a freshly created profile note
    #[serde(default = "default_note_placeholder")]
    pub note_placeholder: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_home: default_data_home(),
            note_placeholder: default_note_placeholder(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_alias: Option<String>,
    #[serde(default = "default_room_topic")]
    pub room_topic: String,
    #[serde(default = "default_handler_dir")]
    pub handler_dir: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Secret behind the `default` credential reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_password: Option<String>,
    /// Named secrets for residents whose credential reference is not `default`
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Register new agents as server administrators
    #[serde(default)]
    pub register_as_admin: bool,
}

impl std::fmt::Debug for FleetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut credential_names: Vec<&String> = self.credentials.keys().collect();
        credential_names.sort();
        f.debug_struct("FleetConfig")
            .field("room_alias", &self.room_alias)
            .field("room_topic", &self.room_topic)
            .field("handler_dir", &self.handler_dir)
            .field("page_size", &self.page_size)
            .field("sync_timeout_ms", &self.sync_timeout_ms)
            .field("shutdown_grace_secs", &self.shutdown_grace_secs)
            .field(
                "agent_password",
                &self.agent_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("credentials", &credential_names)
            .field("register_as_admin", &self.register_as_admin)
            .finish()
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            room_alias: None,
            room_topic: default_room_topic(),
            handler_dir: default_handler_dir(),
            page_size: default_page_size(),
            sync_timeout_ms: default_sync_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            agent_password: None,
            credentials: HashMap::new(),
            register_as_admin: false,
        }
    }
}

fn default_device_name() -> String {
    "bihua".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_data_home() -> String {
    paths::data_dir().to_string_lossy().to_string()
}

fn default_note_placeholder() -> String {
    "Please enter agent profile text here...".to_string()
}

fn default_room_topic() -> String {
    "Where the bihua agents live".to_string()
}

fn default_handler_dir() -> String {
    "./agents".to_string()
}

fn default_page_size() -> u64 {
    10
}

fn default_sync_timeout_ms() -> u64 {
    3000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(path = %path, "Could not determine home directory for tilde expansion");
    }
    path.to_string()
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. BIHUA_CONFIG_PATH env var (if set)
    /// 2. ./config.toml
    /// 3. ~/.config/bihua/config.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("BIHUA_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %env_path, "BIHUA_CONFIG_PATH does not exist");
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from the first config file found, then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let content = match Self::find_config_file() {
            Some(config_path) => {
                tracing::info!(path = %config_path.display(), "Loading configuration from file");
                std::fs::read_to_string(&config_path)
                    .with_context(|| format!("Failed to read {}", config_path.display()))?
            }
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                "[messenger]\nhome_server = \"\"\n".to_string()
            }
        };
        let mut config = Self::parse(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without env overrides or validation
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str::<Config>(content).context("Failed to parse configuration")
    }

    /// Apply overrides from a variable source (the process env in `load`)
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(val) = var("MESSENGER_HOME_SERVER") {
            self.messenger.home_server = val;
        }
        if let Some(val) = var("MESSENGER_SERVER_NAME") {
            self.messenger.server_name = Some(val);
        }
        if let Some(val) = var("MESSENGER_ADMIN_TOKEN") {
            self.messenger.admin_access_token = val;
        }
        if let Some(val) = var("BIHUA_AGENT_PASSWORD") {
            self.fleet.agent_password = Some(val);
        }
        if let Some(val) = var("BIHUA_DATA_HOME") {
            self.store.data_home = val;
        }
        if let Some(val) = var("BIHUA_HANDLER_DIR") {
            self.fleet.handler_dir = val;
        }
        if let Some(val) = var("BIHUA_ROOM_ALIAS") {
            self.fleet.room_alias = Some(val);
        }
        if let Some(val) = var("BIHUA_ROOM_TOPIC") {
            self.fleet.room_topic = val;
        }
        if let Some(val) = var("BIHUA_PAGE_SIZE") {
            self.fleet.page_size = val
                .parse()
                .with_context(|| format!("BIHUA_PAGE_SIZE must be a number, got: {}", val))?;
        }

        self.store.data_home = expand_tilde(&self.store.data_home);
        self.fleet.handler_dir = expand_tilde(&self.fleet.handler_dir);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.messenger.home_server.trim().is_empty() {
            anyhow::bail!(
                "messenger.home_server is required (set in config.toml or MESSENGER_HOME_SERVER env var)"
            );
        }
        if self.messenger.admin_access_token.trim().is_empty() {
            anyhow::bail!(
                "messenger.admin_access_token is required (set in config.toml or MESSENGER_ADMIN_TOKEN env var)"
            );
        }
        if self.server_name().is_none() {
            anyhow::bail!(
                "messenger.server_name could not be derived from '{}' (set MESSENGER_SERVER_NAME)",
                self.messenger.home_server
            );
        }
        if self.fleet.page_size == 0 {
            anyhow::bail!("fleet.page_size must be at least 1 (or set BIHUA_PAGE_SIZE)");
        }
        Ok(())
    }

    /// Server name used for resident ids and room aliases
    pub fn server_name(&self) -> Option<String> {
        self.messenger
            .server_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| server_name_from_url(&self.messenger.home_server))
    }

    pub fn data_home(&self) -> PathBuf {
        PathBuf::from(&self.store.data_home)
    }

    pub fn handler_dir(&self) -> PathBuf {
        PathBuf::from(&self.fleet.handler_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.messenger.request_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.fleet.sync_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.fleet.shutdown_grace_secs)
    }

    /// Resolve a resident's credential reference to the secret used at login
    pub fn resolve_credential(&self, agent_id: &str, reference: &str) -> Result<String, FleetError> {
        let reference = reference.trim();
        let secret = if reference.is_empty() || reference == DEFAULT_CREDENTIAL_REF {
            self.fleet.agent_password.as_ref()
        } else {
            self.fleet.credentials.get(reference)
        };
        secret.cloned().ok_or_else(|| FleetError::Auth {
            agent_id: agent_id.to_string(),
            reason: format!("no secret configured for credential reference '{}'", reference),
        })
    }
}
