// ABOUTME: XDG base directory paths and the on-disk layout of the entity store.
// ABOUTME: Record, note and index locations are derived from the data home and the entity id.

use crate::entity::EntityKind;
use crate::error::FleetError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const QUALIFIER: &str = "org";
const ORGANIZATION: &str = "bihua";
const APPLICATION: &str = "bihua";

/// Subfolder of each entity directory that holds its record and note
const PROFILE_DIR: &str = "profile";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// e.g. ~/.local/share/bihua/, falling back to ./data
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

pub fn log_dir(data_home: &Path) -> PathBuf {
    data_home.join("logs")
}

/// Matrix client state for one agent session
pub fn session_store_dir(data_home: &Path, local_part: &str) -> PathBuf {
    data_home.join("sessions").join(local_part)
}

pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// e.g. ~/.config/bihua/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Ids become path components, so separators and parent references are refused
pub fn check_entity_id(id: &str) -> Result<(), FleetError> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.contains('\0')
    {
        return Err(FleetError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Where records of one kind live under a data home
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    kind: EntityKind,
}

impl StoreLayout {
    pub fn new(data_home: impl Into<PathBuf>, kind: EntityKind) -> Self {
        Self {
            root: data_home.into(),
            kind,
        }
    }

    /// `<data_home>/<kind>/<id>/profile/`
    pub fn profile_dir(&self, id: &str) -> Result<PathBuf, FleetError> {
        check_entity_id(id)?;
        Ok(self
            .root
            .join(self.kind.dir_name())
            .join(id)
            .join(PROFILE_DIR))
    }

    pub fn record_path(&self, id: &str) -> Result<PathBuf, FleetError> {
        Ok(self.profile_dir(id)?.join(format!("{}.json", id)))
    }

    pub fn note_path(&self, id: &str) -> Result<PathBuf, FleetError> {
        Ok(self.profile_dir(id)?.join(format!("{}.txt", id)))
    }

    /// `<data_home>/<kind>.json`
    pub fn index_path(&self) -> PathBuf {
        self.root.join(format!("{}.json", self.kind.dir_name()))
    }
}
