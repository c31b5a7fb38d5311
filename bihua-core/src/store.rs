// ABOUTME: EntityStateCache keeps one JSON record per entity plus a per-kind index on disk.
// ABOUTME: Writes to an entity are serialized per id; index rewrites are serialized per kind.

use crate::config::Config;
use crate::entity::{Entity, MaterializeContext};
use crate::error::{FleetError, LoadOutcome, Lookup};
use crate::paths::StoreLayout;
use crate::traits::RemoteDirectory;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Local cache of one entity kind, mirrored from the remote directory.
///
/// Every record lives at `<data_home>/<kind>/<id>/profile/<id>.json` next to a
/// free-text profile note, and the kind's index at `<data_home>/<kind>.json`
/// lists every record exactly once. Share one instance per kind (behind an
/// `Arc`) so that its locks cover every writer.
pub struct EntityStateCache<E: Entity> {
    layout: StoreLayout,
    home_server: String,
    note_placeholder: String,
    directory: Arc<dyn RemoteDirectory>,
    entity_locks: LockMap,
    index_lock: AsyncMutex<()>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EntityStateCache<E> {
    pub fn new(
        data_home: impl Into<PathBuf>,
        home_server: impl Into<String>,
        note_placeholder: impl Into<String>,
        directory: Arc<dyn RemoteDirectory>,
    ) -> Self {
        Self {
            layout: StoreLayout::new(data_home, E::KIND),
            home_server: home_server.into(),
            note_placeholder: note_placeholder.into(),
            directory,
            entity_locks: Mutex::new(HashMap::new()),
            index_lock: AsyncMutex::new(()),
            _entity: PhantomData,
        }
    }

    pub fn from_config(config: &Config, directory: Arc<dyn RemoteDirectory>) -> Self {
        Self::new(
            config.data_home(),
            config.messenger.home_server.clone(),
            config.store.note_placeholder.clone(),
            directory,
        )
    }

    pub fn record_path(&self, id: &str) -> Result<PathBuf, FleetError> {
        self.layout.record_path(id)
    }

    pub fn note_path(&self, id: &str) -> Result<PathBuf, FleetError> {
        self.layout.note_path(id)
    }

    pub fn index_path(&self) -> PathBuf {
        self.layout.index_path()
    }

    /// Exclusive write access to one id until the guard drops
    async fn lock_entity(&self, id: &str) -> EntityGuard<'_> {
        let lock = {
            let mut locks = self
                .entity_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        EntityGuard {
            locks: &self.entity_locks,
            id: id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Ids with a live per-entity lock
    pub fn locked_ids(&self) -> usize {
        self.entity_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn context(&self, id: &str) -> Result<MaterializeContext, FleetError> {
        Ok(MaterializeContext {
            home_server: self.home_server.clone(),
            record_path: self.layout.record_path(id)?,
            profile_note_path: self.layout.note_path(id)?,
        })
    }

    /// Read the persisted record. A blank, `{}` or `null` file is `Empty`.
    pub async fn load(&self, id: &str) -> Result<LoadOutcome<E>, FleetError> {
        let path = self.layout.record_path(id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadOutcome::Missing),
            Err(e) => return Err(FleetError::io(&path, e)),
        };

        let trimmed = content.trim();
        if trimmed.is_empty() || trimmed == "{}" || trimmed == "null" {
            tracing::debug!(entity = %id, path = %path.display(), "Record file holds no data");
            return Ok(LoadOutcome::Empty);
        }

        serde_json::from_str::<E>(trimmed)
            .map(LoadOutcome::Found)
            .map_err(|e| FleetError::decode(path.display().to_string(), e))
    }

    /// Merge a remote snapshot into the local record, creating it when absent.
    ///
    /// Only remote-derived fields change; repeating the call with the same
    /// snapshot leaves the record file byte-identical.
    pub async fn create_or_update_from_remote(
        &self,
        id: &str,
        snapshot: &E::Snapshot,
    ) -> Result<E, FleetError> {
        let _guard = self.lock_entity(id).await;
        self.materialize(id, snapshot, None).await
    }

    /// Merge a snapshot keyed by its own id and stamp the sync time in the same write
    pub async fn sync_from_remote(
        &self,
        snapshot: &E::Snapshot,
        synced_at_epoch_ms: i64,
    ) -> Result<E, FleetError> {
        let id = E::snapshot_id(snapshot).to_string();
        let _guard = self.lock_entity(&id).await;
        self.materialize(&id, snapshot, Some(synced_at_epoch_ms))
            .await
    }

    /// Apply a partial update. An entity unknown locally is first materialized
    /// from the remote directory; unknown on both sides is `NotFound`.
    pub async fn patch(&self, id: &str, patch: &E::Patch) -> Result<E, FleetError> {
        let _guard = self.lock_entity(id).await;

        let mut record = match self.load(id).await? {
            LoadOutcome::Found(record) => record,
            LoadOutcome::Missing | LoadOutcome::Empty => {
                tracing::debug!(kind = %E::KIND, entity = %id, "Patching unknown entity, fetching remote");
                match self.directory.fetch_one(E::KIND, id).await? {
                    Lookup::Found(value) => {
                        let snapshot: E::Snapshot = serde_json::from_value(value)
                            .map_err(|e| FleetError::decode(format!("{} {}", E::KIND, id), e))?;
                        self.materialize(id, &snapshot, None).await?
                    }
                    Lookup::NotFound => {
                        return Err(FleetError::NotFound {
                            kind: E::KIND.to_string(),
                            id: id.to_string(),
                        })
                    }
                }
            }
        };

        record.apply_patch(patch);
        self.persist(&record).await?;
        tracing::debug!(kind = %E::KIND, entity = %id, "Record patched");
        Ok(record)
    }

    /// Every record in the kind's index
    pub async fn list_all(&self) -> Result<Vec<E>, FleetError> {
        let _guard = self.index_lock.lock().await;
        self.read_index().await
    }

    /// The entity's profile note, `None` when it was never written
    pub async fn read_note(&self, id: &str) -> Result<Option<String>, FleetError> {
        let path = self.layout.note_path(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FleetError::io(&path, e)),
        }
    }

    /// Replace the profile note. Sync never does this.
    pub async fn write_note(&self, id: &str, text: &str) -> Result<(), FleetError> {
        let _guard = self.lock_entity(id).await;
        let path = self.layout.note_path(id)?;
        write_atomic(&path, text.as_bytes()).await?;
        tracing::info!(kind = %E::KIND, entity = %id, "Profile note updated");
        Ok(())
    }

    // Caller holds the entity lock.
    async fn materialize(
        &self,
        id: &str,
        snapshot: &E::Snapshot,
        synced_at_epoch_ms: Option<i64>,
    ) -> Result<E, FleetError> {
        let ctx = self.context(id)?;
        let mut record = match self.load(id).await? {
            LoadOutcome::Found(mut existing) => {
                existing.merge_snapshot(snapshot, &ctx);
                existing
            }
            LoadOutcome::Missing | LoadOutcome::Empty => {
                tracing::info!(kind = %E::KIND, entity = %id, "Creating local record");
                E::from_snapshot(id, snapshot, &ctx)
            }
        };
        if let Some(at) = synced_at_epoch_ms {
            record.mark_synced(at);
        }

        self.ensure_note(&ctx.profile_note_path).await?;
        self.persist(&record).await?;
        Ok(record)
    }

    async fn ensure_note(&self, path: &Path) -> Result<(), FleetError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FleetError::io(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;
        match file {
            Ok(mut file) => {
                file.write_all(self.note_placeholder.as_bytes())
                    .await
                    .map_err(|e| FleetError::io(path, e))?;
                file.flush().await.map_err(|e| FleetError::io(path, e))?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(FleetError::io(path, e)),
        }
    }

    async fn persist(&self, record: &E) -> Result<(), FleetError> {
        let path = self.layout.record_path(record.id())?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| FleetError::decode(format!("{} {}", E::KIND, record.id()), e))?;
        write_atomic(&path, &bytes).await?;
        self.upsert_index(record).await
    }

    async fn upsert_index(&self, record: &E) -> Result<(), FleetError> {
        let _guard = self.index_lock.lock().await;
        let entries = self.read_index().await?;

        let mut updated = Vec::with_capacity(entries.len() + 1);
        let mut placed = false;
        for entry in entries {
            if entry.id() != record.id() {
                updated.push(entry);
            } else if !placed {
                updated.push(record.clone());
                placed = true;
            }
        }
        if !placed {
            updated.push(record.clone());
        }

        let path = self.layout.index_path();
        let bytes = serde_json::to_vec_pretty(&updated)
            .map_err(|e| FleetError::decode(path.display().to_string(), e))?;
        write_atomic(&path, &bytes).await
    }

    // Caller holds the index lock.
    async fn read_index(&self) -> Result<Vec<E>, FleetError> {
        let path = self.layout.index_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FleetError::io(&path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| FleetError::decode(path.display().to_string(), e))
    }
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Holds one id's write lock and drops its map entry when no other task
/// holds or waits on it
struct EntityGuard<'a> {
    locks: &'a LockMap,
    id: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // clones are only handed out under the map lock: the map's and ours are the last two
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.id);
        }
    }
}

/// Write through a temp file in the same directory and rename over the target
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), FleetError> {
    let parent = path
        .parent()
        .ok_or_else(|| FleetError::io(path, std::io::ErrorKind::InvalidInput.into()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| FleetError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| FleetError::io(&tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(FleetError::io(path, e));
    }
    Ok(())
}
