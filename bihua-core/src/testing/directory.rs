// ABOUTME: MemoryDirectory implements RemoteDirectory and RoomService over in-memory maps.
// ABOUTME: Records every call and can be told to fail or garble pagination past a given offset.

use crate::entity::EntityKind;
use crate::error::{FleetError, Lookup};
use crate::traits::{RemoteDirectory, RoomCreation, RoomService};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct DirectoryState {
    residents: BTreeMap<String, Value>,
    groups: BTreeMap<String, Value>,
    aliases: HashMap<String, String>,
    members: HashMap<String, HashSet<String>>,
    fail_pages_from: Option<u64>,
    garble_pages_from: Option<u64>,
    fail_members: bool,
    page_requests: Vec<(EntityKind, u64, u64)>,
    puts: Vec<(EntityKind, String, Value)>,
    room_creations: Vec<RoomCreation>,
    next_room: u32,
}

/// Clones share state, so a test can keep one handle while the code under test owns another
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DirectoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Add a raw admin-API user object; its `name` is the id
    pub fn insert_resident(&self, snapshot: Value) -> &Self {
        let id = snapshot["name"].as_str().unwrap_or_default().to_string();
        self.with_state(|s| s.residents.insert(id, snapshot));
        self
    }

    /// Add a raw admin-API room object; its `room_id` is the id
    pub fn insert_group(&self, snapshot: Value) -> &Self {
        let id = snapshot["room_id"].as_str().unwrap_or_default().to_string();
        self.with_state(|s| s.groups.insert(id, snapshot));
        self
    }

    pub fn insert_alias(&self, alias: &str, room_id: &str) -> &Self {
        self.with_state(|s| s.aliases.insert(alias.to_string(), room_id.to_string()));
        self
    }

    pub fn add_member(&self, room_id: &str, resident_id: &str) -> &Self {
        self.with_state(|s| {
            s.members
                .entry(room_id.to_string())
                .or_default()
                .insert(resident_id.to_string())
        });
        self
    }

    /// Page requests starting at or beyond `from` answer with HTTP 500
    pub fn fail_pages_from(&self, from: u64) -> &Self {
        self.with_state(|s| s.fail_pages_from = Some(from));
        self
    }

    /// Page requests starting at or beyond `from` succeed but carry an
    /// undecodable body, like an HTML error page behind a proxy
    pub fn garble_pages_from(&self, from: u64) -> &Self {
        self.with_state(|s| s.garble_pages_from = Some(from));
        self
    }

    pub fn fail_member_listing(&self) -> &Self {
        self.with_state(|s| s.fail_members = true);
        self
    }

    pub fn resident(&self, id: &str) -> Option<Value> {
        self.with_state(|s| s.residents.get(id).cloned())
    }

    pub fn page_requests(&self) -> Vec<(EntityKind, u64, u64)> {
        self.with_state(|s| s.page_requests.clone())
    }

    pub fn puts(&self) -> Vec<(EntityKind, String, Value)> {
        self.with_state(|s| s.puts.clone())
    }

    pub fn room_creations(&self) -> Vec<RoomCreation> {
        self.with_state(|s| s.room_creations.clone())
    }
}

#[async_trait]
impl RemoteDirectory for MemoryDirectory {
    async fn fetch_page(
        &self,
        kind: EntityKind,
        from: u64,
        limit: u64,
    ) -> Result<Vec<Value>, FleetError> {
        self.with_state(|s| {
            s.page_requests.push((kind, from, limit));
            if s.fail_pages_from.is_some_and(|fail_from| from >= fail_from) {
                return Err(FleetError::Remote {
                    status: 500,
                    body: "directory unavailable".to_string(),
                });
            }
            if s.garble_pages_from.is_some_and(|garble_from| from >= garble_from) {
                return Err(FleetError::decode(
                    kind.as_str(),
                    "expected value at line 1 column 1",
                ));
            }
            let entries = match kind {
                EntityKind::Resident => &s.residents,
                EntityKind::Group => &s.groups,
            };
            Ok(entries
                .values()
                .skip(from as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        })
    }

    async fn fetch_one(&self, kind: EntityKind, id: &str) -> Result<Lookup<Value>, FleetError> {
        self.with_state(|s| {
            let entries = match kind {
                EntityKind::Resident => &s.residents,
                EntityKind::Group => &s.groups,
            };
            Ok(match entries.get(id) {
                Some(value) => Lookup::Found(value.clone()),
                None => Lookup::NotFound,
            })
        })
    }

    async fn put(&self, kind: EntityKind, id: &str, body: &Value) -> Result<(), FleetError> {
        if kind != EntityKind::Resident {
            return Err(FleetError::Unsupported(format!("registering a {}", kind)));
        }
        self.with_state(|s| {
            s.puts.push((kind, id.to_string(), body.clone()));
            let entry = s.residents.entry(id.to_string()).or_insert_with(|| {
                json!({
                    "name": id,
                    "displayname": null,
                    "avatar_url": null,
                    "admin": false,
                    "deactivated": false,
                    "last_seen_ts": null,
                    "user_type": null,
                })
            });
            for key in ["displayname", "admin", "deactivated", "user_type"] {
                if let Some(value) = body.get(key) {
                    entry[key] = value.clone();
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl RoomService for MemoryDirectory {
    async fn resolve_alias(&self, alias: &str) -> Result<Lookup<String>, FleetError> {
        self.with_state(|s| {
            Ok(match s.aliases.get(alias) {
                Some(room_id) => Lookup::Found(room_id.clone()),
                None => Lookup::NotFound,
            })
        })
    }

    async fn create_room(&self, request: &RoomCreation) -> Result<String, FleetError> {
        self.with_state(|s| {
            if s.aliases.contains_key(&request.alias) {
                return Err(FleetError::Remote {
                    status: 400,
                    body: "M_ROOM_IN_USE".to_string(),
                });
            }
            s.next_room += 1;
            let room_id = format!("!room{}:memory", s.next_room);
            s.room_creations.push(request.clone());
            s.aliases.insert(request.alias.clone(), room_id.clone());
            s.groups.insert(
                room_id.clone(),
                json!({
                    "room_id": room_id,
                    "name": request.name,
                    "canonical_alias": request.alias,
                    "joined_members": 0,
                    "public": true,
                    "encryption": null,
                }),
            );
            Ok(room_id)
        })
    }

    async fn joined_members(&self, room_id: &str) -> Result<HashSet<String>, FleetError> {
        self.with_state(|s| {
            if s.fail_members {
                return Err(FleetError::Transport("connection reset".to_string()));
            }
            Ok(s.members.get(room_id).cloned().unwrap_or_default())
        })
    }
}
