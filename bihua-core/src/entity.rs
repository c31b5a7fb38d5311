// ABOUTME: Locally persisted entity records (residents and groups) and their remote snapshots.
// ABOUTME: Defines how a snapshot materializes into a record and how typed patches apply.

use crate::error::FleetError;
use crate::utils::mxc_to_http;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The two entity kinds mirrored from the remote directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Resident,
    Group,
}

impl EntityKind {
    /// Directory and index name under the data home
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Resident => "residents",
            Self::Group => "groups",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resident => "resident",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resident" | "residents" => Ok(Self::Resident),
            "group" | "groups" => Ok(Self::Group),
            other => Err(FleetError::InvalidValue {
                field: "kind".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResidentKind {
    Agent,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

macro_rules! parse_lowercase_enum {
    ($ty:ty, $field:literal, { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = FleetError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($variant),)+
                    _ => Err(FleetError::InvalidValue {
                        field: $field.to_string(),
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

parse_lowercase_enum!(ResidentKind, "kind", { "agent" => ResidentKind::Agent, "human" => ResidentKind::Human });
parse_lowercase_enum!(Role, "role", { "admin" => Role::Admin, "user" => Role::User });
parse_lowercase_enum!(LifecycleState, "lifecycleState", {
    "active" => LifecycleState::Active,
    "inactive" => LifecycleState::Inactive,
});
parse_lowercase_enum!(Visibility, "visibility", {
    "public" => Visibility::Public,
    "private" => Visibility::Private,
});

/// Paths and server details a snapshot needs to become a record
#[derive(Debug, Clone)]
pub struct MaterializeContext {
    pub home_server: String,
    pub record_path: PathBuf,
    pub profile_note_path: PathBuf,
}

/// A locally persisted entity mirrored from the remote directory.
///
/// Remote-derived fields are overwritten on every merge; everything else is
/// owned locally and survives sync.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Snapshot: DeserializeOwned + Send + Sync + 'static;
    type Patch: Send + Sync;

    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn snapshot_id(snapshot: &Self::Snapshot) -> &str;

    /// Build a fresh record, with placeholders for locally owned fields
    fn from_snapshot(id: &str, snapshot: &Self::Snapshot, ctx: &MaterializeContext) -> Self;

    /// Overwrite remote-derived fields only
    fn merge_snapshot(&mut self, snapshot: &Self::Snapshot, ctx: &MaterializeContext);

    fn apply_patch(&mut self, patch: &Self::Patch);

    /// Record the time of a completed directory sync, where the kind tracks it
    fn mark_synced(&mut self, _at_epoch_ms: i64) {}
}

/// Builds a typed patch from operator-supplied `key=value` pairs
pub trait FieldPatch: Default {
    fn set(&mut self, key: &str, value: &str) -> Result<(), FleetError>;

    fn from_pairs<I, K, V>(pairs: I) -> Result<Self, FleetError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut patch = Self::default();
        for (key, value) in pairs {
            patch.set(key.as_ref(), value.as_ref())?;
        }
        Ok(patch)
    }
}

/// `displayName`, `display_name` and `displayname` all name the same field
fn normalize_key(key: &str) -> String {
    key.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_value<T: FromStr>(field: &str, value: &str) -> Result<T, FleetError> {
    value.trim().parse().map_err(|_| FleetError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Synapse reports flags as booleans, or as 0/1 on older servers
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => b,
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

fn avatar_from_remote(home_server: &str, avatar: Option<&str>) -> String {
    match avatar {
        Some(uri) if !uri.is_empty() => mxc_to_http(home_server, uri),
        _ => String::new(),
    }
}

// ─── Residents ──────────────────────────────────────────────────

/// One user account as reported by the admin API
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResidentSnapshot {
    pub name: String,
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub admin: bool,
    #[serde(default, deserialize_with = "flag")]
    pub deactivated: bool,
    #[serde(default)]
    pub last_seen_ts: Option<i64>,
    #[serde(default)]
    pub user_type: Option<String>,
}

/// User type the orchestrator registers agents with
pub const AGENT_USER_TYPE: &str = "bot";

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidentRecord {
    pub id: String,
    pub display_name: String,
    pub avatar_url: String,
    /// Names a secret in the startup configuration, never the secret itself
    pub credential_ref: String,
    pub kind: ResidentKind,
    pub role: Role,
    pub lifecycle_state: LifecycleState,
    pub last_login_epoch_ms: i64,
    pub last_sync_epoch_ms: i64,
    pub profile_note_path: PathBuf,
    pub record_path: PathBuf,
}

impl fmt::Debug for ResidentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidentRecord")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("avatar_url", &self.avatar_url)
            .field("credential_ref", &"[REDACTED]")
            .field("kind", &self.kind)
            .field("role", &self.role)
            .field("lifecycle_state", &self.lifecycle_state)
            .field("last_login_epoch_ms", &self.last_login_epoch_ms)
            .field("last_sync_epoch_ms", &self.last_sync_epoch_ms)
            .field("profile_note_path", &self.profile_note_path)
            .field("record_path", &self.record_path)
            .finish()
    }
}

impl ResidentRecord {
    pub fn is_active(&self) -> bool {
        self.lifecycle_state == LifecycleState::Active
    }
}

impl Entity for ResidentRecord {
    type Snapshot = ResidentSnapshot;
    type Patch = ResidentPatch;

    const KIND: EntityKind = EntityKind::Resident;

    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot_id(snapshot: &ResidentSnapshot) -> &str {
        &snapshot.name
    }

    fn from_snapshot(id: &str, snapshot: &ResidentSnapshot, ctx: &MaterializeContext) -> Self {
        let kind = match snapshot.user_type.as_deref() {
            Some(AGENT_USER_TYPE) => ResidentKind::Agent,
            _ => ResidentKind::Human,
        };
        let mut record = Self {
            id: id.to_string(),
            display_name: String::new(),
            avatar_url: String::new(),
            credential_ref: crate::config::DEFAULT_CREDENTIAL_REF.to_string(),
            kind,
            role: Role::User,
            lifecycle_state: LifecycleState::Active,
            last_login_epoch_ms: 0,
            last_sync_epoch_ms: 0,
            profile_note_path: ctx.profile_note_path.clone(),
            record_path: ctx.record_path.clone(),
        };
        record.merge_snapshot(snapshot, ctx);
        record
    }

    fn merge_snapshot(&mut self, snapshot: &ResidentSnapshot, ctx: &MaterializeContext) {
        self.display_name = match snapshot.displayname.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => bihua_agent::ResidentId::parse(&self.id)
                .map(|id| id.local_part().to_string())
                .unwrap_or_else(|| self.id.clone()),
        };
        self.avatar_url = avatar_from_remote(&ctx.home_server, snapshot.avatar_url.as_deref());
        self.role = if snapshot.admin { Role::Admin } else { Role::User };
        self.lifecycle_state = if snapshot.deactivated {
            LifecycleState::Inactive
        } else {
            LifecycleState::Active
        };
        if let Some(seen) = snapshot.last_seen_ts {
            self.last_login_epoch_ms = self.last_login_epoch_ms.max(seen);
        }
        self.profile_note_path = ctx.profile_note_path.clone();
        self.record_path = ctx.record_path.clone();
    }

    fn apply_patch(&mut self, patch: &ResidentPatch) {
        if let Some(v) = &patch.display_name {
            self.display_name = v.clone();
        }
        if let Some(v) = &patch.avatar_url {
            self.avatar_url = v.clone();
        }
        if let Some(v) = &patch.credential_ref {
            self.credential_ref = v.clone();
        }
        if let Some(v) = patch.kind {
            self.kind = v;
        }
        if let Some(v) = patch.role {
            self.role = v;
        }
        if let Some(v) = patch.lifecycle_state {
            self.lifecycle_state = v;
        }
        if let Some(v) = patch.last_login_epoch_ms {
            // last login only moves forward
            self.last_login_epoch_ms = self.last_login_epoch_ms.max(v);
        }
        if let Some(v) = patch.last_sync_epoch_ms {
            self.last_sync_epoch_ms = v;
        }
    }

    fn mark_synced(&mut self, at_epoch_ms: i64) {
        self.last_sync_epoch_ms = at_epoch_ms;
    }
}

/// Partial update of a resident; `None` leaves the field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResidentPatch {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub credential_ref: Option<String>,
    pub kind: Option<ResidentKind>,
    pub role: Option<Role>,
    pub lifecycle_state: Option<LifecycleState>,
    pub last_login_epoch_ms: Option<i64>,
    pub last_sync_epoch_ms: Option<i64>,
}

impl ResidentPatch {
    pub fn last_login(at_epoch_ms: i64) -> Self {
        Self {
            last_login_epoch_ms: Some(at_epoch_ms),
            ..Self::default()
        }
    }
}

impl FieldPatch for ResidentPatch {
    fn set(&mut self, key: &str, value: &str) -> Result<(), FleetError> {
        match normalize_key(key).as_str() {
            "displayname" => self.display_name = Some(value.to_string()),
            "avatarurl" => self.avatar_url = Some(value.to_string()),
            "credentialref" => self.credential_ref = Some(value.to_string()),
            "kind" => self.kind = Some(value.parse()?),
            "role" => self.role = Some(value.parse()?),
            "lifecyclestate" | "state" => self.lifecycle_state = Some(value.parse()?),
            "lastloginepochms" | "lastlogin" => {
                self.last_login_epoch_ms = Some(parse_value("lastLoginEpochMs", value)?)
            }
            "lastsyncepochms" | "lastsync" => {
                self.last_sync_epoch_ms = Some(parse_value("lastSyncEpochMs", value)?)
            }
            _ => {
                return Err(FleetError::UnknownField {
                    kind: EntityKind::Resident.to_string(),
                    field: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

// ─── Groups ─────────────────────────────────────────────────────

/// One room as reported by the admin API
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupSnapshot {
    pub room_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub canonical_alias: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub joined_members: u64,
    #[serde(default, deserialize_with = "flag")]
    pub public: bool,
    #[serde(default)]
    pub encryption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub id: String,
    pub alias: String,
    pub display_name: String,
    pub avatar_url: String,
    pub member_count: u64,
    pub visibility: Visibility,
    /// `None` for unencrypted rooms
    pub encryption_algorithm: Option<String>,
    pub profile_note_path: PathBuf,
    pub record_path: PathBuf,
}

impl Entity for GroupRecord {
    type Snapshot = GroupSnapshot;
    type Patch = GroupPatch;

    const KIND: EntityKind = EntityKind::Group;

    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot_id(snapshot: &GroupSnapshot) -> &str {
        &snapshot.room_id
    }

    fn from_snapshot(id: &str, snapshot: &GroupSnapshot, ctx: &MaterializeContext) -> Self {
        let mut record = Self {
            id: id.to_string(),
            alias: String::new(),
            display_name: String::new(),
            avatar_url: String::new(),
            member_count: 0,
            visibility: Visibility::Private,
            encryption_algorithm: None,
            profile_note_path: ctx.profile_note_path.clone(),
            record_path: ctx.record_path.clone(),
        };
        record.merge_snapshot(snapshot, ctx);
        record
    }

    fn merge_snapshot(&mut self, snapshot: &GroupSnapshot, ctx: &MaterializeContext) {
        self.alias = snapshot.canonical_alias.clone().unwrap_or_default();
        self.display_name = snapshot
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| snapshot.canonical_alias.clone())
            .unwrap_or_else(|| self.id.clone());
        self.avatar_url = avatar_from_remote(&ctx.home_server, snapshot.avatar.as_deref());
        self.member_count = snapshot.joined_members;
        self.visibility = if snapshot.public {
            Visibility::Public
        } else {
            Visibility::Private
        };
        self.encryption_algorithm = snapshot.encryption.clone();
        self.profile_note_path = ctx.profile_note_path.clone();
        self.record_path = ctx.record_path.clone();
    }

    fn apply_patch(&mut self, patch: &GroupPatch) {
        if let Some(v) = &patch.alias {
            self.alias = v.clone();
        }
        if let Some(v) = &patch.display_name {
            self.display_name = v.clone();
        }
        if let Some(v) = &patch.avatar_url {
            self.avatar_url = v.clone();
        }
        if let Some(v) = patch.visibility {
            self.visibility = v;
        }
        if let Some(v) = &patch.encryption_algorithm {
            self.encryption_algorithm = v.clone();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupPatch {
    pub alias: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub visibility: Option<Visibility>,
    /// `Some(None)` clears the algorithm
    pub encryption_algorithm: Option<Option<String>>,
}

impl FieldPatch for GroupPatch {
    fn set(&mut self, key: &str, value: &str) -> Result<(), FleetError> {
        match normalize_key(key).as_str() {
            "alias" => self.alias = Some(value.to_string()),
            "displayname" | "name" => self.display_name = Some(value.to_string()),
            "avatarurl" => self.avatar_url = Some(value.to_string()),
            "visibility" => self.visibility = Some(value.parse()?),
            "encryptionalgorithm" | "encryption" => {
                let value = value.trim();
                self.encryption_algorithm = Some(match value {
                    "" | "none" | "null" => None,
                    algorithm => Some(algorithm.to_string()),
                });
            }
            _ => {
                return Err(FleetError::UnknownField {
                    kind: EntityKind::Group.to_string(),
                    field: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MaterializeContext {
        MaterializeContext {
            home_server: "https://hs.example.org".to_string(),
            record_path: PathBuf::from("/d/r.json"),
            profile_note_path: PathBuf::from("/d/r.txt"),
        }
    }

    fn snapshot(json: serde_json::Value) -> ResidentSnapshot {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_resident_from_snapshot_maps_fields() {
        let snap = snapshot(serde_json::json!({
            "name": "@alpha:example.org",
            "displayname": "Alpha",
            "avatar_url": "mxc://example.org/face",
            "admin": 1,
            "deactivated": false,
            "last_seen_ts": 1700,
            "user_type": "bot"
        }));
        let record = ResidentRecord::from_snapshot("@alpha:example.org", &snap, &ctx());
        assert_eq!(record.display_name, "Alpha");
        assert_eq!(
            record.avatar_url,
            "https://hs.example.org/_matrix/media/v3/download/example.org/face"
        );
        assert_eq!(record.role, Role::Admin);
        assert_eq!(record.kind, ResidentKind::Agent);
        assert_eq!(record.lifecycle_state, LifecycleState::Active);
        assert_eq!(record.last_login_epoch_ms, 1700);
        assert_eq!(record.credential_ref, "default");
    }

    #[test]
    fn test_resident_null_fields_fall_back() {
        let snap = snapshot(serde_json::json!({
            "name": "@beta:example.org",
            "displayname": null,
            "avatar_url": null,
            "deactivated": true
        }));
        let record = ResidentRecord::from_snapshot("@beta:example.org", &snap, &ctx());
        assert_eq!(record.display_name, "beta");
        assert_eq!(record.avatar_url, "");
        assert_eq!(record.kind, ResidentKind::Human);
        assert_eq!(record.lifecycle_state, LifecycleState::Inactive);
    }

    #[test]
    fn test_merge_keeps_last_login_monotonic() {
        let snap = snapshot(serde_json::json!({"name": "@a:x", "last_seen_ts": 10}));
        let mut record = ResidentRecord::from_snapshot("@a:x", &snap, &ctx());
        record.apply_patch(&ResidentPatch::last_login(50));
        record.merge_snapshot(&snap, &ctx());
        assert_eq!(record.last_login_epoch_ms, 50);
    }

    #[test]
    fn test_resident_patch_from_pairs() {
        let patch = ResidentPatch::from_pairs([
            ("display_name", "Alpha Prime"),
            ("role", "admin"),
            ("lastSync", "42"),
        ])
        .unwrap();
        assert_eq!(patch.display_name.as_deref(), Some("Alpha Prime"));
        assert_eq!(patch.role, Some(Role::Admin));
        assert_eq!(patch.last_sync_epoch_ms, Some(42));
    }

    #[test]
    fn test_patch_rejects_unknown_and_bad_values() {
        assert!(matches!(
            ResidentPatch::from_pairs([("id", "@other:x")]),
            Err(FleetError::UnknownField { .. })
        ));
        assert!(matches!(
            ResidentPatch::from_pairs([("role", "overlord")]),
            Err(FleetError::InvalidValue { .. })
        ));
        assert!(matches!(
            GroupPatch::from_pairs([("memberCount", "3")]),
            Err(FleetError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_group_from_snapshot() {
        let snap: GroupSnapshot = serde_json::from_value(serde_json::json!({
            "room_id": "!abc:example.org",
            "name": null,
            "canonical_alias": "#lobby:example.org",
            "joined_members": 3,
            "public": true,
            "encryption": null
        }))
        .unwrap();
        let record = GroupRecord::from_snapshot("!abc:example.org", &snap, &ctx());
        assert_eq!(record.display_name, "#lobby:example.org");
        assert_eq!(record.alias, "#lobby:example.org");
        assert_eq!(record.member_count, 3);
        assert_eq!(record.visibility, Visibility::Public);
        assert_eq!(record.encryption_algorithm, None);
        assert_eq!(record.avatar_url, "");

        let json = serde_json::to_value(&record).unwrap();
        assert!(json["encryptionAlgorithm"].is_null());
    }

    #[test]
    fn test_group_patch_clears_encryption() {
        let patch = GroupPatch::from_pairs([("encryption", "none")]).unwrap();
        assert_eq!(patch.encryption_algorithm, Some(None));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("residents".parse::<EntityKind>().unwrap(), EntityKind::Resident);
        assert_eq!("Group".parse::<EntityKind>().unwrap(), EntityKind::Group);
        assert!("rooms".parse::<EntityKind>().is_err());
    }
}
