// ABOUTME: Tests for EntityStateCache: materialization, idempotent merges, patches and the index.
// ABOUTME: Each test works in its own temp data home with an in-memory remote directory.

use bihua_core::testing::MemoryDirectory;
use bihua_core::{
    EntityStateCache, FleetError, GroupRecord, GroupSnapshot, LifecycleState, LoadOutcome,
    ResidentKind, ResidentPatch, ResidentRecord, ResidentSnapshot, Role,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const HOME: &str = "https://hs.example.org";
const PLACEHOLDER: &str = "Please enter agent profile text here...";

fn residents(dir: &Path, directory: &MemoryDirectory) -> EntityStateCache<ResidentRecord> {
    EntityStateCache::new(dir, HOME, PLACEHOLDER, Arc::new(directory.clone()))
}

fn snapshot(id: &str, display: Option<&str>) -> ResidentSnapshot {
    serde_json::from_value(json!({
        "name": id,
        "displayname": display,
        "avatar_url": "mxc://example.org/avatar1",
        "admin": false,
        "deactivated": false,
        "last_seen_ts": 1_700_000_000_000i64,
        "user_type": "bot"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_create_writes_record_note_and_index() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());

    let record = cache
        .create_or_update_from_remote("@alpha:example.org", &snapshot("@alpha:example.org", Some("Alpha")))
        .await
        .unwrap();

    assert_eq!(record.display_name, "Alpha");
    assert_eq!(
        record.avatar_url,
        "https://hs.example.org/_matrix/media/v3/download/example.org/avatar1"
    );
    assert_eq!(record.kind, ResidentKind::Agent);
    assert_eq!(record.credential_ref, "default");
    assert_eq!(record.last_sync_epoch_ms, 0);

    let record_path = tmp
        .path()
        .join("residents/@alpha:example.org/profile/@alpha:example.org.json");
    assert!(record_path.exists());
    assert_eq!(record.record_path, record_path);
    assert_eq!(
        cache.read_note("@alpha:example.org").await.unwrap().as_deref(),
        Some(PLACEHOLDER)
    );

    let listed = cache.list_all().await.unwrap();
    assert_eq!(listed, vec![record]);
    assert!(tmp.path().join("residents.json").exists());
}

#[tokio::test]
async fn test_repeated_merge_is_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let snap = snapshot("@alpha:example.org", Some("Alpha"));

    cache
        .create_or_update_from_remote("@alpha:example.org", &snap)
        .await
        .unwrap();
    let record_path = cache.record_path("@alpha:example.org").unwrap();
    let first_record = std::fs::read(&record_path).unwrap();
    let first_index = std::fs::read(cache.index_path()).unwrap();

    cache
        .create_or_update_from_remote("@alpha:example.org", &snap)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&record_path).unwrap(), first_record);
    assert_eq!(std::fs::read(cache.index_path()).unwrap(), first_index);
}

#[tokio::test]
async fn test_merge_preserves_locally_owned_fields() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let id = "@alpha:example.org";

    cache
        .create_or_update_from_remote(id, &snapshot(id, Some("Alpha")))
        .await
        .unwrap();
    cache
        .patch(
            id,
            &ResidentPatch {
                credential_ref: Some("ops".to_string()),
                kind: Some(ResidentKind::Human),
                last_sync_epoch_ms: Some(99),
                ..ResidentPatch::default()
            },
        )
        .await
        .unwrap();

    let mut renamed = snapshot(id, Some("Alpha Prime"));
    renamed.admin = true;
    let merged = cache.create_or_update_from_remote(id, &renamed).await.unwrap();

    assert_eq!(merged.display_name, "Alpha Prime");
    assert_eq!(merged.role, Role::Admin);
    assert_eq!(merged.credential_ref, "ops");
    assert_eq!(merged.kind, ResidentKind::Human);
    assert_eq!(merged.last_sync_epoch_ms, 99);
}

#[tokio::test]
async fn test_sync_never_overwrites_profile_note() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let id = "@alpha:example.org";

    cache
        .create_or_update_from_remote(id, &snapshot(id, None))
        .await
        .unwrap();
    cache.write_note(id, "Alpha answers echo requests.").await.unwrap();
    cache
        .create_or_update_from_remote(id, &snapshot(id, Some("Alpha")))
        .await
        .unwrap();

    assert_eq!(
        cache.read_note(id).await.unwrap().as_deref(),
        Some("Alpha answers echo requests.")
    );
}

#[tokio::test]
async fn test_empty_record_file_is_distinguishable_and_recreated() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let id = "@alpha:example.org";

    let path = cache.record_path(id).unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{}").unwrap();

    assert_eq!(cache.load(id).await.unwrap(), LoadOutcome::Empty);
    assert_eq!(
        cache.load("@nobody:example.org").await.unwrap(),
        LoadOutcome::Missing
    );

    let record = cache
        .create_or_update_from_remote(id, &snapshot(id, Some("Alpha")))
        .await
        .unwrap();
    assert_eq!(cache.load(id).await.unwrap(), LoadOutcome::Found(record));
}

#[tokio::test]
async fn test_null_avatar_becomes_empty_string() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let snap: ResidentSnapshot = serde_json::from_value(json!({
        "name": "@beta:example.org",
        "displayname": null,
        "avatar_url": null
    }))
    .unwrap();

    let record = cache
        .create_or_update_from_remote("@beta:example.org", &snap)
        .await
        .unwrap();
    assert_eq!(record.avatar_url, "");
    assert_eq!(record.display_name, "beta");

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&record.record_path).unwrap()).unwrap();
    assert_eq!(raw["avatarUrl"], json!(""));
}

#[tokio::test]
async fn test_patch_unknown_everywhere_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());

    let err = cache
        .patch("@ghost:example.org", &ResidentPatch::last_login(1))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound { .. }));
    assert!(cache.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_patch_materializes_from_remote_first() {
    let tmp = TempDir::new().unwrap();
    let directory = MemoryDirectory::new();
    directory.insert_resident(json!({
        "name": "@gamma:example.org",
        "displayname": "Gamma",
        "avatar_url": null,
        "deactivated": true
    }));
    let cache = residents(tmp.path(), &directory);

    let record = cache
        .patch(
            "@gamma:example.org",
            &ResidentPatch {
                role: Some(Role::Admin),
                ..ResidentPatch::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(record.display_name, "Gamma");
    assert_eq!(record.lifecycle_state, LifecycleState::Inactive);
    assert_eq!(record.role, Role::Admin);
    assert_eq!(cache.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_noop_patch_still_persists() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let id = "@alpha:example.org";
    cache
        .create_or_update_from_remote(id, &snapshot(id, Some("Alpha")))
        .await
        .unwrap();
    std::fs::remove_file(cache.index_path()).unwrap();

    cache.patch(id, &ResidentPatch::default()).await.unwrap();

    assert_eq!(cache.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_last_login_never_moves_backwards() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let id = "@alpha:example.org";
    cache
        .create_or_update_from_remote(id, &snapshot(id, Some("Alpha")))
        .await
        .unwrap();

    let later = 1_800_000_000_000i64;
    cache.patch(id, &ResidentPatch::last_login(later)).await.unwrap();
    let record = cache.patch(id, &ResidentPatch::last_login(5)).await.unwrap();
    assert_eq!(record.last_login_epoch_ms, later);

    // a stale last_seen_ts from the server does not roll it back either
    let record = cache
        .create_or_update_from_remote(id, &snapshot(id, Some("Alpha")))
        .await
        .unwrap();
    assert_eq!(record.last_login_epoch_ms, later);
}

#[tokio::test]
async fn test_concurrent_patches_on_one_entity_all_land() {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(residents(tmp.path(), &MemoryDirectory::new()));
    let id = "@alpha:example.org";
    cache
        .create_or_update_from_remote(id, &snapshot(id, Some("Alpha")))
        .await
        .unwrap();

    let patches = vec![
        ResidentPatch {
            display_name: Some("Renamed".to_string()),
            ..ResidentPatch::default()
        },
        ResidentPatch {
            avatar_url: Some("https://cdn.example.org/a.png".to_string()),
            ..ResidentPatch::default()
        },
        ResidentPatch {
            credential_ref: Some("ops".to_string()),
            ..ResidentPatch::default()
        },
        ResidentPatch {
            kind: Some(ResidentKind::Human),
            ..ResidentPatch::default()
        },
        ResidentPatch {
            role: Some(Role::Admin),
            ..ResidentPatch::default()
        },
        ResidentPatch {
            lifecycle_state: Some(LifecycleState::Inactive),
            ..ResidentPatch::default()
        },
        ResidentPatch::last_login(1_900_000_000_000),
        ResidentPatch {
            last_sync_epoch_ms: Some(42),
            ..ResidentPatch::default()
        },
    ];

    let mut handles = Vec::new();
    for patch in patches {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            cache.patch(id, &patch).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let record = cache.load(id).await.unwrap().found().unwrap();
    assert_eq!(record.display_name, "Renamed");
    assert_eq!(record.avatar_url, "https://cdn.example.org/a.png");
    assert_eq!(record.credential_ref, "ops");
    assert_eq!(record.kind, ResidentKind::Human);
    assert_eq!(record.role, Role::Admin);
    assert_eq!(record.lifecycle_state, LifecycleState::Inactive);
    assert_eq!(record.last_login_epoch_ms, 1_900_000_000_000);
    assert_eq!(record.last_sync_epoch_ms, 42);

    let listed = cache.list_all().await.unwrap();
    assert_eq!(listed, vec![record]);
    // contended locks are released once the last writer is done
    assert_eq!(cache.locked_ids(), 0);
}

#[tokio::test]
async fn test_concurrent_creates_keep_index_complete() {
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(residents(tmp.path(), &MemoryDirectory::new()));

    let mut handles = Vec::new();
    for i in 0..12 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            let id = format!("@agent{}:example.org", i);
            cache
                .create_or_update_from_remote(&id, &snapshot(&id, None))
                .await
                .unwrap();
            cache
                .create_or_update_from_remote(&id, &snapshot(&id, Some("again")))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut ids: Vec<String> = cache
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    ids.sort();
    let mut expected: Vec<String> = (0..12).map(|i| format!("@agent{}:example.org", i)).collect();
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_rejects_path_like_ids() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let err = cache
        .create_or_update_from_remote("../escape", &snapshot("../escape", None))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidId(_)));
}

#[tokio::test]
async fn test_corrupt_record_is_decode_error() {
    let tmp = TempDir::new().unwrap();
    let cache = residents(tmp.path(), &MemoryDirectory::new());
    let path = cache.record_path("@alpha:example.org").unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{\"id\": 12").unwrap();

    assert!(matches!(
        cache.load("@alpha:example.org").await,
        Err(FleetError::Decode { .. })
    ));
}

#[tokio::test]
async fn test_group_cache_uses_its_own_index() {
    let tmp = TempDir::new().unwrap();
    let directory = MemoryDirectory::new();
    let groups: EntityStateCache<GroupRecord> =
        EntityStateCache::new(tmp.path(), HOME, PLACEHOLDER, Arc::new(directory.clone()));
    let snap: GroupSnapshot = serde_json::from_value(json!({
        "room_id": "!lobby:example.org",
        "name": "lobby",
        "canonical_alias": "#lobby:example.org",
        "joined_members": 2,
        "public": true,
        "encryption": "m.megolm.v1.aes-sha2"
    }))
    .unwrap();

    let record = groups
        .create_or_update_from_remote("!lobby:example.org", &snap)
        .await
        .unwrap();

    assert_eq!(record.member_count, 2);
    assert_eq!(
        record.encryption_algorithm.as_deref(),
        Some("m.megolm.v1.aes-sha2")
    );
    assert!(tmp.path().join("groups.json").exists());
    assert!(!tmp.path().join("residents.json").exists());
    assert!(tmp
        .path()
        .join("groups/!lobby:example.org/profile/!lobby:example.org.txt")
        .exists());
}
