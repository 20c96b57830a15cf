//! Integration tests for resolution, lists, sharing and smart refresh
//!
//! Each test runs the full service stack over an on-disk database in a
//! temporary directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use media_catalog::services::{MatchedBy, RawItem};
use media_catalog::{
    CatalogDb, CatalogError, CatalogQuery, ChangeKind, Config, ContentType, CreateListInput,
    ExternalReference, ItemId, ItemPayload, PermissionLevel, RoleStore, Services, SmartCriteria,
    SyncOrigin, UserId, SYSTEM_ACTOR,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const OWNER: UserId = 10;
const FRIEND: UserId = 20;

/// Helper to create services over a temporary storage directory
fn create_services() -> (Services, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let db = Arc::new(CatalogDb::open(&config.database_path()).unwrap());
    (Services::new(db, &config), temp_dir)
}

fn raw_movie(title: &str, year: i32, refs: &[(&str, &str)], source: &str, local_id: &str) -> RawItem {
    RawItem {
        content_type: ContentType::Movie,
        title: title.into(),
        year: Some(year),
        external_refs: refs
            .iter()
            .map(|(s, id)| ExternalReference::new(s, id))
            .collect(),
        payload: Some(ItemPayload::Movie {
            runtime_minutes: None,
            genres: vec!["drama".into()],
            rating: Some(7.0),
        }),
        origin: SyncOrigin {
            source_id: source.into(),
            source_content_type: "movie".into(),
            local_id: local_id.into(),
        },
    }
}

fn seed(services: &Services, n: usize) -> Vec<ItemId> {
    (0..n)
        .map(|i| {
            let title = format!("Feature {}", i);
            let local = i.to_string();
            let tmdb = format!("{}", 1000 + i);
            services
                .identity
                .resolve(&raw_movie(&title, 2000, &[("tmdb", &tmdb)], "sourceB", &local))
                .unwrap()
                .id
        })
        .collect()
}

/// Resolving the same reference twice yields one item, with the mapping updated
#[test]
fn test_identity_is_idempotent() {
    let (services, _temp) = create_services();

    let c = services
        .identity
        .resolve(&raw_movie("Original Title", 1999, &[("sourceA", "42")], "sourceA", "a-1"))
        .unwrap();

    let again = services
        .identity
        .resolve_detailed(&raw_movie("Renamed Title", 2003, &[("sourceA", "42")], "sourceA", "a-2"))
        .unwrap();

    assert_eq!(again.item.id, c.id);
    assert!(!again.created);
    assert!(matches!(again.matched_by, MatchedBy::ExternalReference { .. }));
    assert_eq!(again.item.title, "Original Title");
    assert_eq!(again.item.mapping_for("sourceA").unwrap().local_id, "a-2");
    assert_eq!(services.db.stats().unwrap().item_count, 1);
}

/// add 101, 102, 103; remove 102; reorder
#[test]
fn test_list_positions_through_edits() {
    let (services, _temp) = create_services();
    let ids = seed(&services, 3);
    let list = services.lists.create(OWNER, "Watch later", None).unwrap();

    for id in &ids {
        services.lists.add_item(list.id, *id, OWNER).unwrap();
    }
    let list_now = services.lists.get(list.id, OWNER).unwrap();
    let positions: Vec<u32> = list_now.entries.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);

    let after = services.lists.remove_item(list.id, ids[1], OWNER).unwrap();
    assert_eq!(after.item_ids(), vec![ids[0], ids[2]]);
    assert_eq!(after.item_count, 2);

    let reordered = services
        .lists
        .reorder(list.id, &[ids[2], ids[0]], OWNER)
        .unwrap();
    assert_eq!(reordered.item_ids(), vec![ids[2], ids[0]]);

    let stored = services.lists.get(list.id, OWNER).unwrap();
    for (index, entry) in stored.entries.iter().enumerate() {
        assert_eq!(entry.position as usize, index);
    }
    assert_eq!(stored.item_count as usize, stored.entries.len());
}

/// A read collaborator can list items but not change them, until re-shared at write
#[test]
fn test_sharing_read_then_write() {
    let (services, _temp) = create_services();
    let ids = seed(&services, 2);
    let list = services.lists.create(OWNER, "Shared picks", None).unwrap();
    services.lists.add_item(list.id, ids[0], OWNER).unwrap();

    let grant = services
        .permissions
        .share_with(OWNER, list.id, FRIEND, "read")
        .unwrap();
    assert_eq!(grant.level, PermissionLevel::Read);

    assert_eq!(services.lists.get(list.id, FRIEND).unwrap().item_ids(), vec![ids[0]]);

    let denied = [
        services.lists.add_item(list.id, ids[1], FRIEND).err(),
        services.lists.remove_item(list.id, ids[0], FRIEND).err(),
        services.lists.reorder(list.id, &[ids[0]], FRIEND).err(),
        services
            .lists
            .update(list.id, Default::default(), FRIEND)
            .err(),
    ];
    for err in denied {
        assert!(matches!(err, Some(CatalogError::PermissionDenied(_))));
    }

    services
        .permissions
        .share_with(OWNER, list.id, FRIEND, "write")
        .unwrap();
    let list = services.lists.add_item(list.id, ids[1], FRIEND).unwrap();
    assert_eq!(list.modified_by, FRIEND);
    assert_eq!(services.permissions.collaborators(OWNER, list.id).unwrap().len(), 1);
}

/// Remove then add of the same item appends to the history
#[test]
fn test_history_is_append_only() {
    let (services, _temp) = create_services();
    let ids = seed(&services, 1);
    let list = services.lists.create(OWNER, "Again", None).unwrap();

    services.lists.add_item(list.id, ids[0], OWNER).unwrap();
    services.lists.remove_item(list.id, ids[0], OWNER).unwrap();
    services.lists.add_item(list.id, ids[0], OWNER).unwrap();

    let kinds: Vec<ChangeKind> = services
        .lists
        .entry_history(list.id, ids[0], OWNER)
        .unwrap()
        .iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds, vec![ChangeKind::Add, ChangeKind::Remove, ChangeKind::Add]);
}

/// Deleting a list keeps its ledger
#[test]
fn test_ledger_survives_deletion() {
    let (services, _temp) = create_services();
    let ids = seed(&services, 2);
    let list = services.lists.create(OWNER, "Temporary", None).unwrap();
    services.lists.replace_all(list.id, &ids, OWNER).unwrap();

    let err = services.lists.delete(list.id, FRIEND).unwrap_err();
    assert!(matches!(err, CatalogError::PermissionDenied(_)));

    services.lists.delete(list.id, OWNER).unwrap();
    assert!(matches!(
        services.lists.get(list.id, OWNER),
        Err(CatalogError::NotFound(_))
    ));

    let history = services.ledger.history(list.id).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history.last().unwrap().kind, ChangeKind::Remove);
    assert_eq!(services.lists.history(list.id, SYSTEM_ACTOR).unwrap().len(), 3);

    // Items themselves are untouched
    assert_eq!(services.db.stats().unwrap().item_count, 2);
}

/// Smart list refresh over the built-in catalog query
#[tokio::test]
async fn test_smart_list_refresh() {
    let (services, _temp) = create_services();
    let ids = seed(&services, 3);

    let list = services
        .lists
        .create_with(
            OWNER,
            CreateListInput {
                criteria: Some(SmartCriteria {
                    genres: vec!["drama".into()],
                    limit: Some(2),
                    ..Default::default()
                }),
                ..CreateListInput::new("Top drama")
            },
        )
        .unwrap();

    let refreshed = services.smart_lists.refresh(list.id, OWNER).await.unwrap();
    assert_eq!(refreshed.item_ids(), vec![ids[0], ids[1]]);
    assert_eq!(refreshed.modified_by, OWNER);

    let outcomes = services
        .smart_lists
        .refresh_due(Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(outcomes.is_empty());
}

/// Catalog that never answers, so only cancellation can end a refresh
struct StalledCatalog;

#[async_trait]
impl CatalogQuery for StalledCatalog {
    async fn search(&self, _criteria: &SmartCriteria) -> Result<Vec<ItemId>, CatalogError> {
        std::future::pending().await
    }
}

/// A refresh cancelled before its query completes changes nothing
#[tokio::test]
async fn test_cancelled_refresh_is_a_no_op() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        smart_refresh_timeout_secs: 60,
        ..Default::default()
    };
    let db = Arc::new(CatalogDb::open(&config.database_path()).unwrap());
    let roles: Arc<dyn RoleStore> = db.clone();
    let services = Services::with_capabilities(db, &config, roles, Arc::new(StalledCatalog));

    let list = services
        .lists
        .create_with(
            OWNER,
            CreateListInput {
                criteria: Some(SmartCriteria::default()),
                ..CreateListInput::new("Everything")
            },
        )
        .unwrap();

    let (cancel_tx, cancel_rx) = broadcast::channel(1);
    cancel_tx.send(()).unwrap();

    let err = services
        .smart_lists
        .refresh_with_cancel(list.id, OWNER, cancel_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Cancelled(_)));

    let stored = services.lists.get(list.id, OWNER).unwrap();
    assert_eq!(stored.version, list.version);
    assert!(stored.auto_update_time.is_none());
    assert!(services.lists.history(list.id, OWNER).unwrap().is_empty());
}

/// Data written through one handle is visible after reopening the file
#[test]
fn test_reopen_preserves_lists() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };

    let list_id = {
        let db = Arc::new(CatalogDb::open(&config.database_path()).unwrap());
        let services = Services::new(db, &config);
        let ids = seed(&services, 2);
        let list = services.lists.create(OWNER, "Durable", None).unwrap();
        services.lists.replace_all(list.id, &ids, OWNER).unwrap();
        list.id
    };

    let db = Arc::new(CatalogDb::open(&config.database_path()).unwrap());
    let services = Services::new(db, &config);
    let list = services.lists.get(list_id, OWNER).unwrap();
    assert_eq!(list.item_count, 2);
    assert_eq!(list.version, 1);
}
