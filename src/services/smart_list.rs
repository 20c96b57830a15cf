//! Smart list evaluator
//!
//! Re-derives a list's membership from its stored criteria. The catalog
//! query is the only async step: it runs with no lock held, raced against
//! the caller's cancellation signal and a timeout. The result is committed
//! through the list engine, which rejects it if the list changed while the
//! query was running.
//!
//! Refresh is full replacement. Items added by hand do not survive it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::capabilities::CatalogQuery;
use crate::db::{lists, CatalogDb};
use crate::error::CatalogError;
use crate::models::{ItemId, ListContainer, SmartCriteria, UserId, SYSTEM_ACTOR};

use super::events::{CatalogEvent, EventBus};
use super::list_engine::ListEngine;

/// Result of refreshing one list in [`SmartListEvaluator::refresh_due`]
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub list_id: ItemId,
    pub item_count: Option<u32>,
    pub error: Option<String>,
}

pub struct SmartListEvaluator {
    db: Arc<CatalogDb>,
    engine: Arc<ListEngine>,
    catalog: Arc<dyn CatalogQuery>,
    events: Arc<EventBus>,
    default_limit: u32,
    timeout: Duration,
}

impl SmartListEvaluator {
    pub fn new(
        db: Arc<CatalogDb>,
        engine: Arc<ListEngine>,
        catalog: Arc<dyn CatalogQuery>,
        events: Arc<EventBus>,
        default_limit: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            engine,
            catalog,
            events,
            default_limit,
            timeout,
        }
    }

    /// Refresh a smart list with no cancellation signal
    pub async fn refresh(
        &self,
        list_id: ItemId,
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        let (_never, cancel) = broadcast::channel(1);
        self.refresh_with_cancel(list_id, actor, cancel).await
    }

    /// Refresh a smart list, giving up when `cancel` receives a signal.
    ///
    /// A cancelled or timed out refresh leaves the list untouched.
    pub async fn refresh_with_cancel(
        &self,
        list_id: ItemId,
        actor: UserId,
        cancel: broadcast::Receiver<()>,
    ) -> Result<ListContainer, CatalogError> {
        let list = self.engine.get(list_id, actor)?;
        if !list.is_smart {
            return Err(CatalogError::InvalidState("not a smart list".into()));
        }
        let mut criteria = list
            .criteria
            .clone()
            .ok_or_else(|| CatalogError::InvalidState("smart list has no criteria".into()))?;
        criteria.limit.get_or_insert(self.default_limit);
        let read_version = list.version;

        debug!(list_id, actor, version = read_version, "Running smart list query");

        let ids = tokio::select! {
            result = tokio::time::timeout(self.timeout, self.catalog.search(&criteria)) => {
                match result {
                    Ok(ids) => ids?,
                    Err(_) => {
                        warn!(list_id, timeout_secs = self.timeout.as_secs(), "Smart list query timed out");
                        return Err(CatalogError::Timeout(format!(
                            "catalog query for list {} exceeded {:?}",
                            list_id, self.timeout
                        )));
                    }
                }
            }
            _ = cancelled(cancel) => {
                info!(list_id, "Smart list refresh cancelled");
                return Err(CatalogError::Cancelled(format!("refresh of list {}", list_id)));
            }
        };

        let list = self
            .engine
            .apply_refresh(list_id, actor, read_version, &dedupe(ids))?;

        info!(list_id, item_count = list.item_count, "Refreshed smart list");
        self.events.emit(CatalogEvent::SmartListRefreshed {
            list_id,
            item_count: list.item_count,
        });

        Ok(list)
    }

    /// Turn a list smart, or back to manual with `None`
    pub fn set_criteria(
        &self,
        list_id: ItemId,
        actor: UserId,
        criteria: Option<SmartCriteria>,
    ) -> Result<ListContainer, CatalogError> {
        self.engine.set_criteria(list_id, criteria, actor)
    }

    /// Refresh, as the system actor, every smart list not refreshed within `max_age`
    pub async fn refresh_due(
        &self,
        max_age: Duration,
    ) -> Result<Vec<RefreshOutcome>, CatalogError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| CatalogError::InvalidInput(format!("max age out of range: {}", e)))?;
        let cutoff = Utc::now() - max_age;
        let due = self
            .db
            .with_conn(|conn| lists::find_smart_lists_due(conn, cutoff))?;

        debug!(count = due.len(), "Smart lists due for refresh");

        let mut outcomes = Vec::with_capacity(due.len());
        for list_id in due {
            let outcome = match self.refresh(list_id, SYSTEM_ACTOR).await {
                Ok(list) => RefreshOutcome {
                    list_id,
                    item_count: Some(list.item_count),
                    error: None,
                },
                Err(e) => {
                    warn!(list_id, error = %e, "Scheduled refresh failed");
                    RefreshOutcome {
                        list_id,
                        item_count: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }
}

/// Resolves once a cancellation signal arrives. A closed channel never cancels.
async fn cancelled(mut cancel: broadcast::Receiver<()>) {
    loop {
        match cancel.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Keep the first occurrence of each id
fn dedupe(ids: Vec<ItemId>) -> Vec<ItemId> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::items::{insert_item, NewItem};
    use crate::models::{ContentType, ItemPayload, Visibility};
    use crate::services::list_engine::CreateListInput;
    use crate::services::permissions::PermissionGuard;
    use async_trait::async_trait;

    /// Catalog that never answers
    struct StalledCatalog;

    #[async_trait]
    impl CatalogQuery for StalledCatalog {
        async fn search(&self, _criteria: &SmartCriteria) -> Result<Vec<ItemId>, CatalogError> {
            std::future::pending().await
        }
    }

    /// Catalog returning fixed ids, duplicates included
    struct FixedCatalog(Vec<ItemId>);

    #[async_trait]
    impl CatalogQuery for FixedCatalog {
        async fn search(&self, _criteria: &SmartCriteria) -> Result<Vec<ItemId>, CatalogError> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        db: Arc<CatalogDb>,
        engine: Arc<ListEngine>,
        events: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(CatalogDb::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let guard = Arc::new(PermissionGuard::new(db.clone(), db.clone(), events.clone()));
        let engine = Arc::new(ListEngine::new(db.clone(), guard, events.clone(), 500));
        Fixture { db, engine, events }
    }

    fn evaluator(f: &Fixture, catalog: Arc<dyn CatalogQuery>, timeout: Duration) -> SmartListEvaluator {
        SmartListEvaluator::new(f.db.clone(), f.engine.clone(), catalog, f.events.clone(), 500, timeout)
    }

    fn seed_movies(db: &CatalogDb, titles: &[(&str, &str)]) -> Vec<ItemId> {
        db.with_conn(|conn| {
            titles
                .iter()
                .map(|(title, genre)| {
                    let payload = ItemPayload::Movie {
                        runtime_minutes: None,
                        genres: vec![genre.to_string()],
                        rating: None,
                    };
                    insert_item(
                        conn,
                        &NewItem {
                            content_type: ContentType::Movie,
                            title,
                            year: Some(2001),
                            payload: &payload,
                            owner_id: None,
                        },
                        Utc::now(),
                    )
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .unwrap()
    }

    fn smart_input(genre: &str) -> CreateListInput {
        CreateListInput {
            criteria: Some(SmartCriteria {
                genres: vec![genre.into()],
                ..Default::default()
            }),
            ..CreateListInput::new("Smart")
        }
    }

    #[tokio::test]
    async fn test_refresh_replaces_membership() {
        let f = fixture();
        let ids = seed_movies(&f.db, &[("Amelie", "comedy"), ("Memento", "thriller"), ("Shrek", "comedy")]);
        let evaluator = evaluator(&f, f.db.clone(), Duration::from_secs(5));

        let list = f.engine.create_with(1, smart_input("comedy")).unwrap();
        f.engine.add_item(list.id, ids[1], 1).unwrap();

        let refreshed = evaluator.refresh(list.id, 1).await.unwrap();
        assert_eq!(refreshed.item_ids(), vec![ids[0], ids[2]]);
        assert!(refreshed.auto_update_time.is_some());
    }

    #[tokio::test]
    async fn test_refresh_dedupes_catalog_results() {
        let f = fixture();
        let ids = seed_movies(&f.db, &[("A", "x"), ("B", "x")]);
        let catalog = Arc::new(FixedCatalog(vec![ids[1], ids[0], ids[1]]));
        let evaluator = evaluator(&f, catalog, Duration::from_secs(5));

        let list = f.engine.create_with(1, smart_input("x")).unwrap();
        let refreshed = evaluator.refresh(list.id, 1).await.unwrap();
        assert_eq!(refreshed.item_ids(), vec![ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn test_manual_list_is_rejected() {
        let f = fixture();
        let evaluator = evaluator(&f, f.db.clone(), Duration::from_secs(5));
        let list = f.engine.create(1, "Manual", None).unwrap();

        let err = evaluator.refresh(list.id, 1).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: not a smart list");
    }

    #[tokio::test]
    async fn test_cancelled_refresh_leaves_list_untouched() {
        let f = fixture();
        let evaluator = evaluator(&f, Arc::new(StalledCatalog), Duration::from_secs(30));
        let list = f.engine.create_with(1, smart_input("x")).unwrap();

        let (cancel_tx, cancel_rx) = broadcast::channel(1);
        let cancel_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cancel_tx.send(());
        });

        let err = evaluator
            .refresh_with_cancel(list.id, 1, cancel_rx)
            .await
            .unwrap_err();
        cancel_task.await.unwrap();
        assert!(matches!(err, CatalogError::Cancelled(_)));

        let stored = f.engine.get(list.id, 1).unwrap();
        assert_eq!(stored.version, list.version);
        assert!(stored.auto_update_time.is_none());
    }

    #[tokio::test]
    async fn test_timeout() {
        let f = fixture();
        let evaluator = evaluator(&f, Arc::new(StalledCatalog), Duration::from_millis(20));
        let list = f.engine.create_with(1, smart_input("x")).unwrap();

        let err = evaluator.refresh(list.id, 1).await.unwrap_err();
        assert!(matches!(err, CatalogError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refresh_due_runs_as_system() {
        let f = fixture();
        seed_movies(&f.db, &[("Jazz on a Summer's Day", "jazz")]);
        let evaluator = evaluator(&f, f.db.clone(), Duration::from_secs(5));

        let smart = f.engine.create_with(4, smart_input("jazz")).unwrap();
        f.engine.create(4, "Manual", None).unwrap();

        let outcomes = evaluator.refresh_due(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].list_id, smart.id);
        assert_eq!(outcomes[0].item_count, Some(1));

        let history = f.engine.history(smart.id, 4).unwrap();
        assert!(history.iter().all(|r| r.actor == SYSTEM_ACTOR));

        // Fresh now, so nothing is due
        let outcomes = evaluator.refresh_due(Duration::from_secs(3600)).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_skips_private_lists_of_other_users() {
        let f = fixture();
        let evaluator = evaluator(&f, f.db.clone(), Duration::from_secs(5));

        f.engine.create(1, "Alice secret", None).unwrap();
        let public = f
            .engine
            .create_with(
                1,
                CreateListInput {
                    visibility: Visibility::Public,
                    ..CreateListInput::new("Alice picks")
                },
            )
            .unwrap();

        let lists_of_alice = SmartCriteria {
            content_types: vec![ContentType::Collection],
            owner_id: Some(1),
            ..Default::default()
        };
        let snoop = f
            .engine
            .create_with(
                2,
                CreateListInput {
                    criteria: Some(lists_of_alice.clone()),
                    ..CreateListInput::new("Alice's lists")
                },
            )
            .unwrap();

        let refreshed = evaluator.refresh(snoop.id, 2).await.unwrap();
        assert_eq!(refreshed.item_ids(), vec![public.id]);

        // Title guessing finds nothing either
        let guess = SmartCriteria {
            text: Some("secret".into()),
            ..lists_of_alice
        };
        evaluator.set_criteria(snoop.id, 2, Some(guess)).unwrap();
        let refreshed = evaluator.refresh(snoop.id, 2).await.unwrap();
        assert!(refreshed.entries.is_empty());
    }

    #[tokio::test]
    async fn test_set_criteria_toggles_smart() {
        let f = fixture();
        let evaluator = evaluator(&f, f.db.clone(), Duration::from_secs(5));
        let list = f.engine.create(1, "Toggle", None).unwrap();

        let smart = evaluator
            .set_criteria(list.id, 1, Some(SmartCriteria::default()))
            .unwrap();
        assert!(smart.is_smart);

        let manual = evaluator.set_criteria(list.id, 1, None).unwrap();
        assert!(!manual.is_smart);
        assert!(manual.criteria.is_none());
    }
}
