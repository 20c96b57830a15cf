//! Service layer for media-catalog
//!
//! Services encapsulate the catalog's rules on top of the repository
//! functions in `db/`. Each service wraps database operations with:
//! - Input validation
//! - Permission checks
//! - Transaction boundaries
//! - Event emission for audit/notifications
//!
//! ## Architecture
//!
//! ```text
//! CLI / external adapters
//!     ↓
//! Service Layer (identity, lists, permissions, smart lists, ledger)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod identity;
pub mod ledger;
pub mod list_engine;
pub mod permissions;
pub mod smart_list;

// Re-exports
pub use events::{spawn_logging_listener, CatalogEvent, EventBus, EventListener};
pub use identity::{BatchResolveResult, IdentityResolver, MatchedBy, RawItem, Resolution};
pub use ledger::ChangeLedger;
pub use list_engine::{CreateListInput, ListEngine, UpdateListInput};
pub use permissions::PermissionGuard;
pub use smart_list::{RefreshOutcome, SmartListEvaluator};

use std::sync::Arc;
use std::time::Duration;

use crate::capabilities::{CatalogQuery, RoleStore};
use crate::config::Config;
use crate::db::CatalogDb;

/// Service container for dependency injection
///
/// Holds all services over one shared database and event bus.
pub struct Services {
    pub db: Arc<CatalogDb>,
    pub identity: Arc<IdentityResolver>,
    pub lists: Arc<ListEngine>,
    pub permissions: Arc<PermissionGuard>,
    pub smart_lists: Arc<SmartListEvaluator>,
    pub ledger: Arc<ChangeLedger>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services, using the database for roles and catalog queries
    pub fn new(db: Arc<CatalogDb>, config: &Config) -> Self {
        let roles: Arc<dyn RoleStore> = db.clone();
        let catalog: Arc<dyn CatalogQuery> = db.clone();
        Self::with_capabilities(db, config, roles, catalog)
    }

    /// Create all services with externally supplied role store and catalog query
    pub fn with_capabilities(
        db: Arc<CatalogDb>,
        config: &Config,
        roles: Arc<dyn RoleStore>,
        catalog: Arc<dyn CatalogQuery>,
    ) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));

        let permissions = Arc::new(PermissionGuard::new(db.clone(), roles, events.clone()));
        let lists = Arc::new(ListEngine::new(
            db.clone(),
            permissions.clone(),
            events.clone(),
            config.max_title_length,
        ));
        let smart_lists = Arc::new(SmartListEvaluator::new(
            db.clone(),
            lists.clone(),
            catalog,
            events.clone(),
            config.smart_list_limit,
            Duration::from_secs(config.smart_refresh_timeout_secs),
        ));

        Self {
            identity: Arc::new(IdentityResolver::new(
                db.clone(),
                events.clone(),
                config.source_preference.clone(),
            )),
            ledger: Arc::new(ChangeLedger::new(db.clone())),
            lists,
            permissions,
            smart_lists,
            events,
            db,
        }
    }
}
