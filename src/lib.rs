//! Media Catalog - canonical identity and ordered lists for media aggregated
//! from many external sources
//!
//! The same movie, episode or track often reaches the system through several
//! sources (a streaming service, a metadata provider, a home media server).
//! This crate keeps one canonical record per piece of content and organizes
//! those records into user-owned lists.
//!
//! ## Architecture
//!
//! - **Identity Resolver**: matches raw source items to canonical items by
//!   external reference, then by normalized title and year
//! - **List Engine**: position-stable membership with a per-list lock and an
//!   optimistic version check on every commit
//! - **Permission Guard**: ownership, roles and collaborator grants
//! - **Smart List Evaluator**: re-derives membership from stored criteria
//! - **Change Ledger**: append-only history, kept after lists are deleted
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/media-catalog/
//! ├── catalog.db       # SQLite (WAL): items, lists, ledger, grants
//! └── config.toml      # Configuration
//! ```

pub mod capabilities;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

// Re-exports
pub use capabilities::{CatalogQuery, RoleStore};
pub use config::Config;
pub use db::{CatalogDb, DbStats};
pub use error::CatalogError;
pub use models::{
    CanonicalItem, ChangeKind, ChangeRecord, ContentType, ExternalReference, ItemId, ItemPayload,
    ListContainer, PermissionLevel, Role, SmartCriteria, SyncOrigin, UserId, Visibility,
    SYSTEM_ACTOR,
};
pub use services::{
    CatalogEvent, CreateListInput, EventBus, IdentityResolver, ListEngine, PermissionGuard,
    RawItem, Services, SmartListEvaluator, UpdateListInput,
};
