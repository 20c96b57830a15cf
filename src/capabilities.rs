//! Contracts for collaborators that live outside the core
//!
//! `CatalogDb` implements both traits against its own tables, which is what the
//! CLI and tests use. A deployment with a real search service or account store
//! supplies its own implementations to [`crate::services::Services::with_capabilities`].

use async_trait::async_trait;

use crate::error::CatalogError;
use crate::models::{ItemId, Role, SmartCriteria, UserId};

/// Structured catalog search used by smart lists
#[async_trait]
pub trait CatalogQuery: Send + Sync {
    /// Ids of items matching `criteria`, in the requested sort order
    async fn search(&self, criteria: &SmartCriteria) -> Result<Vec<ItemId>, CatalogError>;
}

/// Account role lookup used by the permission guard
pub trait RoleStore: Send + Sync {
    /// Role of a user; unknown users are plain users
    fn role_of(&self, user_id: UserId) -> Result<Role, CatalogError>;
}
