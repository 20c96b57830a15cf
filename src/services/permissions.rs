//! Permission guard - read/write authorization for lists
//!
//! The only place that looks at ownership, account roles and collaborator
//! rows. Read access never implies write access: a collaborator writes only
//! with a `write` grant confirmed against the collaborator table, and list
//! visibility only ever widens reads.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::capabilities::RoleStore;
use crate::db::{collaborators, ledger, lists, CatalogDb};
use crate::error::CatalogError;
use crate::models::{
    ChangeKind, Collaborator, ItemId, ListContainer, PendingChange, PermissionLevel, Role, UserId,
    Visibility, SYSTEM_ACTOR,
};

use super::events::{CatalogEvent, EventBus};

pub struct PermissionGuard {
    db: Arc<CatalogDb>,
    roles: Arc<dyn RoleStore>,
    events: Arc<EventBus>,
}

impl PermissionGuard {
    pub fn new(db: Arc<CatalogDb>, roles: Arc<dyn RoleStore>, events: Arc<EventBus>) -> Self {
        Self { db, roles, events }
    }

    // =========================================================================
    // Checks
    // =========================================================================

    pub fn is_admin(&self, user: UserId) -> Result<bool, CatalogError> {
        Ok(self.roles.role_of(user)? == Role::Admin)
    }

    fn is_privileged(&self, user: UserId, list: &ListContainer) -> Result<bool, CatalogError> {
        if user == SYSTEM_ACTOR || user == list.owner_id {
            return Ok(true);
        }
        self.is_admin(user)
    }

    fn grant_of(
        &self,
        user: UserId,
        list_id: ItemId,
    ) -> Result<Option<PermissionLevel>, CatalogError> {
        let row = self
            .db
            .with_conn(|conn| collaborators::get(conn, list_id, user))?;
        Ok(row.map(|c| c.level))
    }

    pub fn can_read(&self, user: UserId, list: &ListContainer) -> Result<bool, CatalogError> {
        if list.visibility == Visibility::Public || self.is_privileged(user, list)? {
            return Ok(true);
        }
        Ok(self.grant_of(user, list.id)?.is_some())
    }

    pub fn can_write(&self, user: UserId, list: &ListContainer) -> Result<bool, CatalogError> {
        if self.is_privileged(user, list)? {
            return Ok(true);
        }
        Ok(self.grant_of(user, list.id)? == Some(PermissionLevel::Write))
    }

    /// Owner, administrator or system: may delete the list or change its visibility
    pub fn can_manage(&self, user: UserId, list: &ListContainer) -> Result<bool, CatalogError> {
        self.is_privileged(user, list)
    }

    pub fn require_read(&self, user: UserId, list: &ListContainer) -> Result<(), CatalogError> {
        if self.can_read(user, list)? {
            return Ok(());
        }
        debug!(list_id = list.id, user, "Read denied");
        Err(CatalogError::PermissionDenied(format!(
            "user {} lacks read access to list {}",
            user, list.id
        )))
    }

    pub fn require_write(&self, user: UserId, list: &ListContainer) -> Result<(), CatalogError> {
        if self.can_write(user, list)? {
            return Ok(());
        }
        debug!(list_id = list.id, user, "Write denied");
        Err(CatalogError::PermissionDenied(format!(
            "user {} lacks write access to list {}",
            user, list.id
        )))
    }

    pub fn require_manage(&self, user: UserId, list: &ListContainer) -> Result<(), CatalogError> {
        if self.can_manage(user, list)? {
            return Ok(());
        }
        Err(CatalogError::PermissionDenied(format!(
            "user {} is not the owner of list {}",
            user, list.id
        )))
    }

    fn require_owner(&self, user: UserId, list: &ListContainer) -> Result<(), CatalogError> {
        if user == list.owner_id {
            return Ok(());
        }
        Err(CatalogError::PermissionDenied(format!(
            "only the owner may change sharing of list {} (acting user {})",
            list.id, user
        )))
    }

    // =========================================================================
    // Sharing
    // =========================================================================

    fn load(&self, list_id: ItemId) -> Result<ListContainer, CatalogError> {
        self.db
            .with_conn(|conn| lists::get_list(conn, list_id))?
            .ok_or_else(|| CatalogError::NotFound(format!("list {}", list_id)))
    }

    /// Grant `target` access at `level` (exactly "read" or "write").
    ///
    /// Re-sharing updates the existing grant in place. Sharing a private list
    /// moves it to shared visibility.
    pub fn share_with(
        &self,
        owner: UserId,
        list_id: ItemId,
        target: UserId,
        level: &str,
    ) -> Result<Collaborator, CatalogError> {
        let level: PermissionLevel = level.parse()?;
        let list = self.load(list_id)?;
        self.require_owner(owner, &list)?;

        if target == owner {
            return Err(CatalogError::InvalidInput(
                "cannot share a list with its owner".into(),
            ));
        }
        if target == SYSTEM_ACTOR {
            return Err(CatalogError::InvalidInput(
                "cannot share a list with the system actor".into(),
            ));
        }

        let now = Utc::now();
        let collaborator = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let collaborator = collaborators::upsert(&tx, list_id, target, level, owner, now)?;
            if list.visibility == Visibility::Private {
                lists::set_visibility(&tx, list_id, Visibility::Shared, owner, list.version, now)?;
                ledger::append(
                    &tx,
                    list_id,
                    owner,
                    &[PendingChange::new(list_id, ChangeKind::Update)],
                    now,
                )?;
            }
            tx.commit()?;
            Ok(collaborator)
        })?;

        info!(list_id, user = target, level = level.as_str(), "Shared list");
        self.events.emit(CatalogEvent::CollaboratorGranted {
            list_id,
            user_id: target,
            level,
        });

        Ok(collaborator)
    }

    /// Revoke a grant. Returns false when `user` was not a collaborator.
    pub fn remove_collaborator(
        &self,
        owner: UserId,
        list_id: ItemId,
        user: UserId,
    ) -> Result<bool, CatalogError> {
        let list = self.load(list_id)?;
        self.require_owner(owner, &list)?;

        let removed = self
            .db
            .with_conn(|conn| collaborators::remove(conn, list_id, user))?;

        if removed {
            info!(list_id, user, "Revoked collaborator");
            self.events.emit(CatalogEvent::CollaboratorRevoked {
                list_id,
                user_id: user,
            });
        }
        Ok(removed)
    }

    /// Grants on a list, visible to anyone who may read it
    pub fn collaborators(
        &self,
        user: UserId,
        list_id: ItemId,
    ) -> Result<Vec<Collaborator>, CatalogError> {
        let list = self.load(list_id)?;
        self.require_read(user, &list)?;
        self.db.with_conn(|conn| collaborators::list_for(conn, list_id))
    }
}
