//! List engine - ordered, audited, permissioned list membership
//!
//! Every mutation is one read-modify-write cycle:
//! 1. Take the per-list lock
//! 2. Read the list fresh and check permission
//! 3. Validate and apply the change in memory, collecting ledger records
//! 4. Commit list row, entries and ledger records in one transaction,
//!    comparing the version that was read
//!
//! Validation happens before the transaction opens, so a rejected request
//! never leaves a partial write behind.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::{collaborators, items, ledger, lists, CatalogDb};
use crate::error::CatalogError;
use crate::models::{
    ChangeKind, ChangeRecord, ContentType, ItemId, ListContainer, ListEntry, PendingChange,
    PermissionLevel, SmartCriteria, UserId, Visibility, SYSTEM_ACTOR,
};

use super::events::{CatalogEvent, EventBus};
use super::permissions::PermissionGuard;

fn default_kind() -> ContentType {
    ContentType::Collection
}

/// Input for creating a list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateListInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: ContentType,
    #[serde(default)]
    pub visibility: Visibility,
    /// Present for smart lists
    #[serde(default)]
    pub criteria: Option<SmartCriteria>,
}

impl CreateListInput {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            kind: default_kind(),
            visibility: Visibility::Private,
            criteria: None,
        }
    }
}

/// Partial update; absent fields are left alone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateListInput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    /// Full replacement of the membership, in order
    #[serde(default)]
    pub items: Option<Vec<ItemId>>,
}

pub struct ListEngine {
    db: Arc<CatalogDb>,
    guard: Arc<PermissionGuard>,
    events: Arc<EventBus>,
    locks: DashMap<ItemId, Arc<Mutex<()>>>,
    max_title_length: usize,
}

impl ListEngine {
    pub fn new(
        db: Arc<CatalogDb>,
        guard: Arc<PermissionGuard>,
        events: Arc<EventBus>,
        max_title_length: usize,
    ) -> Self {
        Self {
            db,
            guard,
            events,
            locks: DashMap::new(),
            max_title_length,
        }
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    fn load(&self, list_id: ItemId) -> Result<ListContainer, CatalogError> {
        self.db
            .with_conn(|conn| lists::get_list(conn, list_id))?
            .ok_or_else(|| CatalogError::NotFound(format!("list {}", list_id)))
    }

    /// Get a list the actor may read
    pub fn get(&self, list_id: ItemId, actor: UserId) -> Result<ListContainer, CatalogError> {
        let list = self.load(list_id)?;
        self.guard.require_read(actor, &list)?;
        Ok(list)
    }

    /// Lists of `owner` that `actor` may read, most recently modified first.
    ///
    /// `offset` and `limit` count readable lists only.
    pub fn find_by_owner(
        &self,
        actor: UserId,
        owner: UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ListContainer>, CatalogError> {
        if actor == owner || actor == SYSTEM_ACTOR || self.guard.is_admin(actor)? {
            return self
                .db
                .with_conn(|conn| lists::find_by_owner(conn, owner, limit, offset));
        }

        let ids = self
            .db
            .with_conn(|conn| lists::find_ids_by_owner(conn, owner))?;

        let mut skipped = 0;
        let mut page = Vec::new();
        for id in ids {
            if page.len() >= limit as usize {
                break;
            }
            let Some(list) = self.db.with_conn(|conn| lists::get_list(conn, id))? else {
                continue;
            };
            if !self.guard.can_read(actor, &list)? {
                continue;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            page.push(list);
        }
        Ok(page)
    }

    /// Lists other users have granted `actor` access to
    pub fn shared_with(&self, actor: UserId) -> Result<Vec<ListContainer>, CatalogError> {
        let ids = self
            .db
            .with_conn(|conn| collaborators::lists_shared_with(conn, actor))?;
        let found = self.db.with_conn(|conn| lists::lists_among(conn, &ids))?;

        let mut readable = Vec::with_capacity(found.len());
        for list in found {
            if self.guard.can_read(actor, &list)? {
                readable.push(list);
            }
        }
        Ok(readable)
    }

    /// Ledger of a list. Deleted lists keep their history, visible to administrators.
    pub fn history(
        &self,
        list_id: ItemId,
        actor: UserId,
    ) -> Result<Vec<ChangeRecord>, CatalogError> {
        self.require_history_access(list_id, actor)?;
        self.db.with_conn(|conn| ledger::history(conn, list_id))
    }

    /// Ledger of one entry of a list
    pub fn entry_history(
        &self,
        list_id: ItemId,
        item_id: ItemId,
        actor: UserId,
    ) -> Result<Vec<ChangeRecord>, CatalogError> {
        self.require_history_access(list_id, actor)?;
        self.db
            .with_conn(|conn| ledger::history_for_item(conn, list_id, item_id))
    }

    fn require_history_access(&self, list_id: ItemId, actor: UserId) -> Result<(), CatalogError> {
        match self.db.with_conn(|conn| lists::get_list(conn, list_id))? {
            Some(list) => self.guard.require_read(actor, &list),
            None if actor == SYSTEM_ACTOR || self.guard.is_admin(actor)? => Ok(()),
            None => Err(CatalogError::NotFound(format!("list {}", list_id))),
        }
    }

    // =========================================================================
    // Create / Delete
    // =========================================================================

    /// Create an empty manual collection
    pub fn create(
        &self,
        owner: UserId,
        title: &str,
        description: Option<&str>,
    ) -> Result<ListContainer, CatalogError> {
        let mut input = CreateListInput::new(title);
        input.description = description.map(str::to_string);
        self.create_with(owner, input)
    }

    pub fn create_with(
        &self,
        owner: UserId,
        input: CreateListInput,
    ) -> Result<ListContainer, CatalogError> {
        let title = self.validate_title(&input.title)?;
        if !input.kind.is_list() {
            return Err(CatalogError::InvalidInput(format!(
                "'{}' is not a list type",
                input.kind
            )));
        }
        if let Some(criteria) = &input.criteria {
            criteria.validate()?;
        }

        let now = Utc::now();
        let list = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let id = lists::insert_list(
                &tx,
                &lists::NewList {
                    content_type: input.kind,
                    title: &title,
                    description: input.description.as_deref(),
                    owner_id: owner,
                    visibility: input.visibility,
                    criteria: input.criteria.as_ref(),
                },
                now,
            )?;
            let list = lists::get_list(&tx, id)?.ok_or_else(|| {
                CatalogError::Internal(format!("list {} vanished after insert", id))
            })?;
            tx.commit()?;
            Ok(list)
        })?;

        info!(list_id = list.id, owner, smart = list.is_smart, "Created list");
        self.events.emit(CatalogEvent::ListCreated {
            list_id: list.id,
            owner_id: owner,
            title: list.title.clone(),
        });

        Ok(list)
    }

    /// Delete a list (owner or administrator). Its ledger history stays.
    pub fn delete(&self, list_id: ItemId, actor: UserId) -> Result<(), CatalogError> {
        let lock = self.lock_for(list_id);
        let _held = lock
            .lock()
            .map_err(|e| CatalogError::Internal(format!("List lock poisoned: {}", e)))?;

        let list = self.load(list_id)?;
        self.guard.require_manage(actor, &list)?;

        let now = Utc::now();
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if !lists::delete_list(&tx, list_id)? {
                return Err(CatalogError::NotFound(format!("list {}", list_id)));
            }
            ledger::append(
                &tx,
                list_id,
                actor,
                &[PendingChange::new(list_id, ChangeKind::Remove)],
                now,
            )?;
            tx.commit()?;
            Ok(())
        })?;

        self.locks.remove(&list_id);
        info!(list_id, actor, "Deleted list");
        self.events.emit(CatalogEvent::ListDeleted { list_id, actor });
        Ok(())
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Append an item at the end of the list
    pub fn add_item(
        &self,
        list_id: ItemId,
        item_id: ItemId,
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        self.mutate(list_id, actor, PermissionLevel::Write, None, |conn, list, now| {
            if list.contains(item_id) {
                return Err(CatalogError::InvalidState(format!(
                    "item {} is already in list {}",
                    item_id, list.id
                )));
            }
            if item_id == list.id {
                return Err(CatalogError::InvalidInput("a list cannot contain itself".into()));
            }
            if !items::item_exists(conn, item_id)? {
                return Err(CatalogError::NotFound(format!("item {}", item_id)));
            }

            list.entries.push(ListEntry {
                item_id,
                position: list.item_count,
                changed_at: now,
            });
            Ok(vec![PendingChange::new(item_id, ChangeKind::Add)])
        })
    }

    pub fn remove_item(
        &self,
        list_id: ItemId,
        item_id: ItemId,
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        self.mutate(list_id, actor, PermissionLevel::Write, None, |_, list, _| {
            let index = list
                .index_of(item_id)
                .ok_or_else(|| CatalogError::NotFound("item not found".into()))?;
            list.entries.remove(index);
            Ok(vec![PendingChange::new(item_id, ChangeKind::Remove)])
        })
    }

    /// Remove an item, checking first that it sits at `position`
    pub fn remove_item_at_position(
        &self,
        list_id: ItemId,
        item_id: ItemId,
        position: u32,
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        self.mutate(list_id, actor, PermissionLevel::Write, None, |_, list, _| {
            let index = position as usize;
            match list.entries.get(index) {
                Some(entry) if entry.item_id == item_id => {}
                _ => return Err(CatalogError::InvalidState("position mismatch".into())),
            }
            list.entries.remove(index);
            Ok(vec![PendingChange::new(item_id, ChangeKind::Remove)])
        })
    }

    /// Rewrite positions to follow `ordered`, which must be a permutation of the membership
    pub fn reorder(
        &self,
        list_id: ItemId,
        ordered: &[ItemId],
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        self.mutate(list_id, actor, PermissionLevel::Write, None, |_, list, _| {
            let current: HashSet<ItemId> = list.entries.iter().map(|e| e.item_id).collect();
            let requested: HashSet<ItemId> = ordered.iter().copied().collect();
            if ordered.len() != list.entries.len()
                || requested.len() != ordered.len()
                || requested != current
            {
                return Err(CatalogError::InvalidState("reorder set mismatch".into()));
            }

            let mut remaining = std::mem::take(&mut list.entries);
            for id in ordered {
                if let Some(index) = remaining.iter().position(|e| e.item_id == *id) {
                    list.entries.push(remaining.swap_remove(index));
                }
            }

            Ok(ordered
                .iter()
                .map(|id| PendingChange::new(*id, ChangeKind::Reorder))
                .collect())
        })
    }

    /// Replace the whole membership with `item_ids`, in order
    pub fn replace_all(
        &self,
        list_id: ItemId,
        item_ids: &[ItemId],
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        self.mutate(list_id, actor, PermissionLevel::Write, None, |conn, list, now| {
            check_replacement(conn, list.id, item_ids)?;
            Ok(replace_entries(list, item_ids, now))
        })
    }

    /// Update metadata and, when `items` is given, replace the membership
    pub fn update(
        &self,
        list_id: ItemId,
        input: UpdateListInput,
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        let title = input
            .title
            .as_deref()
            .map(|t| self.validate_title(t))
            .transpose()?;

        if input.visibility.is_some() {
            let list = self.load(list_id)?;
            if input.visibility != Some(list.visibility) {
                self.guard.require_manage(actor, &list)?;
            }
        }

        self.mutate(list_id, actor, PermissionLevel::Write, None, |conn, list, now| {
            let mut changes = vec![];
            let mut metadata_changed = false;

            if let Some(title) = title {
                metadata_changed |= list.title != title;
                list.title = title;
            }
            if let Some(description) = input.description {
                let description = Some(description).filter(|d| !d.trim().is_empty());
                metadata_changed |= list.description != description;
                list.description = description;
            }
            if let Some(visibility) = input.visibility {
                metadata_changed |= list.visibility != visibility;
                list.visibility = visibility;
            }
            if metadata_changed {
                changes.push(PendingChange::new(list.id, ChangeKind::Update));
            }

            if let Some(item_ids) = &input.items {
                check_replacement(conn, list.id, item_ids)?;
                changes.extend(replace_entries(list, item_ids, now));
            }

            Ok(changes)
        })
    }

    /// Turn a list smart (criteria given) or back to manual (`None`)
    pub fn set_criteria(
        &self,
        list_id: ItemId,
        criteria: Option<SmartCriteria>,
        actor: UserId,
    ) -> Result<ListContainer, CatalogError> {
        if let Some(criteria) = &criteria {
            criteria.validate()?;
        }

        self.mutate(list_id, actor, PermissionLevel::Write, None, |_, list, _| {
            list.is_smart = criteria.is_some();
            list.criteria = criteria;
            Ok(vec![PendingChange::new(list.id, ChangeKind::Update)])
        })
    }

    /// Commit a smart list refresh. Fails with `Conflict` when the list
    /// changed since `expected_version` was read.
    ///
    /// Nested lists the owner of `list_id` may not read are dropped, so a
    /// query can never copy another user's private list into this one.
    pub(crate) fn apply_refresh(
        &self,
        list_id: ItemId,
        actor: UserId,
        expected_version: i64,
        item_ids: &[ItemId],
    ) -> Result<ListContainer, CatalogError> {
        let owner = self.load(list_id)?.owner_id;
        let hidden = self.unreadable_lists(owner, item_ids)?;
        if !hidden.is_empty() {
            debug!(list_id, hidden = hidden.len(), "Dropping lists the owner cannot read");
        }

        self.mutate(
            list_id,
            actor,
            PermissionLevel::Read,
            Some(expected_version),
            |conn, list, now| {
                let mut seen = HashSet::new();
                let mut kept = Vec::with_capacity(item_ids.len());
                for id in item_ids {
                    if *id != list.id && !hidden.contains(id) && seen.insert(*id) {
                        kept.push(*id);
                    }
                }
                let missing = items::missing_items(conn, &kept)?;
                if !missing.is_empty() {
                    debug!(list_id = list.id, missing = missing.len(), "Dropping vanished items");
                    kept.retain(|id| !missing.contains(id));
                }

                let mut changes = replace_entries(list, &kept, now);
                list.auto_update_time = Some(now);
                if changes.is_empty() {
                    changes.push(PendingChange::new(list.id, ChangeKind::Update));
                }
                Ok(changes)
            },
        )
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn validate_title(&self, title: &str) -> Result<String, CatalogError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(CatalogError::InvalidInput("title is required".into()));
        }
        if title.chars().count() > self.max_title_length {
            return Err(CatalogError::InvalidInput(format!(
                "title exceeds {} characters",
                self.max_title_length
            )));
        }
        Ok(title.to_string())
    }

    /// Ids among `item_ids` naming lists that `user` may not read
    fn unreadable_lists(
        &self,
        user: UserId,
        item_ids: &[ItemId],
    ) -> Result<HashSet<ItemId>, CatalogError> {
        let nested = self
            .db
            .with_conn(|conn| lists::lists_among(conn, item_ids))?;

        let mut hidden = HashSet::new();
        for list in nested {
            if !self.guard.can_read(user, &list)? {
                hidden.insert(list.id);
            }
        }
        Ok(hidden)
    }

    fn lock_for(&self, list_id: ItemId) -> Arc<Mutex<()>> {
        self.locks
            .entry(list_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one read-modify-write cycle on a list.
    ///
    /// `apply` validates against the connection, edits the in-memory list and
    /// returns the ledger records to write. An empty record set commits nothing.
    fn mutate<F>(
        &self,
        list_id: ItemId,
        actor: UserId,
        access: PermissionLevel,
        expected_version: Option<i64>,
        apply: F,
    ) -> Result<ListContainer, CatalogError>
    where
        F: FnOnce(&Connection, &mut ListContainer, DateTime<Utc>) -> Result<Vec<PendingChange>, CatalogError>,
    {
        let lock = self.lock_for(list_id);
        let _held = lock
            .lock()
            .map_err(|e| CatalogError::Internal(format!("List lock poisoned: {}", e)))?;

        let mut list = self.load(list_id)?;
        match access {
            PermissionLevel::Read => self.guard.require_read(actor, &list)?,
            PermissionLevel::Write => self.guard.require_write(actor, &list)?,
        }

        let read_version = list.version;
        if let Some(expected) = expected_version {
            if expected != read_version {
                return Err(CatalogError::Conflict(format!(
                    "stale list state for list {}",
                    list_id
                )));
            }
        }

        let now = Utc::now();
        let changes = self.db.with_conn(|conn| apply(conn, &mut list, now))?;
        if changes.is_empty() {
            return Ok(list);
        }

        list.normalize_positions(now);
        list.last_modified = now;
        list.modified_by = actor;
        list.check_invariants()?;

        let version = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let version = lists::save_list(&tx, &list, read_version)?;
            ledger::append(&tx, list.id, actor, &changes, now)?;
            tx.commit()?;
            Ok(version)
        })?;
        list.version = version;

        debug!(list_id, actor, version, changes = changes.len(), "Committed list change");
        self.events.emit(CatalogEvent::ListChanged {
            list_id,
            actor,
            version,
            kinds: changes.iter().map(|c| c.kind).collect(),
        });

        Ok(list)
    }
}

/// Reject duplicate or unknown ids in a replacement membership
fn check_replacement(
    conn: &Connection,
    list_id: ItemId,
    item_ids: &[ItemId],
) -> Result<(), CatalogError> {
    let mut seen = HashSet::with_capacity(item_ids.len());
    for id in item_ids {
        if !seen.insert(*id) {
            return Err(CatalogError::InvalidInput(format!("item {} is listed twice", id)));
        }
    }
    if seen.contains(&list_id) {
        return Err(CatalogError::InvalidInput("a list cannot contain itself".into()));
    }

    let missing = items::missing_items(conn, item_ids)?;
    if let Some(first) = missing.first() {
        return Err(CatalogError::NotFound(format!(
            "item {} ({} unknown ids)",
            first,
            missing.len()
        )));
    }
    Ok(())
}

/// Swap in a new membership and return remove/add/update records
fn replace_entries(
    list: &mut ListContainer,
    item_ids: &[ItemId],
    now: DateTime<Utc>,
) -> Vec<PendingChange> {
    let incoming: HashSet<ItemId> = item_ids.iter().copied().collect();
    let mut changes: Vec<PendingChange> = list
        .entries
        .iter()
        .filter(|e| !incoming.contains(&e.item_id))
        .map(|e| PendingChange::new(e.item_id, ChangeKind::Remove))
        .collect();

    let previous = std::mem::take(&mut list.entries);
    for id in item_ids {
        match previous.iter().find(|e| e.item_id == *id) {
            Some(entry) => {
                changes.push(PendingChange::new(*id, ChangeKind::Update));
                list.entries.push(entry.clone());
            }
            None => {
                changes.push(PendingChange::new(*id, ChangeKind::Add));
                list.entries.push(ListEntry {
                    item_id: *id,
                    position: 0,
                    changed_at: now,
                });
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::items::{insert_item, NewItem};
    use crate::models::ItemPayload;

    const OWNER: UserId = 1;

    struct Fixture {
        engine: ListEngine,
        guard: Arc<PermissionGuard>,
        items: Vec<ItemId>,
    }

    fn fixture(n: usize) -> Fixture {
        let db = Arc::new(CatalogDb::open_in_memory().unwrap());
        let payload = ItemPayload::empty_for(ContentType::Movie);
        let items = db
            .with_conn(|conn| {
                (0..n)
                    .map(|i| {
                        let title = format!("Film {}", i);
                        insert_item(
                            conn,
                            &NewItem {
                                content_type: ContentType::Movie,
                                title: &title,
                                year: Some(1990 + i as i32),
                                payload: &payload,
                                owner_id: None,
                            },
                            Utc::now(),
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .unwrap();

        let events = Arc::new(EventBus::new());
        let guard = Arc::new(PermissionGuard::new(db.clone(), db.clone(), events.clone()));
        let engine = ListEngine::new(db, guard.clone(), events, 500);
        Fixture {
            engine,
            guard,
            items,
        }
    }

    fn positions(list: &ListContainer) -> Vec<(ItemId, u32)> {
        list.entries.iter().map(|e| (e.item_id, e.position)).collect()
    }

    #[test]
    fn test_add_remove_reorder_sequence() {
        let f = fixture(3);
        let (a, b, c) = (f.items[0], f.items[1], f.items[2]);
        let list = f.engine.create(OWNER, "Weekend", None).unwrap();

        for id in [a, b, c] {
            f.engine.add_item(list.id, id, OWNER).unwrap();
        }
        let stored = f.engine.get(list.id, OWNER).unwrap();
        assert_eq!(positions(&stored), vec![(a, 0), (b, 1), (c, 2)]);

        let after_remove = f.engine.remove_item(list.id, b, OWNER).unwrap();
        assert_eq!(positions(&after_remove), vec![(a, 0), (c, 1)]);
        assert_eq!(after_remove.item_count, 2);

        let reordered = f.engine.reorder(list.id, &[c, a], OWNER).unwrap();
        assert_eq!(positions(&reordered), vec![(c, 0), (a, 1)]);
        assert_eq!(reordered.version, 5);
    }

    #[test]
    fn test_add_rejections() {
        let f = fixture(1);
        let list = f.engine.create(OWNER, "Once", None).unwrap();
        f.engine.add_item(list.id, f.items[0], OWNER).unwrap();

        let dup = f.engine.add_item(list.id, f.items[0], OWNER).unwrap_err();
        assert!(matches!(dup, CatalogError::InvalidState(_)));

        let unknown = f.engine.add_item(list.id, 9_999, OWNER).unwrap_err();
        assert!(matches!(unknown, CatalogError::NotFound(_)));

        let missing = f.engine.remove_item(list.id, 9_999, OWNER).unwrap_err();
        assert_eq!(missing.to_string(), "Not found: item not found");
    }

    #[test]
    fn test_reorder_mismatch_leaves_list_unchanged() {
        let f = fixture(3);
        let list = f.engine.create(OWNER, "Strict", None).unwrap();
        f.engine.replace_all(list.id, &f.items, OWNER).unwrap();
        let before = f.engine.get(list.id, OWNER).unwrap();

        let (a, b, c) = (f.items[0], f.items[1], f.items[2]);
        for bad in [vec![a, b], vec![a, a, b], vec![a, b, c, 9_999], vec![a, b, 9_999]] {
            let err = f.engine.reorder(list.id, &bad, OWNER).unwrap_err();
            assert!(matches!(err, CatalogError::InvalidState(_)));
        }

        let after = f.engine.get(list.id, OWNER).unwrap();
        assert_eq!(after.item_ids(), before.item_ids());
        assert_eq!(after.version, before.version);
    }

    #[test]
    fn test_remove_at_position_checks_item() {
        let f = fixture(2);
        let list = f.engine.create(OWNER, "Pos", None).unwrap();
        f.engine.replace_all(list.id, &f.items, OWNER).unwrap();

        let err = f
            .engine
            .remove_item_at_position(list.id, f.items[0], 1, OWNER)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid state: position mismatch");

        let list = f
            .engine
            .remove_item_at_position(list.id, f.items[1], 1, OWNER)
            .unwrap();
        assert_eq!(list.item_ids(), vec![f.items[0]]);
    }

    #[test]
    fn test_replace_all_records() {
        let f = fixture(3);
        let (a, b, c) = (f.items[0], f.items[1], f.items[2]);
        let list = f.engine.create(OWNER, "Swap", None).unwrap();
        f.engine.replace_all(list.id, &[a, b], OWNER).unwrap();
        f.engine.replace_all(list.id, &[c, b], OWNER).unwrap();

        let history = f.engine.history(list.id, OWNER).unwrap();
        let second: Vec<_> = history[2..].iter().map(|r| (r.item_id, r.kind)).collect();
        assert_eq!(
            second,
            vec![
                (a, ChangeKind::Remove),
                (c, ChangeKind::Add),
                (b, ChangeKind::Update),
            ]
        );

        let dup = f.engine.replace_all(list.id, &[a, a], OWNER).unwrap_err();
        assert!(matches!(dup, CatalogError::InvalidInput(_)));
        let unknown = f.engine.replace_all(list.id, &[a, 9_999], OWNER).unwrap_err();
        assert!(matches!(unknown, CatalogError::NotFound(_)));
    }

    #[test]
    fn test_update_metadata_and_items() {
        let f = fixture(2);
        let list = f.engine.create(OWNER, "Draft", Some("wip")).unwrap();

        let updated = f
            .engine
            .update(
                list.id,
                UpdateListInput {
                    title: Some("  Final  ".into()),
                    items: Some(vec![f.items[1], f.items[0]]),
                    ..Default::default()
                },
                OWNER,
            )
            .unwrap();
        assert_eq!(updated.title, "Final");
        assert_eq!(updated.description.as_deref(), Some("wip"));
        assert_eq!(updated.item_ids(), vec![f.items[1], f.items[0]]);

        let history = f.engine.history(list.id, OWNER).unwrap();
        assert_eq!(history[0].item_id, list.id);
        assert_eq!(history[0].kind, ChangeKind::Update);

        let err = f
            .engine
            .update(
                list.id,
                UpdateListInput {
                    title: Some("   ".into()),
                    ..Default::default()
                },
                OWNER,
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInput(_)));
    }

    #[test]
    fn test_collaborator_cannot_change_visibility() {
        let f = fixture(0);
        let list = f.engine.create(OWNER, "Mine", None).unwrap();
        f.guard.share_with(OWNER, list.id, 2, "write").unwrap();

        let err = f
            .engine
            .update(
                list.id,
                UpdateListInput {
                    visibility: Some(Visibility::Public),
                    ..Default::default()
                },
                2,
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::PermissionDenied(_)));
    }

    #[test]
    fn test_stale_refresh_commit_conflicts() {
        let f = fixture(2);
        let list = f.engine.create(OWNER, "Race", None).unwrap();
        f.engine.add_item(list.id, f.items[0], OWNER).unwrap();

        let err = f
            .engine
            .apply_refresh(list.id, SYSTEM_ACTOR, list.version, &[f.items[1]])
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));
        assert_eq!(f.engine.get(list.id, OWNER).unwrap().item_ids(), vec![f.items[0]]);
    }

    #[test]
    fn test_refresh_drops_lists_the_owner_cannot_read() {
        let f = fixture(1);
        let other: UserId = 2;
        let secret = f.engine.create(other, "Secret", None).unwrap();
        let open = f
            .engine
            .create_with(
                other,
                CreateListInput {
                    visibility: Visibility::Public,
                    ..CreateListInput::new("Open")
                },
            )
            .unwrap();
        let granted = f.engine.create(other, "Granted", None).unwrap();
        f.guard.share_with(other, granted.id, OWNER, "read").unwrap();

        let mine = f.engine.create(OWNER, "Mine", None).unwrap();
        let refreshed = f
            .engine
            .apply_refresh(
                mine.id,
                OWNER,
                mine.version,
                &[secret.id, open.id, f.items[0], granted.id],
            )
            .unwrap();
        assert_eq!(refreshed.item_ids(), vec![open.id, f.items[0], granted.id]);

        let history = f.engine.history(mine.id, OWNER).unwrap();
        assert!(history.iter().all(|r| r.item_id != secret.id));
    }

    #[test]
    fn test_concurrent_adds_are_all_committed() {
        let f = fixture(16);
        let list_id = f.engine.create(OWNER, "Busy", None).unwrap().id;

        std::thread::scope(|scope| {
            for id in &f.items {
                let engine = &f.engine;
                scope.spawn(move || engine.add_item(list_id, *id, OWNER).unwrap());
            }
        });

        let stored = f.engine.get(list_id, OWNER).unwrap();
        assert_eq!(stored.item_count, 16);
        assert_eq!(stored.version, 16);
        let mut members = stored.item_ids();
        members.sort_unstable();
        assert_eq!(members, f.items);
        for (index, entry) in stored.entries.iter().enumerate() {
            assert_eq!(entry.position as usize, index);
        }
        assert_eq!(f.engine.history(list_id, OWNER).unwrap().len(), 16);
    }

    #[test]
    fn test_find_by_owner_pages_over_readable_lists() {
        let f = fixture(0);
        let viewer: UserId = 5;
        for (title, visibility) in [
            ("a", Visibility::Public),
            ("b", Visibility::Private),
            ("c", Visibility::Public),
            ("d", Visibility::Private),
            ("e", Visibility::Public),
        ] {
            f.engine
                .create_with(
                    OWNER,
                    CreateListInput {
                        visibility,
                        ..CreateListInput::new(title)
                    },
                )
                .unwrap();
        }

        let titles = |limit, offset| -> Vec<String> {
            f.engine
                .find_by_owner(viewer, OWNER, limit, offset)
                .unwrap()
                .into_iter()
                .map(|l| l.title)
                .collect()
        };
        assert_eq!(titles(2, 0).len(), 2);
        assert_eq!(titles(2, 2).len(), 1);
        assert!(titles(2, 3).is_empty());

        let mut seen = titles(2, 0);
        seen.extend(titles(2, 2));
        seen.sort();
        assert_eq!(seen, vec!["a", "c", "e"]);

        assert_eq!(f.engine.find_by_owner(OWNER, OWNER, 10, 0).unwrap().len(), 5);
    }

    #[test]
    fn test_shared_with_lists_granted_lists() {
        let f = fixture(0);
        let friend: UserId = 6;
        let kept = f.engine.create(OWNER, "Kept", None).unwrap();
        let revoked = f.engine.create(OWNER, "Revoked", None).unwrap();
        f.engine.create(OWNER, "Unshared", None).unwrap();

        f.guard.share_with(OWNER, kept.id, friend, "read").unwrap();
        f.guard.share_with(OWNER, revoked.id, friend, "write").unwrap();
        f.guard.remove_collaborator(OWNER, revoked.id, friend).unwrap();

        let shared: Vec<ItemId> = f
            .engine
            .shared_with(friend)
            .unwrap()
            .iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(shared, vec![kept.id]);
        assert!(f.engine.shared_with(OWNER).unwrap().is_empty());
    }

    #[test]
    fn test_title_limits() {
        let f = fixture(0);
        assert!(f.engine.create(OWNER, "", None).is_err());
        assert!(f.engine.create(OWNER, &"x".repeat(501), None).is_err());
        assert!(f.engine.create(OWNER, &"x".repeat(500), None).is_ok());
    }
}
