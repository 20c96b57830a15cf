//! List container persistence
//!
//! A list is an `items` row (title, type, owner) plus a `lists` row carrying
//! the list-shaped payload, with membership in `list_entries`. Writes go
//! through [`save_list`], which compares the stored version before touching
//! anything so a stale read can never overwrite a newer commit.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::items::{self, NewItem};
use crate::error::CatalogError;
use crate::models::{
    ContentType, ItemId, ItemPayload, ListContainer, ListEntry, SmartCriteria, UserId, Visibility,
};

const LIST_COLUMNS: &str = r#"
    i.id, i.content_type, i.title, i.created_at,
    l.description, l.owner_id, l.visibility, l.is_smart, l.criteria_json,
    l.auto_update_time, l.last_modified, l.modified_by, l.item_count, l.version
"#;

struct ListRecord {
    id: ItemId,
    content_type: String,
    title: String,
    created_at: DateTime<Utc>,
    description: Option<String>,
    owner_id: UserId,
    visibility: String,
    is_smart: bool,
    criteria_json: Option<String>,
    auto_update_time: Option<DateTime<Utc>>,
    last_modified: DateTime<Utc>,
    modified_by: UserId,
    item_count: i64,
    version: i64,
}

impl ListRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            content_type: row.get("content_type")?,
            title: row.get("title")?,
            created_at: row.get("created_at")?,
            description: row.get("description")?,
            owner_id: row.get("owner_id")?,
            visibility: row.get("visibility")?,
            is_smart: row.get("is_smart")?,
            criteria_json: row.get("criteria_json")?,
            auto_update_time: row.get("auto_update_time")?,
            last_modified: row.get("last_modified")?,
            modified_by: row.get("modified_by")?,
            item_count: row.get("item_count")?,
            version: row.get("version")?,
        })
    }

    fn decode(self) -> Result<ListContainer, CatalogError> {
        let content_type = ContentType::from_db_str(&self.content_type)
            .filter(|ct| ct.is_list())
            .ok_or_else(|| {
                CatalogError::Storage(format!(
                    "list {} has non-list content type '{}'",
                    self.id, self.content_type
                ))
            })?;
        let visibility = Visibility::from_db_str(&self.visibility).ok_or_else(|| {
            CatalogError::Storage(format!(
                "list {} has unknown visibility '{}'",
                self.id, self.visibility
            ))
        })?;
        let criteria = match self.criteria_json {
            Some(json) => Some(serde_json::from_str::<SmartCriteria>(&json)?),
            None => None,
        };

        Ok(ListContainer {
            id: self.id,
            content_type,
            title: self.title,
            description: self.description,
            owner_id: self.owner_id,
            visibility,
            entries: vec![],
            item_count: self.item_count as u32,
            is_smart: self.is_smart,
            criteria,
            auto_update_time: self.auto_update_time,
            last_modified: self.last_modified,
            modified_by: self.modified_by,
            collaborators: BTreeSet::new(),
            version: self.version,
            created_at: self.created_at,
        })
    }
}

/// Input for inserting a list
#[derive(Debug, Clone)]
pub struct NewList<'a> {
    pub content_type: ContentType,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub owner_id: UserId,
    pub visibility: Visibility,
    pub criteria: Option<&'a SmartCriteria>,
}

/// Insert the item and list rows of a new, empty list. Run inside a transaction.
pub fn insert_list(
    conn: &Connection,
    list: &NewList<'_>,
    now: DateTime<Utc>,
) -> Result<ItemId, CatalogError> {
    if !list.content_type.is_list() {
        return Err(CatalogError::InvalidInput(format!(
            "content type '{}' cannot hold entries",
            list.content_type
        )));
    }

    let payload = ItemPayload::List;
    let id = items::insert_item(
        conn,
        &NewItem {
            content_type: list.content_type,
            title: list.title,
            year: None,
            payload: &payload,
            owner_id: Some(list.owner_id),
        },
        now,
    )?;

    let criteria_json = list.criteria.map(serde_json::to_string).transpose()?;

    conn.execute(
        r#"
        INSERT INTO lists (
            item_id, description, owner_id, visibility, is_smart, criteria_json,
            auto_update_time, last_modified, modified_by, item_count, version
        ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, 0, 0)
        "#,
        params![
            id,
            list.description,
            list.owner_id,
            list.visibility.as_str(),
            list.criteria.is_some(),
            criteria_json,
            now,
            list.owner_id,
        ],
    )?;

    Ok(id)
}

/// Get a list with its ordered entries and cached collaborator ids
pub fn get_list(conn: &Connection, id: ItemId) -> Result<Option<ListContainer>, CatalogError> {
    let sql = format!(
        "SELECT {} FROM lists l JOIN items i ON i.id = l.item_id WHERE l.item_id = ?",
        LIST_COLUMNS
    );
    let record = conn
        .query_row(&sql, params![id], |row| ListRecord::from_row(row))
        .optional()?;

    match record {
        Some(r) => {
            let mut list = r.decode()?;
            load_members(conn, &mut list)?;
            Ok(Some(list))
        }
        None => Ok(None),
    }
}

fn load_members(conn: &Connection, list: &mut ListContainer) -> Result<(), CatalogError> {
    let mut stmt = conn.prepare(
        "SELECT item_id, position, changed_at FROM list_entries WHERE list_id = ? ORDER BY position",
    )?;
    list.entries = stmt
        .query_map(params![list.id], |row| {
            let position: i64 = row.get(1)?;
            Ok(ListEntry {
                item_id: row.get(0)?,
                position: position as u32,
                changed_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare("SELECT user_id FROM collaborators WHERE list_id = ?")?;
    list.collaborators = stmt
        .query_map(params![list.id], |row| row.get::<_, UserId>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(())
}

/// Persist a full list state if the stored version still equals `expected_version`.
///
/// Rewrites the list row, title and every entry. Must run inside a transaction
/// so a failed entry insert rolls the version bump back. Returns the new version.
pub fn save_list(
    conn: &Connection,
    list: &ListContainer,
    expected_version: i64,
) -> Result<i64, CatalogError> {
    let criteria_json = list.criteria.as_ref().map(serde_json::to_string).transpose()?;

    let changes = conn.execute(
        r#"
        UPDATE lists SET
            description = ?, visibility = ?, is_smart = ?, criteria_json = ?,
            auto_update_time = ?, last_modified = ?, modified_by = ?,
            item_count = ?, version = version + 1
        WHERE item_id = ? AND version = ?
        "#,
        params![
            list.description,
            list.visibility.as_str(),
            list.is_smart,
            criteria_json,
            list.auto_update_time,
            list.last_modified,
            list.modified_by,
            list.entries.len() as i64,
            list.id,
            expected_version,
        ],
    )?;

    if changes == 0 {
        return Err(stale_or_missing(conn, list.id)?);
    }

    items::update_title(conn, list.id, &list.title, list.last_modified)?;

    conn.execute("DELETE FROM list_entries WHERE list_id = ?", params![list.id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO list_entries (list_id, item_id, position, changed_at) VALUES (?, ?, ?, ?)",
    )?;
    for entry in &list.entries {
        stmt.execute(params![list.id, entry.item_id, entry.position as i64, entry.changed_at])?;
    }

    Ok(expected_version + 1)
}

/// Change only the visibility of a list, with the same version check as [`save_list`]
pub fn set_visibility(
    conn: &Connection,
    id: ItemId,
    visibility: Visibility,
    actor: UserId,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<i64, CatalogError> {
    let changes = conn.execute(
        r#"
        UPDATE lists SET
            visibility = ?, last_modified = ?, modified_by = ?, version = version + 1
        WHERE item_id = ? AND version = ?
        "#,
        params![visibility.as_str(), now, actor, id, expected_version],
    )?;

    if changes == 0 {
        return Err(stale_or_missing(conn, id)?);
    }
    Ok(expected_version + 1)
}

fn stale_or_missing(conn: &Connection, id: ItemId) -> Result<CatalogError, CatalogError> {
    let exists = conn
        .query_row("SELECT 1 FROM lists WHERE item_id = ?", params![id], |_| Ok(()))
        .optional()?
        .is_some();
    Ok(if exists {
        CatalogError::Conflict(format!("stale list state for list {}", id))
    } else {
        CatalogError::NotFound(format!("list {}", id))
    })
}

/// Delete a list; entries and collaborators cascade, ledger rows stay
pub fn delete_list(conn: &Connection, id: ItemId) -> Result<bool, CatalogError> {
    let is_list = conn
        .query_row("SELECT 1 FROM lists WHERE item_id = ?", params![id], |_| Ok(()))
        .optional()?
        .is_some();
    if !is_list {
        return Ok(false);
    }
    items::delete_item(conn, id)
}

/// Lists owned by a user, most recently modified first
pub fn find_by_owner(
    conn: &Connection,
    owner_id: UserId,
    limit: u32,
    offset: u32,
) -> Result<Vec<ListContainer>, CatalogError> {
    let sql = format!(
        r#"
        SELECT {} FROM lists l JOIN items i ON i.id = l.item_id
        WHERE l.owner_id = ?
        ORDER BY l.last_modified DESC, l.item_id DESC
        LIMIT ? OFFSET ?
        "#,
        LIST_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params![owner_id, limit as i64, offset as i64], |row| {
            ListRecord::from_row(row)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut lists = Vec::with_capacity(records.len());
    for record in records {
        let mut list = record.decode()?;
        load_members(conn, &mut list)?;
        lists.push(list);
    }
    Ok(lists)
}

/// Ids of lists owned by a user, in the same order as [`find_by_owner`]
pub fn find_ids_by_owner(conn: &Connection, owner_id: UserId) -> Result<Vec<ItemId>, CatalogError> {
    let mut stmt = conn.prepare(
        "SELECT item_id FROM lists WHERE owner_id = ? ORDER BY last_modified DESC, item_id DESC",
    )?;
    let ids = stmt
        .query_map(params![owner_id], |row| row.get(0))?
        .collect::<Result<Vec<ItemId>, _>>()?;
    Ok(ids)
}

/// The entries of `ids` that are themselves lists, loaded, in input order
pub fn lists_among(conn: &Connection, ids: &[ItemId]) -> Result<Vec<ListContainer>, CatalogError> {
    let mut found = vec![];
    for id in ids {
        if let Some(list) = get_list(conn, *id)? {
            found.push(list);
        }
    }
    Ok(found)
}

/// Smart lists never refreshed, or last refreshed before `cutoff`
pub fn find_smart_lists_due(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ItemId>, CatalogError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT item_id FROM lists
        WHERE is_smart = 1 AND (auto_update_time IS NULL OR auto_update_time < ?)
        ORDER BY item_id
        "#,
    )?;
    let ids = stmt
        .query_map(params![cutoff], |row| row.get(0))?
        .collect::<Result<Vec<ItemId>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CatalogDb;

    fn seed_items(conn: &Connection, n: usize) -> Result<Vec<ItemId>, CatalogError> {
        let payload = ItemPayload::empty_for(ContentType::Track);
        (0..n)
            .map(|i| {
                let title = format!("Track {}", i);
                items::insert_item(
                    conn,
                    &NewItem {
                        content_type: ContentType::Track,
                        title: &title,
                        year: Some(2000),
                        payload: &payload,
                        owner_id: None,
                    },
                    Utc::now(),
                )
            })
            .collect()
    }

    fn new_list(owner_id: UserId) -> NewList<'static> {
        NewList {
            content_type: ContentType::Playlist,
            title: "Mix",
            description: Some("late night"),
            owner_id,
            visibility: Visibility::Private,
            criteria: None,
        }
    }

    #[test]
    fn test_insert_and_get_list() {
        let db = CatalogDb::open_in_memory().unwrap();
        let list = db
            .with_conn(|conn| {
                let id = insert_list(conn, &new_list(3), Utc::now())?;
                get_list(conn, id)
            })
            .unwrap()
            .unwrap();

        assert_eq!(list.title, "Mix");
        assert_eq!(list.owner_id, 3);
        assert_eq!(list.item_count, 0);
        assert_eq!(list.version, 0);
        assert!(!list.is_smart);
    }

    #[test]
    fn test_save_list_bumps_version_and_rejects_stale_writes() {
        let db = CatalogDb::open_in_memory().unwrap();
        db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ids = seed_items(&tx, 2)?;
            let list_id = insert_list(&tx, &new_list(3), Utc::now())?;
            let mut list = get_list(&tx, list_id)?.unwrap();

            let now = Utc::now();
            for id in &ids {
                list.entries.push(ListEntry {
                    item_id: *id,
                    position: 0,
                    changed_at: now,
                });
            }
            list.normalize_positions(now);

            assert_eq!(save_list(&tx, &list, 0)?, 1);
            let stale = save_list(&tx, &list, 0);
            assert!(matches!(stale, Err(CatalogError::Conflict(_))));

            let stored = get_list(&tx, list_id)?.unwrap();
            assert_eq!(stored.version, 1);
            assert_eq!(stored.item_ids(), ids);
            assert_eq!(stored.item_count, 2);
            tx.commit()?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_list_cascades_entries() {
        let db = CatalogDb::open_in_memory().unwrap();
        db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ids = seed_items(&tx, 1)?;
            let list_id = insert_list(&tx, &new_list(3), Utc::now())?;
            let mut list = get_list(&tx, list_id)?.unwrap();
            list.entries.push(ListEntry {
                item_id: ids[0],
                position: 0,
                changed_at: Utc::now(),
            });
            list.normalize_positions(Utc::now());
            save_list(&tx, &list, 0)?;

            assert!(delete_list(&tx, list_id)?);
            assert!(!delete_list(&tx, list_id)?);
            assert!(!delete_list(&tx, ids[0])?);

            let entries: i64 =
                tx.query_row("SELECT COUNT(*) FROM list_entries", [], |r| r.get(0))?;
            assert_eq!(entries, 0);
            tx.commit()?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_find_smart_lists_due() {
        let db = CatalogDb::open_in_memory().unwrap();
        let criteria = SmartCriteria::default();
        let due = db
            .with_conn(|conn| {
                let smart = NewList {
                    criteria: Some(&criteria),
                    ..new_list(3)
                };
                let smart_id = insert_list(conn, &smart, Utc::now())?;
                insert_list(conn, &new_list(3), Utc::now())?;
                let due = find_smart_lists_due(conn, Utc::now())?;
                assert_eq!(due, vec![smart_id]);
                Ok(due)
            })
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_lists_among_skips_plain_items() {
        let db = CatalogDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let tracks = seed_items(conn, 2)?;
            let list_id = insert_list(conn, &new_list(3), Utc::now())?;

            let found = lists_among(conn, &[tracks[0], list_id, tracks[1], 9_999])?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].id, list_id);
            assert_eq!(find_ids_by_owner(conn, 3)?, vec![list_id]);
            Ok(())
        })
        .unwrap();
    }
}
