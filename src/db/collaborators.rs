//! Collaborator grants per list

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::CatalogError;
use crate::models::{Collaborator, ItemId, PermissionLevel, UserId};

struct CollaboratorRow {
    list_id: ItemId,
    user_id: UserId,
    level: String,
    granted_by: UserId,
    granted_at: DateTime<Utc>,
}

impl CollaboratorRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            list_id: row.get("list_id")?,
            user_id: row.get("user_id")?,
            level: row.get("level")?,
            granted_by: row.get("granted_by")?,
            granted_at: row.get("granted_at")?,
        })
    }

    fn decode(self) -> Result<Collaborator, CatalogError> {
        let level = self.level.parse::<PermissionLevel>().map_err(|_| {
            CatalogError::Storage(format!(
                "collaborator row for list {} has unknown level '{}'",
                self.list_id, self.level
            ))
        })?;
        Ok(Collaborator {
            list_id: self.list_id,
            user_id: self.user_id,
            level,
            granted_by: self.granted_by,
            granted_at: self.granted_at,
        })
    }
}

/// Insert a grant, or update level and timestamp of the existing one
pub fn upsert(
    conn: &Connection,
    list_id: ItemId,
    user_id: UserId,
    level: PermissionLevel,
    granted_by: UserId,
    now: DateTime<Utc>,
) -> Result<Collaborator, CatalogError> {
    conn.execute(
        r#"
        INSERT INTO collaborators (list_id, user_id, level, granted_by, granted_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (list_id, user_id) DO UPDATE SET
            level = excluded.level,
            granted_by = excluded.granted_by,
            granted_at = excluded.granted_at
        "#,
        params![list_id, user_id, level.as_str(), granted_by, now],
    )?;

    Ok(Collaborator {
        list_id,
        user_id,
        level,
        granted_by,
        granted_at: now,
    })
}

pub fn get(
    conn: &Connection,
    list_id: ItemId,
    user_id: UserId,
) -> Result<Option<Collaborator>, CatalogError> {
    let row = conn
        .query_row(
            "SELECT * FROM collaborators WHERE list_id = ? AND user_id = ?",
            params![list_id, user_id],
            CollaboratorRow::from_row,
        )
        .optional()?;
    row.map(CollaboratorRow::decode).transpose()
}

pub fn list_for(conn: &Connection, list_id: ItemId) -> Result<Vec<Collaborator>, CatalogError> {
    let mut stmt =
        conn.prepare("SELECT * FROM collaborators WHERE list_id = ? ORDER BY granted_at, user_id")?;
    let rows = stmt
        .query_map(params![list_id], CollaboratorRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(CollaboratorRow::decode).collect()
}

/// Remove a grant. Returns false when there was none.
pub fn remove(conn: &Connection, list_id: ItemId, user_id: UserId) -> Result<bool, CatalogError> {
    let changes = conn.execute(
        "DELETE FROM collaborators WHERE list_id = ? AND user_id = ?",
        params![list_id, user_id],
    )?;
    Ok(changes > 0)
}

/// Lists a user has been granted access to
pub fn lists_shared_with(conn: &Connection, user_id: UserId) -> Result<Vec<ItemId>, CatalogError> {
    let mut stmt =
        conn.prepare("SELECT list_id FROM collaborators WHERE user_id = ? ORDER BY list_id")?;
    let ids = stmt
        .query_map(params![user_id], |row| row.get(0))?
        .collect::<Result<Vec<ItemId>, _>>()?;
    Ok(ids)
}
