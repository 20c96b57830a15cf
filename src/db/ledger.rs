//! Change ledger rows
//!
//! Insert and select only. Nothing in this module updates or deletes a row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::error::CatalogError;
use crate::models::{ChangeKind, ChangeRecord, ItemId, PendingChange, UserId};

/// Ledger columns as stored, before decoding the kind tag
struct RecordRow {
    seq: i64,
    entity_id: ItemId,
    actor: UserId,
    item_id: ItemId,
    kind: String,
    recorded_at: DateTime<Utc>,
}

impl RecordRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get("seq")?,
            entity_id: row.get("entity_id")?,
            actor: row.get("actor")?,
            item_id: row.get("item_id")?,
            kind: row.get("kind")?,
            recorded_at: row.get("recorded_at")?,
        })
    }
}

fn decode(rows: Vec<RecordRow>) -> Result<Vec<ChangeRecord>, CatalogError> {
    rows.into_iter()
        .map(|row| {
            let kind = ChangeKind::from_db_str(&row.kind).ok_or_else(|| {
                CatalogError::Storage(format!(
                    "change record {} has unknown kind '{}'",
                    row.seq, row.kind
                ))
            })?;
            Ok(ChangeRecord {
                seq: row.seq,
                entity_id: row.entity_id,
                actor: row.actor,
                item_id: row.item_id,
                kind,
                recorded_at: row.recorded_at,
            })
        })
        .collect()
}

/// Append records for one entity, in order, returning them with their sequence numbers
pub fn append(
    conn: &Connection,
    entity_id: ItemId,
    actor: UserId,
    changes: &[PendingChange],
    now: DateTime<Utc>,
) -> Result<Vec<ChangeRecord>, CatalogError> {
    let mut stmt = conn.prepare(
        r#"
        INSERT INTO change_records (entity_id, actor, item_id, kind, recorded_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )?;

    let mut written = Vec::with_capacity(changes.len());
    for change in changes {
        stmt.execute(params![entity_id, actor, change.item_id, change.kind.as_str(), now])?;
        written.push(ChangeRecord {
            seq: conn.last_insert_rowid(),
            entity_id,
            actor,
            item_id: change.item_id,
            kind: change.kind,
            recorded_at: now,
        });
    }

    Ok(written)
}

/// Full history of an entity in append order
pub fn history(conn: &Connection, entity_id: ItemId) -> Result<Vec<ChangeRecord>, CatalogError> {
    let mut stmt =
        conn.prepare("SELECT * FROM change_records WHERE entity_id = ? ORDER BY seq")?;
    let rows = stmt
        .query_map(params![entity_id], RecordRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    decode(rows)
}

/// History of one item within an entity
pub fn history_for_item(
    conn: &Connection,
    entity_id: ItemId,
    item_id: ItemId,
) -> Result<Vec<ChangeRecord>, CatalogError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM change_records WHERE entity_id = ? AND item_id = ? ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![entity_id, item_id], RecordRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    decode(rows)
}

/// Records appended at or after `since`
pub fn history_since(
    conn: &Connection,
    entity_id: ItemId,
    since: DateTime<Utc>,
) -> Result<Vec<ChangeRecord>, CatalogError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM change_records WHERE entity_id = ? AND recorded_at >= ? ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![entity_id, since], RecordRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    decode(rows)
}
