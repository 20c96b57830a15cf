//! Canonical item CRUD and identity lookups

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::CatalogError;
use crate::models::{
    normalize_title, CanonicalItem, ClientSyncMapping, ContentType, ExternalReference, ItemId,
    ItemPayload, SyncOrigin, UserId,
};

/// Item columns as stored, before decoding the type tag and payload
struct ItemRecord {
    id: ItemId,
    content_type: String,
    title: String,
    year: Option<i32>,
    payload_json: String,
    owner_id: Option<UserId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ItemRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            content_type: row.get("content_type")?,
            title: row.get("title")?,
            year: row.get("year")?,
            payload_json: row.get("payload_json")?,
            owner_id: row.get("owner_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn decode(self) -> Result<CanonicalItem, CatalogError> {
        let content_type = ContentType::from_db_str(&self.content_type).ok_or_else(|| {
            CatalogError::Storage(format!(
                "item {} has unknown content type '{}'",
                self.id, self.content_type
            ))
        })?;
        let payload: ItemPayload = serde_json::from_str(&self.payload_json)?;

        Ok(CanonicalItem {
            id: self.id,
            content_type,
            title: self.title,
            year: self.year,
            payload,
            external_refs: vec![],
            sync_mappings: vec![],
            owner_id: self.owner_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Input for inserting an item
#[derive(Debug, Clone)]
pub struct NewItem<'a> {
    pub content_type: ContentType,
    pub title: &'a str,
    pub year: Option<i32>,
    pub payload: &'a ItemPayload,
    pub owner_id: Option<UserId>,
}

/// Insert an item and its genre index rows, returning the new id
pub fn insert_item(
    conn: &Connection,
    item: &NewItem<'_>,
    now: DateTime<Utc>,
) -> Result<ItemId, CatalogError> {
    if !item.payload.matches(item.content_type) {
        return Err(CatalogError::InvalidInput(format!(
            "payload does not match content type '{}'",
            item.content_type
        )));
    }

    let payload_json = serde_json::to_string(item.payload)?;

    conn.execute(
        r#"
        INSERT INTO items (
            content_type, title, normalized_title, year, payload_json,
            rating, owner_id, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            item.content_type.as_str(),
            item.title,
            normalize_title(item.title),
            item.year,
            payload_json,
            item.payload.rating(),
            item.owner_id,
            now,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();

    for genre in item.payload.genres() {
        let genre = genre.trim().to_lowercase();
        if genre.is_empty() {
            continue;
        }
        conn.execute(
            "INSERT OR IGNORE INTO item_genres (item_id, genre) VALUES (?, ?)",
            params![id, genre],
        )?;
    }

    debug!(item_id = id, content_type = %item.content_type, "Inserted item");
    Ok(id)
}

/// Get item by ID with its references and sync mappings
pub fn get_item(conn: &Connection, id: ItemId) -> Result<Option<CanonicalItem>, CatalogError> {
    let record = conn
        .query_row("SELECT * FROM items WHERE id = ?", params![id], |row| {
            ItemRecord::from_row(row)
        })
        .optional()?;

    let mut item = match record {
        Some(r) => r.decode()?,
        None => return Ok(None),
    };

    item.external_refs = get_external_references(conn, id)?;
    item.sync_mappings = get_sync_mappings(conn, id)?;

    Ok(Some(item))
}

pub fn item_exists(conn: &Connection, id: ItemId) -> Result<bool, CatalogError> {
    let found = conn
        .query_row("SELECT 1 FROM items WHERE id = ?", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Ids from `ids` that name no item, in input order
pub fn missing_items(conn: &Connection, ids: &[ItemId]) -> Result<Vec<ItemId>, CatalogError> {
    let mut missing = vec![];
    for id in ids {
        if !item_exists(conn, *id)? {
            missing.push(*id);
        }
    }
    Ok(missing)
}

fn get_external_references(
    conn: &Connection,
    item_id: ItemId,
) -> Result<Vec<ExternalReference>, CatalogError> {
    let mut stmt = conn.prepare(
        "SELECT source, external_id FROM external_refs WHERE item_id = ? ORDER BY rowid",
    )?;

    let refs = stmt
        .query_map(params![item_id], |row| {
            Ok(ExternalReference {
                source: row.get(0)?,
                id: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(refs)
}

fn get_sync_mappings(
    conn: &Connection,
    item_id: ItemId,
) -> Result<Vec<ClientSyncMapping>, CatalogError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT source_id, source_content_type, local_id, updated_at
        FROM sync_mappings WHERE item_id = ? ORDER BY source_id
        "#,
    )?;

    let mappings = stmt
        .query_map(params![item_id], |row| {
            Ok(ClientSyncMapping {
                source_id: row.get(0)?,
                source_content_type: row.get(1)?,
                local_id: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(mappings)
}

/// Item currently owning an external reference
pub fn find_by_external_reference(
    conn: &Connection,
    reference: &ExternalReference,
) -> Result<Option<ItemId>, CatalogError> {
    let id = conn
        .query_row(
            "SELECT item_id FROM external_refs WHERE source = ? AND external_id = ?",
            params![reference.source, reference.id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Catalog items (never user lists) matching type, normalized title and year
pub fn find_by_fingerprint(
    conn: &Connection,
    content_type: ContentType,
    normalized_title: &str,
    year: i32,
) -> Result<Vec<ItemId>, CatalogError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id FROM items
        WHERE content_type = ? AND normalized_title = ? AND year = ? AND owner_id IS NULL
        ORDER BY id
        "#,
    )?;

    let ids = stmt
        .query_map(params![content_type.as_str(), normalized_title, year], |row| {
            row.get(0)
        })?
        .collect::<Result<Vec<ItemId>, _>>()?;

    Ok(ids)
}

/// Attach a reference unless some item already owns it. Returns whether a row was written.
pub fn attach_external_reference(
    conn: &Connection,
    item_id: ItemId,
    reference: &ExternalReference,
    now: DateTime<Utc>,
) -> Result<bool, CatalogError> {
    let changes = conn.execute(
        r#"
        INSERT OR IGNORE INTO external_refs (item_id, source, external_id, attached_at)
        VALUES (?, ?, ?, ?)
        "#,
        params![item_id, reference.source, reference.id, now],
    )?;
    Ok(changes > 0)
}

/// Insert or overwrite the mapping for the origin's source
pub fn upsert_sync_mapping(
    conn: &Connection,
    item_id: ItemId,
    origin: &SyncOrigin,
    now: DateTime<Utc>,
) -> Result<(), CatalogError> {
    conn.execute(
        r#"
        INSERT INTO sync_mappings (item_id, source_id, source_content_type, local_id, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (item_id, source_id) DO UPDATE SET
            source_content_type = excluded.source_content_type,
            local_id = excluded.local_id,
            updated_at = excluded.updated_at
        "#,
        params![
            item_id,
            origin.source_id,
            origin.source_content_type,
            origin.local_id,
            now
        ],
    )?;
    Ok(())
}

/// Rename an item (used for list titles)
pub fn update_title(
    conn: &Connection,
    id: ItemId,
    title: &str,
    now: DateTime<Utc>,
) -> Result<(), CatalogError> {
    conn.execute(
        "UPDATE items SET title = ?, normalized_title = ?, updated_at = ? WHERE id = ?",
        params![title, normalize_title(title), now, id],
    )?;
    Ok(())
}

/// Delete an item; references, mappings and list rows cascade
pub fn delete_item(conn: &Connection, id: ItemId) -> Result<bool, CatalogError> {
    let changes = conn.execute("DELETE FROM items WHERE id = ?", params![id])?;
    Ok(changes > 0)
}
