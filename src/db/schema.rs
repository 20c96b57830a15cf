//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::CatalogError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), CatalogError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, CatalogError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| CatalogError::Storage(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), CatalogError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| CatalogError::Storage(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| CatalogError::Storage(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), CatalogError> {
    conn.execute_batch(CATALOG_SCHEMA)
        .map_err(|e| CatalogError::Storage(format!("Failed to create catalog tables: {}", e)))?;

    conn.execute_batch(LISTS_SCHEMA)
        .map_err(|e| CatalogError::Storage(format!("Failed to create list tables: {}", e)))?;

    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| CatalogError::Storage(format!("Failed to create ledger tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| CatalogError::Storage(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), CatalogError> {
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)
}

/// Canonical items and their identity links
const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_type TEXT NOT NULL,
    title TEXT NOT NULL,
    normalized_title TEXT NOT NULL,
    year INTEGER,
    payload_json TEXT NOT NULL,
    rating REAL,
    owner_id INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS item_genres (
    item_id INTEGER NOT NULL,
    genre TEXT NOT NULL,
    PRIMARY KEY (item_id, genre),
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
);

-- One item per (source, external_id) across the whole catalog
CREATE TABLE IF NOT EXISTS external_refs (
    item_id INTEGER NOT NULL,
    source TEXT NOT NULL,
    external_id TEXT NOT NULL,
    attached_at TEXT NOT NULL,
    UNIQUE (source, external_id),
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS sync_mappings (
    item_id INTEGER NOT NULL,
    source_id TEXT NOT NULL,
    source_content_type TEXT NOT NULL,
    local_id TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (item_id, source_id),
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS accounts (
    user_id INTEGER PRIMARY KEY NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    updated_at TEXT NOT NULL
);
"#;

/// List payload, membership and sharing
const LISTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lists (
    item_id INTEGER PRIMARY KEY NOT NULL,
    description TEXT,
    owner_id INTEGER NOT NULL,
    visibility TEXT NOT NULL DEFAULT 'private',
    is_smart INTEGER NOT NULL DEFAULT 0,
    criteria_json TEXT,
    auto_update_time TEXT,
    last_modified TEXT NOT NULL,
    modified_by INTEGER NOT NULL,
    item_count INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS list_entries (
    list_id INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    changed_at TEXT NOT NULL,
    PRIMARY KEY (list_id, item_id),
    UNIQUE (list_id, position),
    FOREIGN KEY (list_id) REFERENCES lists(item_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS collaborators (
    list_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    level TEXT NOT NULL,
    granted_by INTEGER NOT NULL,
    granted_at TEXT NOT NULL,
    PRIMARY KEY (list_id, user_id),
    FOREIGN KEY (list_id) REFERENCES lists(item_id) ON DELETE CASCADE
);
"#;

/// Ledger rows outlive the entities they describe, so no foreign keys here
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    actor INTEGER NOT NULL,
    item_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_items_fingerprint ON items(content_type, normalized_title, year);
CREATE INDEX IF NOT EXISTS idx_items_owner ON items(owner_id);
CREATE INDEX IF NOT EXISTS idx_item_genres_genre ON item_genres(genre);
CREATE INDEX IF NOT EXISTS idx_external_refs_item ON external_refs(item_id);
CREATE INDEX IF NOT EXISTS idx_lists_owner ON lists(owner_id);
CREATE INDEX IF NOT EXISTS idx_list_entries_item ON list_entries(item_id);
CREATE INDEX IF NOT EXISTS idx_collaborators_user ON collaborators(user_id);
CREATE INDEX IF NOT EXISTS idx_change_records_entity ON change_records(entity_id, seq);
"#;
