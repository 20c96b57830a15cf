//! SQLite database module for the catalog, lists and change ledger
//!
//! ## Tables
//!
//! - `items` - Canonical items (title, type, year, payload JSON, owner)
//! - `item_genres` - Genre index for catalog queries
//! - `external_refs` - (source, id) pairs, globally unique
//! - `sync_mappings` - Per-source local ids of an item
//! - `lists` - List-shaped payload of collection/playlist items
//! - `list_entries` - Ordered list membership
//! - `collaborators` - Per-list sharing grants
//! - `change_records` - Append-only ledger, kept independently of lists
//! - `accounts` - User roles

pub mod schema;
pub mod items;
pub mod lists;
pub mod ledger;
pub mod collaborators;
pub mod accounts;
pub mod search;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::CatalogError;

/// SQLite database for catalog items, lists and their history
pub struct CatalogDb {
    conn: Mutex<Connection>,
}

impl CatalogDb {
    /// Open or create the catalog database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, CatalogError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)
            .map_err(|e| CatalogError::Storage(format!("Failed to open SQLite: {}", e)))?;

        // WAL for concurrent readers; foreign keys for list cascades
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| CatalogError::Storage(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory().map_err(|e| {
            CatalogError::Storage(format!("Failed to open in-memory SQLite: {}", e))
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| CatalogError::Storage(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), CatalogError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read with the shared connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&Connection) -> Result<T, CatalogError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CatalogError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CatalogError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| CatalogError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, CatalogError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, CatalogError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                item_count: count("SELECT COUNT(*) FROM items")?,
                list_count: count("SELECT COUNT(*) FROM lists")?,
                entry_count: count("SELECT COUNT(*) FROM list_entries")?,
                external_ref_count: count("SELECT COUNT(*) FROM external_refs")?,
                change_record_count: count("SELECT COUNT(*) FROM change_records")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub item_count: u64,
    pub list_count: u64,
    pub entry_count: u64,
    pub external_ref_count: u64,
    pub change_record_count: u64,
}
