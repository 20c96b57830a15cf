//! Change ledger service
//!
//! Read side of the append-only history plus a standalone append for
//! changes made outside a list commit. The list engine writes its records
//! through [`crate::db::ledger::append`] inside its own transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::{ledger, CatalogDb};
use crate::error::CatalogError;
use crate::models::{ChangeKind, ChangeRecord, ItemId, PendingChange, UserId};

pub struct ChangeLedger {
    db: Arc<CatalogDb>,
}

impl ChangeLedger {
    pub fn new(db: Arc<CatalogDb>) -> Self {
        Self { db }
    }

    /// Append one record and return it as stored
    pub fn append(
        &self,
        entity_id: ItemId,
        actor: UserId,
        item_id: ItemId,
        kind: ChangeKind,
    ) -> Result<ChangeRecord, CatalogError> {
        let written = self.db.with_conn(|conn| {
            ledger::append(
                conn,
                entity_id,
                actor,
                &[PendingChange::new(item_id, kind)],
                Utc::now(),
            )
        })?;

        written
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::Internal("ledger append wrote no record".into()))
    }

    /// All records of an entity in sequence order
    pub fn history(&self, entity_id: ItemId) -> Result<Vec<ChangeRecord>, CatalogError> {
        self.db.with_conn(|conn| ledger::history(conn, entity_id))
    }

    pub fn history_for_item(
        &self,
        entity_id: ItemId,
        item_id: ItemId,
    ) -> Result<Vec<ChangeRecord>, CatalogError> {
        self.db
            .with_conn(|conn| ledger::history_for_item(conn, entity_id, item_id))
    }

    pub fn since(
        &self,
        entity_id: ItemId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, CatalogError> {
        self.db
            .with_conn(|conn| ledger::history_since(conn, entity_id, since))
    }
}
