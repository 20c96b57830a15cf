//! Identity resolver - maps raw items from external sources to canonical items
//!
//! Matching order:
//! 1. External references, most authoritative source first
//! 2. (content type, normalized title, year) among catalog items
//! 3. Otherwise a new canonical item seeded with the supplied references
//!
//! Each resolution runs in one transaction. References are attached to the
//! matched item only when no other item owns them, and the originating
//! source's sync mapping is always written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{items, CatalogDb};
use crate::error::CatalogError;
use crate::models::{
    normalize_title, CanonicalItem, ContentType, ExternalReference, ItemId, ItemPayload,
    SyncOrigin,
};

use super::events::{CatalogEvent, EventBus};

/// An item as described by an external source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub content_type: ContentType,
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub external_refs: Vec<ExternalReference>,
    #[serde(default)]
    pub payload: Option<ItemPayload>,
    pub origin: SyncOrigin,
}

/// How a raw item was matched
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum MatchedBy {
    ExternalReference { reference: ExternalReference },
    Metadata,
    Created,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub item: CanonicalItem,
    pub created: bool,
    pub matched_by: MatchedBy,
}

/// Outcome of one item in a batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemOutcome {
    pub index: usize,
    pub item_id: Option<ItemId>,
    pub created: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResolveResult {
    pub resolved: usize,
    pub created: usize,
    pub failed: usize,
    pub outcomes: Vec<BatchItemOutcome>,
}

pub struct IdentityResolver {
    db: Arc<CatalogDb>,
    events: Arc<EventBus>,
    source_preference: Vec<String>,
}

impl IdentityResolver {
    pub fn new(db: Arc<CatalogDb>, events: Arc<EventBus>, source_preference: Vec<String>) -> Self {
        let source_preference = source_preference
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .collect();
        Self {
            db,
            events,
            source_preference,
        }
    }

    /// Resolve a raw item to its canonical item, creating one on first sighting
    pub fn resolve(&self, raw: &RawItem) -> Result<CanonicalItem, CatalogError> {
        Ok(self.resolve_detailed(raw)?.item)
    }

    pub fn resolve_detailed(&self, raw: &RawItem) -> Result<Resolution, CatalogError> {
        let payload = validate(raw)?;
        let references = self.ordered_references(&raw.external_refs);
        let now = Utc::now();

        let resolution = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let (item_id, matched_by) = match find_match(&tx, raw, &references)? {
                Some(found) => found,
                None => {
                    let id = insert_canonical(&tx, raw, &payload, now)?;
                    (id, MatchedBy::Created)
                }
            };

            attach_free_references(&tx, item_id, &references, now)?;
            items::upsert_sync_mapping(&tx, item_id, &raw.origin, now)?;

            let item = items::get_item(&tx, item_id)?.ok_or_else(|| {
                CatalogError::Internal(format!("item {} vanished during resolution", item_id))
            })?;
            tx.commit()?;

            let created = matched_by == MatchedBy::Created;
            Ok(Resolution {
                item,
                created,
                matched_by,
            })
        })?;

        debug!(
            item_id = resolution.item.id,
            created = resolution.created,
            source = %raw.origin.source_id,
            "Resolved item"
        );
        self.emit_resolved(&resolution, raw);

        Ok(resolution)
    }

    /// Force a new canonical item, for callers that chose to split an
    /// ambiguous or insufficient match
    pub fn create_unlinked(&self, raw: &RawItem) -> Result<CanonicalItem, CatalogError> {
        let payload = validate(raw)?;
        if raw.title.trim().is_empty() {
            return Err(CatalogError::InvalidInput("title is required".into()));
        }
        let references = self.ordered_references(&raw.external_refs);
        let now = Utc::now();

        let item = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let id = insert_canonical(&tx, raw, &payload, now)?;
            attach_free_references(&tx, id, &references, now)?;
            items::upsert_sync_mapping(&tx, id, &raw.origin, now)?;
            let item = items::get_item(&tx, id)?.ok_or_else(|| {
                CatalogError::Internal(format!("item {} vanished after insert", id))
            })?;
            tx.commit()?;
            Ok(item)
        })?;

        info!(item_id = item.id, title = %item.title, "Created unlinked item");
        self.events.emit(CatalogEvent::ItemResolved {
            item_id: item.id,
            created: true,
            source_id: raw.origin.source_id.clone(),
        });

        Ok(item)
    }

    /// Resolve many raw items; failures are reported per item and do not stop the batch
    pub fn resolve_batch(&self, raws: &[RawItem]) -> BatchResolveResult {
        let mut result = BatchResolveResult::default();

        for (index, raw) in raws.iter().enumerate() {
            match self.resolve_detailed(raw) {
                Ok(resolution) => {
                    if resolution.created {
                        result.created += 1;
                    } else {
                        result.resolved += 1;
                    }
                    result.outcomes.push(BatchItemOutcome {
                        index,
                        item_id: Some(resolution.item.id),
                        created: resolution.created,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(index, title = %raw.title, error = %e, "Failed to resolve item");
                    result.failed += 1;
                    result.outcomes.push(BatchItemOutcome {
                        index,
                        item_id: None,
                        created: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(
            resolved = result.resolved,
            created = result.created,
            failed = result.failed,
            "Batch resolution complete"
        );
        result
    }

    /// Fetch the item owning a reference, without creating anything
    pub fn lookup(
        &self,
        reference: &ExternalReference,
    ) -> Result<Option<CanonicalItem>, CatalogError> {
        let reference = reference.normalized();
        self.db.with_conn(|conn| {
            match items::find_by_external_reference(conn, &reference)? {
                Some(id) => items::get_item(conn, id),
                None => Ok(None),
            }
        })
    }

    pub fn get(&self, id: ItemId) -> Result<Option<CanonicalItem>, CatalogError> {
        self.db.with_conn(|conn| items::get_item(conn, id))
    }

    /// Usable references, deduplicated, in preference order.
    /// Unlisted sources keep their supplied order after the listed ones.
    fn ordered_references(&self, supplied: &[ExternalReference]) -> Vec<ExternalReference> {
        let mut references: Vec<ExternalReference> = vec![];
        for reference in supplied.iter().map(ExternalReference::normalized) {
            if reference.is_usable() && !references.contains(&reference) {
                references.push(reference);
            }
        }

        let rank = |r: &ExternalReference| {
            self.source_preference
                .iter()
                .position(|s| *s == r.source)
                .unwrap_or(self.source_preference.len())
        };
        references.sort_by_key(rank);
        references
    }

    fn emit_resolved(&self, resolution: &Resolution, raw: &RawItem) {
        self.events.emit(CatalogEvent::ItemResolved {
            item_id: resolution.item.id,
            created: resolution.created,
            source_id: raw.origin.source_id.clone(),
        });
    }
}

/// Check the raw item and pick the payload to store
fn validate(raw: &RawItem) -> Result<ItemPayload, CatalogError> {
    if raw.origin.source_id.trim().is_empty() || raw.origin.local_id.trim().is_empty() {
        return Err(CatalogError::InvalidInput(
            "origin needs a source id and a local id".into(),
        ));
    }

    match &raw.payload {
        Some(payload) if !payload.matches(raw.content_type) => Err(CatalogError::InvalidInput(
            format!("payload does not match content type '{}'", raw.content_type),
        )),
        Some(payload) => Ok(payload.clone()),
        None => Ok(ItemPayload::empty_for(raw.content_type)),
    }
}

fn find_match(
    conn: &Connection,
    raw: &RawItem,
    references: &[ExternalReference],
) -> Result<Option<(ItemId, MatchedBy)>, CatalogError> {
    for reference in references {
        if let Some(id) = items::find_by_external_reference(conn, reference)? {
            return Ok(Some((
                id,
                MatchedBy::ExternalReference {
                    reference: reference.clone(),
                },
            )));
        }
    }

    let normalized = normalize_title(&raw.title);
    let year = match raw.year {
        Some(year) if !normalized.is_empty() => year,
        _ if references.is_empty() => {
            return Err(CatalogError::IdentityInsufficient(format!(
                "'{}' has no usable reference and no title and year to match on",
                raw.title
            )));
        }
        _ => return Ok(None),
    };

    let mut candidates = vec![];
    for id in items::find_by_fingerprint(conn, raw.content_type, &normalized, year)? {
        // A candidate carrying a different id from one of our sources is other content
        let Some(item) = items::get_item(conn, id)? else {
            continue;
        };
        let contradicts = item.external_refs.iter().any(|held| {
            references
                .iter()
                .any(|r| r.source == held.source && r.id != held.id)
        });
        if !contradicts {
            candidates.push(id);
        }
    }

    match candidates.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some((*id, MatchedBy::Metadata))),
        many => Err(CatalogError::IdentityAmbiguous(format!(
            "{} catalog items match '{}' ({})",
            many.len(),
            raw.title,
            year
        ))),
    }
}

fn insert_canonical(
    conn: &Connection,
    raw: &RawItem,
    payload: &ItemPayload,
    now: DateTime<Utc>,
) -> Result<ItemId, CatalogError> {
    let title = raw.title.trim();
    if title.is_empty() {
        return Err(CatalogError::IdentityInsufficient(
            "cannot create an item without a title".into(),
        ));
    }

    items::insert_item(
        conn,
        &items::NewItem {
            content_type: raw.content_type,
            title,
            year: raw.year,
            payload,
            owner_id: None,
        },
        now,
    )
}

fn attach_free_references(
    conn: &Connection,
    item_id: ItemId,
    references: &[ExternalReference],
    now: DateTime<Utc>,
) -> Result<(), CatalogError> {
    for reference in references {
        if items::attach_external_reference(conn, item_id, reference, now)? {
            continue;
        }
        if let Some(owner) = items::find_by_external_reference(conn, reference)? {
            if owner != item_id {
                warn!(
                    item_id,
                    owner,
                    reference = %reference,
                    "Reference already belongs to another item, skipping"
                );
            }
        }
    }
    Ok(())
}
