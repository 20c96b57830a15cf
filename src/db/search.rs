//! Catalog query over the local items table
//!
//! Filters are combined with AND; genres and content types match any-of.
//! Without explicit content types, list items are excluded. When lists are
//! asked for, every list matching the filters comes back regardless of its
//! visibility; the list engine drops the ones the refreshed list's owner
//! may not read before anything is committed.

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use super::CatalogDb;
use crate::capabilities::CatalogQuery;
use crate::error::CatalogError;
use crate::models::{ItemId, SmartCriteria, SortOrder};

/// Cap applied when criteria carry no limit of their own
pub const MAX_SEARCH_RESULTS: u32 = 1000;

/// Ids of items matching the criteria
pub fn search_items(
    conn: &Connection,
    criteria: &SmartCriteria,
) -> Result<Vec<ItemId>, CatalogError> {
    let mut sql = String::from("SELECT i.id FROM items i");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if !criteria.genres.is_empty() {
        let placeholders: Vec<_> = criteria.genres.iter().map(|_| "?").collect();
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM item_genres g WHERE g.item_id = i.id AND g.genre IN ({}))",
            placeholders.join(", ")
        ));
        for genre in &criteria.genres {
            params.push(Box::new(genre.trim().to_lowercase()));
        }
    }

    if criteria.content_types.is_empty() {
        conditions.push("i.content_type NOT IN ('collection', 'playlist')".to_string());
    } else {
        let placeholders: Vec<_> = criteria.content_types.iter().map(|_| "?").collect();
        conditions.push(format!("i.content_type IN ({})", placeholders.join(", ")));
        for ct in &criteria.content_types {
            params.push(Box::new(ct.as_str()));
        }
    }

    if let Some(min) = criteria.year_min {
        conditions.push("i.year >= ?".to_string());
        params.push(Box::new(min));
    }

    if let Some(max) = criteria.year_max {
        conditions.push("i.year <= ?".to_string());
        params.push(Box::new(max));
    }

    if let Some(min) = criteria.rating_min {
        conditions.push("i.rating >= ?".to_string());
        params.push(Box::new(min));
    }

    if let Some(max) = criteria.rating_max {
        conditions.push("i.rating <= ?".to_string());
        params.push(Box::new(max));
    }

    if let Some(ref text) = criteria.text {
        if !text.trim().is_empty() {
            conditions.push("i.title LIKE ? ESCAPE '\\'".to_string());
            params.push(Box::new(format!("%{}%", escape_like(text.trim()))));
        }
    }

    if let Some(owner_id) = criteria.owner_id {
        conditions.push("i.owner_id = ?".to_string());
        params.push(Box::new(owner_id));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(match criteria.sort {
        SortOrder::TitleAsc => " ORDER BY i.normalized_title ASC, i.id ASC",
        SortOrder::TitleDesc => " ORDER BY i.normalized_title DESC, i.id DESC",
        SortOrder::YearAsc => " ORDER BY i.year IS NULL, i.year ASC, i.id ASC",
        SortOrder::YearDesc => " ORDER BY i.year IS NULL, i.year DESC, i.id ASC",
        SortOrder::RatingDesc => " ORDER BY i.rating IS NULL, i.rating DESC, i.id ASC",
        SortOrder::RecentlyAdded => " ORDER BY i.created_at DESC, i.id DESC",
    });

    sql.push_str(" LIMIT ?");
    params.push(Box::new(criteria.limit.unwrap_or(MAX_SEARCH_RESULTS) as i64));

    debug!("Executing catalog query: {}", sql);

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let ids = stmt
        .query_map(param_refs.as_slice(), |row| row.get(0))?
        .collect::<Result<Vec<ItemId>, _>>()?;

    Ok(ids)
}

/// Make `%`, `_` and `\` match literally inside a LIKE pattern
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CatalogQuery for CatalogDb {
    async fn search(&self, criteria: &SmartCriteria) -> Result<Vec<ItemId>, CatalogError> {
        criteria.validate()?;
        self.with_conn(|conn| search_items(conn, criteria))
    }
}
