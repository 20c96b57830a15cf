//! Domain types shared by the storage and service layers
//!
//! A [`CanonicalItem`] is the single system-of-record entity for one piece of
//! content. Lists are canonical items too: their list-shaped payload is carried
//! by [`ListContainer`], which the list engine reads and writes as a unit.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Numeric identity of a canonical item (lists included)
pub type ItemId = i64;

/// Numeric identity of a user account
pub type UserId = i64;

/// Actor id recorded for application-level changes (scheduled refreshes etc.)
pub const SYSTEM_ACTOR: UserId = 0;

// ============================================================================
// Content Types
// ============================================================================

/// Closed set of content kinds the catalog knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Movie,
    Show,
    Episode,
    Track,
    Album,
    Artist,
    Collection,
    Playlist,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Movie => "movie",
            ContentType::Show => "show",
            ContentType::Episode => "episode",
            ContentType::Track => "track",
            ContentType::Album => "album",
            ContentType::Artist => "artist",
            ContentType::Collection => "collection",
            ContentType::Playlist => "playlist",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(ContentType::Movie),
            "show" => Some(ContentType::Show),
            "episode" => Some(ContentType::Episode),
            "track" => Some(ContentType::Track),
            "album" => Some(ContentType::Album),
            "artist" => Some(ContentType::Artist),
            "collection" => Some(ContentType::Collection),
            "playlist" => Some(ContentType::Playlist),
            _ => None,
        }
    }

    /// Whether items of this type carry an ordered list payload
    pub fn is_list(&self) -> bool {
        matches!(self, ContentType::Collection | ContentType::Playlist)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(&s.trim().to_ascii_lowercase())
            .ok_or_else(|| CatalogError::InvalidInput(format!("unknown content type '{}'", s)))
    }
}

/// Type-specific payload of a canonical item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemPayload {
    Movie {
        #[serde(default)]
        runtime_minutes: Option<u32>,
        #[serde(default)]
        genres: Vec<String>,
        #[serde(default)]
        rating: Option<f64>,
    },
    Show {
        #[serde(default)]
        seasons: Option<u32>,
        #[serde(default)]
        genres: Vec<String>,
        #[serde(default)]
        rating: Option<f64>,
    },
    Episode {
        #[serde(default)]
        show_title: Option<String>,
        #[serde(default)]
        season: Option<u32>,
        #[serde(default)]
        episode: Option<u32>,
    },
    Track {
        #[serde(default)]
        artist: Option<String>,
        #[serde(default)]
        album: Option<String>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        genres: Vec<String>,
    },
    Album {
        #[serde(default)]
        artist: Option<String>,
        #[serde(default)]
        track_count: Option<u32>,
        #[serde(default)]
        genres: Vec<String>,
    },
    Artist {
        #[serde(default)]
        genres: Vec<String>,
    },
    /// Entries and list metadata live in the list tables
    List,
}

impl ItemPayload {
    /// Empty payload for a content type
    pub fn empty_for(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Movie => ItemPayload::Movie {
                runtime_minutes: None,
                genres: vec![],
                rating: None,
            },
            ContentType::Show => ItemPayload::Show {
                seasons: None,
                genres: vec![],
                rating: None,
            },
            ContentType::Episode => ItemPayload::Episode {
                show_title: None,
                season: None,
                episode: None,
            },
            ContentType::Track => ItemPayload::Track {
                artist: None,
                album: None,
                duration_ms: None,
                genres: vec![],
            },
            ContentType::Album => ItemPayload::Album {
                artist: None,
                track_count: None,
                genres: vec![],
            },
            ContentType::Artist => ItemPayload::Artist { genres: vec![] },
            ContentType::Collection | ContentType::Playlist => ItemPayload::List,
        }
    }

    /// Whether this payload may be attached to an item tagged `content_type`
    pub fn matches(&self, content_type: ContentType) -> bool {
        matches!(
            (self, content_type),
            (ItemPayload::Movie { .. }, ContentType::Movie)
                | (ItemPayload::Show { .. }, ContentType::Show)
                | (ItemPayload::Episode { .. }, ContentType::Episode)
                | (ItemPayload::Track { .. }, ContentType::Track)
                | (ItemPayload::Album { .. }, ContentType::Album)
                | (ItemPayload::Artist { .. }, ContentType::Artist)
                | (ItemPayload::List, ContentType::Collection)
                | (ItemPayload::List, ContentType::Playlist)
        )
    }

    pub fn genres(&self) -> &[String] {
        match self {
            ItemPayload::Movie { genres, .. }
            | ItemPayload::Show { genres, .. }
            | ItemPayload::Track { genres, .. }
            | ItemPayload::Album { genres, .. }
            | ItemPayload::Artist { genres } => genres,
            ItemPayload::Episode { .. } | ItemPayload::List => &[],
        }
    }

    pub fn rating(&self) -> Option<f64> {
        match self {
            ItemPayload::Movie { rating, .. } | ItemPayload::Show { rating, .. } => *rating,
            _ => None,
        }
    }

    /// Payload fields as a JSON object
    pub fn details(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

// ============================================================================
// Identity
// ============================================================================

/// A (source, id) pair recognizing the same content across sources
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalReference {
    pub source: String,
    pub id: String,
}

impl ExternalReference {
    /// Build a reference with the source name lowercased and both parts trimmed
    pub fn new(source: impl AsRef<str>, id: impl AsRef<str>) -> Self {
        Self {
            source: source.as_ref().trim().to_ascii_lowercase(),
            id: id.as_ref().trim().to_string(),
        }
    }

    /// Normalized copy of a reference that may have arrived un-normalized
    pub fn normalized(&self) -> Self {
        Self::new(&self.source, &self.id)
    }

    pub fn is_usable(&self) -> bool {
        !self.source.trim().is_empty() && !self.id.trim().is_empty()
    }
}

impl fmt::Display for ExternalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Where a raw item came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOrigin {
    /// Identity of the external source (a server, account or library)
    pub source_id: String,
    /// The source's own name for the content type
    pub source_content_type: String,
    /// The source-local id of the item
    pub local_id: String,
}

/// Link from a canonical item to one external source's local id for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSyncMapping {
    pub source_id: String,
    pub source_content_type: String,
    pub local_id: String,
    pub updated_at: DateTime<Utc>,
}

/// One content entity as known to this system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: ItemId,
    pub content_type: ContentType,
    pub title: String,
    pub year: Option<i32>,
    pub payload: ItemPayload,
    pub external_refs: Vec<ExternalReference>,
    pub sync_mappings: Vec<ClientSyncMapping>,
    /// Set for user-created lists
    pub owner_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalItem {
    pub fn mapping_for(&self, source_id: &str) -> Option<&ClientSyncMapping> {
        self.sync_mappings.iter().find(|m| m.source_id == source_id)
    }

    pub fn has_reference(&self, reference: &ExternalReference) -> bool {
        self.external_refs.iter().any(|r| r == reference)
    }
}

/// Title folded for heuristic matching: lowercase, punctuation runs to one space
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_space = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

// ============================================================================
// Lists
// ============================================================================

/// Who may see a list beyond its owner and collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Public => "public",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Visibility::Private),
            "shared" => Some(Visibility::Shared),
            "public" => Some(Visibility::Public),
            _ => None,
        }
    }
}

impl FromStr for Visibility {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
            .ok_or_else(|| CatalogError::InvalidInput(format!("unknown visibility '{}'", s)))
    }
}

/// One member of a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub item_id: ItemId,
    pub position: u32,
    pub changed_at: DateTime<Utc>,
}

/// A canonical item whose payload is an ordered collection of other items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListContainer {
    pub id: ItemId,
    pub content_type: ContentType,
    pub title: String,
    pub description: Option<String>,
    pub owner_id: UserId,
    pub visibility: Visibility,
    pub entries: Vec<ListEntry>,
    pub item_count: u32,
    pub is_smart: bool,
    pub criteria: Option<SmartCriteria>,
    pub auto_update_time: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    pub modified_by: UserId,
    /// Collaborator ids as cached on the last read; levels live in the collaborator table
    pub collaborators: BTreeSet<UserId>,
    /// Bumped on every committed write
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl ListContainer {
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.entries.iter().map(|e| e.item_id).collect()
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.entries.iter().any(|e| e.item_id == item_id)
    }

    pub fn index_of(&self, item_id: ItemId) -> Option<usize> {
        self.entries.iter().position(|e| e.item_id == item_id)
    }

    /// Renumber positions to 0..n-1 in sequence order and refresh the count
    pub fn normalize_positions(&mut self, now: DateTime<Utc>) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let position = index as u32;
            if entry.position != position {
                entry.position = position;
                entry.changed_at = now;
            }
        }
        self.item_count = self.entries.len() as u32;
    }

    /// Check count, contiguous positions and unique membership
    pub fn check_invariants(&self) -> Result<(), CatalogError> {
        if self.item_count as usize != self.entries.len() {
            return Err(CatalogError::Internal(format!(
                "list {} item_count {} does not match {} entries",
                self.id,
                self.item_count,
                self.entries.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.entries.len());
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.position as usize != index {
                return Err(CatalogError::Internal(format!(
                    "list {} has position {} at index {}",
                    self.id, entry.position, index
                )));
            }
            if !seen.insert(entry.item_id) {
                return Err(CatalogError::Internal(format!(
                    "list {} references item {} twice",
                    self.id, entry.item_id
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Change Ledger
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Remove,
    Reorder,
    Update,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Remove => "remove",
            ChangeKind::Reorder => "reorder",
            ChangeKind::Update => "update",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "add" => Some(ChangeKind::Add),
            "remove" => Some(ChangeKind::Remove),
            "reorder" => Some(ChangeKind::Reorder),
            "update" => Some(ChangeKind::Update),
            _ => None,
        }
    }
}

/// A change that has not been written yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChange {
    pub item_id: ItemId,
    pub kind: ChangeKind,
}

impl PendingChange {
    pub fn new(item_id: ItemId, kind: ChangeKind) -> Self {
        Self { item_id, kind }
    }
}

/// One immutable ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: i64,
    pub entity_id: ItemId,
    /// 0 for system changes
    pub actor: UserId,
    pub item_id: ItemId,
    pub kind: ChangeKind,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Access Control
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read,
    Write,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
        }
    }
}

impl FromStr for PermissionLevel {
    type Err = CatalogError;

    /// Accepts exactly `read` or `write`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(PermissionLevel::Read),
            "write" => Ok(PermissionLevel::Write),
            other => Err(CatalogError::InvalidInput(format!(
                "permission level must be 'read' or 'write', got '{}'",
                other
            ))),
        }
    }
}

/// A non-owner user granted access to a list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub list_id: ItemId,
    pub user_id: UserId,
    pub level: PermissionLevel,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl FromStr for Role {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
            .ok_or_else(|| CatalogError::InvalidInput(format!("unknown role '{}'", s)))
    }
}

// ============================================================================
// Smart List Criteria
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    TitleAsc,
    TitleDesc,
    YearAsc,
    YearDesc,
    RatingDesc,
    RecentlyAdded,
}

/// Declarative membership rule of a smart list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartCriteria {
    /// Match any of these genres
    pub genres: Vec<String>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub rating_min: Option<f64>,
    pub rating_max: Option<f64>,
    /// Case-insensitive title substring
    pub text: Option<String>,
    /// Match any of these content types; empty means all non-list types
    pub content_types: Vec<ContentType>,
    pub owner_id: Option<UserId>,
    pub sort: SortOrder,
    pub limit: Option<u32>,
}

impl SmartCriteria {
    pub fn validate(&self) -> Result<(), CatalogError> {
        if let (Some(min), Some(max)) = (self.year_min, self.year_max) {
            if min > max {
                return Err(CatalogError::InvalidInput(format!(
                    "year_min {} is greater than year_max {}",
                    min, max
                )));
            }
        }

        if let (Some(min), Some(max)) = (self.rating_min, self.rating_max) {
            if min > max {
                return Err(CatalogError::InvalidInput(format!(
                    "rating_min {} is greater than rating_max {}",
                    min, max
                )));
            }
        }

        if self.limit == Some(0) {
            return Err(CatalogError::InvalidInput("limit must be positive".into()));
        }

        Ok(())
    }
}
