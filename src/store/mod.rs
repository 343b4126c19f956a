//! Persisted inventory store
//!
//! Rows carry the minimum identity surface the reconciliation engine needs:
//! kind, remote identity, secondary key, optional namespace and parent, an
//! archive marker and the resource version. Relationship columns only ever
//! hold resolved identities.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::kind::EntityKind;
use crate::Result;

/// Resolved identity of a persisted entity
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity kind
    pub kind: EntityKind,
    /// Remote identity (or synthesized identity for child kinds)
    pub identity: String,
}

impl EntityRef {
    /// Create a reference
    pub fn new(kind: EntityKind, identity: impl Into<String>) -> Self {
        Self {
            kind,
            identity: identity.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.identity)
    }
}

/// One persisted entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    /// Entity kind
    pub kind: EntityKind,
    /// Remote identity, unique within the kind
    pub identity: String,
    /// Secondary key used by lazy references (e.g. namespace + name)
    pub key: Vec<String>,
    /// Human name
    pub name: String,
    /// Namespace for namespaced kinds
    pub namespace: Option<String>,
    /// Owning entity for child kinds
    pub parent: Option<EntityRef>,
    /// Last observed resource version
    pub resource_version: Option<u64>,
    /// Flat attribute set
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Single-valued relationships; `None` means unresolved
    pub refs: BTreeMap<String, Option<EntityRef>>,
    /// Multi-valued relationships
    pub ref_lists: BTreeMap<String, Vec<EntityRef>>,
    /// Soft-delete marker
    pub archived_at: Option<DateTime<Utc>>,
    /// Store-maintained write counter, checked by compare-and-swap
    #[serde(default)]
    pub revision: u64,
}

impl EntityRow {
    /// Reference to this row
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.identity.clone())
    }

    /// True when the row carries the soft-delete marker
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// True when this row is a newer observation than `candidate`
    ///
    /// Only decidable when both carry a resource version.
    pub fn supersedes(&self, candidate: &EntityRow) -> bool {
        matches!(
            (self.resource_version, candidate.resource_version),
            (Some(stored), Some(observed)) if stored > observed
        )
    }

    /// True when `other` describes the same observed state
    ///
    /// Archive marker and revision are bookkeeping and are ignored.
    pub fn same_content(&self, other: &EntityRow) -> bool {
        self.kind == other.kind
            && self.identity == other.identity
            && self.key == other.key
            && self.name == other.name
            && self.namespace == other.namespace
            && self.parent == other.parent
            && self.resource_version == other.resource_version
            && self.attributes == other.attributes
            && self.refs == other.refs
            && self.ref_lists == other.ref_lists
    }
}

/// Result of a compare-and-swap write
#[derive(Clone, Debug, PartialEq)]
pub enum CasOutcome {
    /// The write landed; carries the new revision
    Applied(u64),
    /// The stored revision did not match; carries the current row, if any
    Conflict(Option<EntityRow>),
}

/// Trait abstracting the persisted store
///
/// Implementations must make each single-row operation atomic. Batch
/// operations are not required to be atomic across rows.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Find a row by identity, archived or not
    async fn find(&self, kind: EntityKind, identity: &str) -> Result<Option<EntityRow>>;

    /// Find every row of a kind whose secondary key matches
    async fn find_by_key(&self, kind: EntityKind, key: &[String]) -> Result<Vec<EntityRow>>;

    /// Every row of a kind, archived rows included
    async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRow>>;

    /// Every row of a child kind owned by `parent`
    async fn list_children(&self, kind: EntityKind, parent: &EntityRef) -> Result<Vec<EntityRow>>;

    /// Insert or replace a row, returning the new revision
    ///
    /// Leaves the stored row alone and returns `None` when it carries a newer
    /// resource version than `row`.
    async fn upsert(&self, row: EntityRow) -> Result<Option<u64>>;

    /// Insert or replace many rows of one kind; returns the rows skipped
    /// because the store already held a newer resource version
    async fn upsert_batch(&self, kind: EntityKind, rows: Vec<EntityRow>)
        -> Result<Vec<EntityRow>>;

    /// Write a row only if the stored revision matches (`None` = must not exist)
    async fn compare_and_swap(
        &self,
        row: EntityRow,
        expected_revision: Option<u64>,
    ) -> Result<CasOutcome>;

    /// Compare-and-swap many rows of one kind; returns the rows that conflicted
    async fn compare_and_swap_batch(
        &self,
        kind: EntityKind,
        rows: Vec<(EntityRow, Option<u64>)>,
    ) -> Result<Vec<EntityRow>>;

    /// Set the archive marker; returns false if the row is missing or already archived
    async fn archive(&self, kind: EntityKind, identity: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Physically remove a row; returns false if it was missing
    async fn delete(&self, kind: EntityKind, identity: &str) -> Result<bool>;
}

/// Pick the row that represents a secondary key
///
/// Live rows win over archived ones; among equals the highest resource
/// version wins, since secondary keys only collide across create/delete races.
pub fn pick_current(rows: Vec<EntityRow>) -> Option<EntityRow> {
    rows.into_iter().max_by(|a, b| {
        (!a.is_archived(), a.resource_version).cmp(&(!b.is_archived(), b.resource_version))
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal row for store tests
    pub fn row(kind: EntityKind, identity: &str, key: &[&str], rv: Option<u64>) -> EntityRow {
        EntityRow {
            kind,
            identity: identity.to_string(),
            key: key.iter().map(|s| s.to_string()).collect(),
            name: key.last().map(|s| s.to_string()).unwrap_or_default(),
            namespace: None,
            parent: None,
            resource_version: rv,
            attributes: BTreeMap::new(),
            refs: BTreeMap::new(),
            ref_lists: BTreeMap::new(),
            archived_at: None,
            revision: 0,
        }
    }
}
