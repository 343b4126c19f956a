//! Concurrent in-memory store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CasOutcome, EntityRef, EntityRow, Store};
use crate::kind::EntityKind;
use crate::Result;

type RowKey = (EntityKind, String);

/// In-memory store backed by a sharded concurrent map
///
/// Every single-row operation runs under the shard lock of its key, which
/// makes upsert and compare-and-swap atomic per row.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: DashMap<RowKey, EntityRow>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, archived included
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the store holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn write(&self, mut row: EntityRow) -> Option<u64> {
        match self.rows.entry((row.kind, row.identity.clone())) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().supersedes(&row) {
                    return None;
                }
                row.revision = occupied.get().revision + 1;
                let revision = row.revision;
                occupied.insert(row);
                Some(revision)
            }
            Entry::Vacant(vacant) => {
                row.revision = 1;
                vacant.insert(row);
                Some(1)
            }
        }
    }

    fn cas(&self, mut row: EntityRow, expected: Option<u64>) -> CasOutcome {
        match self.rows.entry((row.kind, row.identity.clone())) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().revision) {
                    return CasOutcome::Conflict(Some(occupied.get().clone()));
                }
                row.revision = occupied.get().revision + 1;
                let revision = row.revision;
                occupied.insert(row);
                CasOutcome::Applied(revision)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return CasOutcome::Conflict(None);
                }
                row.revision = 1;
                vacant.insert(row);
                CasOutcome::Applied(1)
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(&self, kind: EntityKind, identity: &str) -> Result<Option<EntityRow>> {
        Ok(self
            .rows
            .get(&(kind, identity.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn find_by_key(&self, kind: EntityKind, key: &[String]) -> Result<Vec<EntityRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.kind == kind && r.key.as_slice() == key)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRow>> {
        let mut rows: Vec<EntityRow> = self
            .rows
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(rows)
    }

    async fn list_children(&self, kind: EntityKind, parent: &EntityRef) -> Result<Vec<EntityRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.kind == kind && r.parent.as_ref() == Some(parent))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn upsert(&self, row: EntityRow) -> Result<Option<u64>> {
        Ok(self.write(row))
    }

    async fn upsert_batch(
        &self,
        _kind: EntityKind,
        rows: Vec<EntityRow>,
    ) -> Result<Vec<EntityRow>> {
        let mut superseded = Vec::new();
        for row in rows {
            if self.write(row.clone()).is_none() {
                superseded.push(row);
            }
        }
        Ok(superseded)
    }

    async fn compare_and_swap(
        &self,
        row: EntityRow,
        expected_revision: Option<u64>,
    ) -> Result<CasOutcome> {
        Ok(self.cas(row, expected_revision))
    }

    async fn compare_and_swap_batch(
        &self,
        _kind: EntityKind,
        rows: Vec<(EntityRow, Option<u64>)>,
    ) -> Result<Vec<EntityRow>> {
        let mut conflicts = Vec::new();
        for (row, expected) in rows {
            if let CasOutcome::Conflict(_) = self.cas(row.clone(), expected) {
                conflicts.push(row);
            }
        }
        Ok(conflicts)
    }

    async fn archive(&self, kind: EntityKind, identity: &str, at: DateTime<Utc>) -> Result<bool> {
        match self.rows.get_mut(&(kind, identity.to_string())) {
            Some(mut row) if row.archived_at.is_none() => {
                row.archived_at = Some(at);
                row.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, kind: EntityKind, identity: &str) -> Result<bool> {
        Ok(self.rows.remove(&(kind, identity.to_string())).is_some())
    }
}
