//! Durable store on sled
//!
//! One tree holds every row under `kind/identity`, JSON encoded. Compare-and-swap
//! maps directly onto sled's native byte-level compare-and-swap, so two
//! processes sharing nothing but the database still cannot clobber each other.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Batch, IVec, Tree};
use tracing::{debug, info};

use super::{CasOutcome, EntityRef, EntityRow, Store};
use crate::kind::EntityKind;
use crate::{Error, Result};

const INVENTORY_TREE: &str = "inventory";

/// Store backed by an embedded sled database
pub struct SledStore {
    db: sled::Db,
    tree: Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("rows", &self.tree.len())
            .finish()
    }
}

impl SledStore {
    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let tree = db.open_tree(INVENTORY_TREE)?;
        info!(path = %path.display(), rows = tree.len(), "Opened inventory store");
        Ok(Self { db, tree })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn row_key(kind: EntityKind, identity: &str) -> Vec<u8> {
        format!("{kind}/{identity}").into_bytes()
    }

    fn kind_prefix(kind: EntityKind) -> Vec<u8> {
        format!("{kind}/").into_bytes()
    }

    fn decode(bytes: &IVec) -> Result<EntityRow> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode(row: &EntityRow) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(row)?)
    }

    fn scan(&self, kind: EntityKind) -> Result<Vec<EntityRow>> {
        self.tree
            .scan_prefix(Self::kind_prefix(kind))
            .values()
            .map(|v| Self::decode(&v?))
            .collect()
    }

    fn cas_row(&self, mut row: EntityRow, expected: Option<u64>) -> Result<CasOutcome> {
        let key = Self::row_key(row.kind, &row.identity);
        let current = self.tree.get(&key)?;
        let current_row = current.as_ref().map(Self::decode).transpose()?;

        if current_row.as_ref().map(|r| r.revision) != expected {
            return Ok(CasOutcome::Conflict(current_row));
        }

        row.revision = expected.unwrap_or(0) + 1;
        let revision = row.revision;
        let encoded = Self::encode(&row)?;
        match self.tree.compare_and_swap(&key, current, Some(encoded))? {
            Ok(()) => Ok(CasOutcome::Applied(revision)),
            Err(_) => {
                // Lost the race between our read and the swap
                let latest = self.tree.get(&key)?;
                Ok(CasOutcome::Conflict(
                    latest.as_ref().map(Self::decode).transpose()?,
                ))
            }
        }
    }

    fn write_row(&self, row: EntityRow) -> Result<Option<u64>> {
        loop {
            let key = Self::row_key(row.kind, &row.identity);
            let current = self.tree.get(&key)?.as_ref().map(Self::decode).transpose()?;
            if current.as_ref().is_some_and(|stored| stored.supersedes(&row)) {
                return Ok(None);
            }
            let expected = current.map(|r| r.revision);
            if let CasOutcome::Applied(revision) = self.cas_row(row.clone(), expected)? {
                return Ok(Some(revision));
            }
            debug!(kind = %row.kind, identity = %row.identity, "Upsert raced, retrying");
        }
    }
}

#[async_trait]
impl Store for SledStore {
    async fn find(&self, kind: EntityKind, identity: &str) -> Result<Option<EntityRow>> {
        self.tree
            .get(Self::row_key(kind, identity))?
            .as_ref()
            .map(Self::decode)
            .transpose()
    }

    async fn find_by_key(&self, kind: EntityKind, key: &[String]) -> Result<Vec<EntityRow>> {
        Ok(self
            .scan(kind)?
            .into_iter()
            .filter(|r| r.key.as_slice() == key)
            .collect())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRow>> {
        self.scan(kind)
    }

    async fn list_children(&self, kind: EntityKind, parent: &EntityRef) -> Result<Vec<EntityRow>> {
        Ok(self
            .scan(kind)?
            .into_iter()
            .filter(|r| r.parent.as_ref() == Some(parent))
            .collect())
    }

    async fn upsert(&self, row: EntityRow) -> Result<Option<u64>> {
        self.write_row(row)
    }

    async fn upsert_batch(
        &self,
        kind: EntityKind,
        rows: Vec<EntityRow>,
    ) -> Result<Vec<EntityRow>> {
        let mut batch = Batch::default();
        let mut superseded = Vec::new();
        for mut row in rows {
            if row.kind != kind {
                return Err(Error::store(
                    "upsert_batch",
                    format!("row {} does not belong to batch kind {}", row.entity_ref(), kind),
                ));
            }
            let key = Self::row_key(row.kind, &row.identity);
            let current = self.tree.get(&key)?.as_ref().map(Self::decode).transpose()?;
            if current.as_ref().is_some_and(|stored| stored.supersedes(&row)) {
                superseded.push(row);
                continue;
            }
            row.revision = current.map(|r| r.revision).unwrap_or(0) + 1;
            batch.insert(key, Self::encode(&row)?);
        }
        self.tree.apply_batch(batch)?;
        self.flush().await?;
        Ok(superseded)
    }

    async fn compare_and_swap(
        &self,
        row: EntityRow,
        expected_revision: Option<u64>,
    ) -> Result<CasOutcome> {
        self.cas_row(row, expected_revision)
    }

    async fn compare_and_swap_batch(
        &self,
        _kind: EntityKind,
        rows: Vec<(EntityRow, Option<u64>)>,
    ) -> Result<Vec<EntityRow>> {
        let mut conflicts = Vec::new();
        for (row, expected) in rows {
            if let CasOutcome::Conflict(_) = self.cas_row(row.clone(), expected)? {
                conflicts.push(row);
            }
        }
        self.flush().await?;
        Ok(conflicts)
    }

    async fn archive(&self, kind: EntityKind, identity: &str, at: DateTime<Utc>) -> Result<bool> {
        loop {
            let Some(mut row) = self.find(kind, identity).await? else {
                return Ok(false);
            };
            if row.is_archived() {
                return Ok(false);
            }
            let expected = row.revision;
            row.archived_at = Some(at);
            if let CasOutcome::Applied(_) = self.cas_row(row, Some(expected))? {
                return Ok(true);
            }
        }
    }

    async fn delete(&self, kind: EntityKind, identity: &str) -> Result<bool> {
        Ok(self.tree.remove(Self::row_key(kind, identity))?.is_some())
    }
}
