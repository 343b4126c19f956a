//! APPLY strategies
//!
//! All three strategies converge on the same final state. They differ in how
//! many store round trips they take and in what they assume about other
//! writers.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::diff::{is_superseded, KindPlan};
use super::KindStats;
use crate::kind::{EntityKind, Removal};
use crate::store::{CasOutcome, EntityRow, Store};
use crate::{Error, Result};

/// How APPLY writes a kind's rows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStrategy {
    /// One version-aware upsert per entity; safe under any concurrency
    #[default]
    Default,
    /// One bulk upsert per kind; passes touching the same kind must be serialized
    Batch,
    /// Bulk compare-and-swap per kind, conflicted rows retried one by one
    ConcurrentSafeBatch,
}

impl ApplyStrategy {
    /// Every strategy
    pub const ALL: [ApplyStrategy; 3] = [
        ApplyStrategy::Default,
        ApplyStrategy::Batch,
        ApplyStrategy::ConcurrentSafeBatch,
    ];

    /// Configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Batch => "batch",
            Self::ConcurrentSafeBatch => "concurrent-safe-batch",
        }
    }
}

impl fmt::Display for ApplyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplyStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| {
                Error::config(format!(
                    "unknown apply strategy '{s}', expected one of: \
                     default, batch, concurrent-safe-batch"
                ))
            })
    }
}

/// Commit one kind's plan
pub(crate) async fn apply_plan(
    store: &dyn Store,
    strategy: ApplyStrategy,
    plan: &KindPlan,
    at: DateTime<Utc>,
) -> Result<KindStats> {
    let mut stats = plan.stats;

    match strategy {
        ApplyStrategy::Default => {
            for write in &plan.writes {
                match store.upsert(write.row.clone()).await? {
                    Some(_) => count(&mut stats, write.is_create()),
                    None => stats.superseded += 1,
                }
            }
        }
        ApplyStrategy::Batch => {
            if !plan.writes.is_empty() {
                let rows = plan.writes.iter().map(|w| w.row.clone()).collect();
                let superseded = store.upsert_batch(plan.kind, rows).await?;
                let skipped: HashSet<&str> =
                    superseded.iter().map(|r| r.identity.as_str()).collect();
                for write in &plan.writes {
                    if skipped.contains(write.row.identity.as_str()) {
                        stats.superseded += 1;
                    } else {
                        count(&mut stats, write.is_create());
                    }
                }
            }
        }
        ApplyStrategy::ConcurrentSafeBatch => {
            if !plan.writes.is_empty() {
                let batch = plan
                    .writes
                    .iter()
                    .map(|w| (w.row.clone(), w.expected_revision))
                    .collect();
                let conflicts = store.compare_and_swap_batch(plan.kind, batch).await?;
                let conflicted: HashSet<&str> =
                    conflicts.iter().map(|r| r.identity.as_str()).collect();
                for write in &plan.writes {
                    if !conflicted.contains(write.row.identity.as_str()) {
                        count(&mut stats, write.is_create());
                    }
                }
                if !conflicts.is_empty() {
                    debug!(
                        kind = %plan.kind,
                        conflicts = conflicts.len(),
                        "Retrying conflicted rows individually"
                    );
                }
                for row in &conflicts {
                    retry_conflicted(store, row, &mut stats).await?;
                }
            }
        }
    }

    for identity in &plan.removals {
        match plan.kind.removal() {
            Removal::Archive => {
                if store.archive(plan.kind, identity, at).await? {
                    stats.archived += 1;
                }
            }
            Removal::Delete => {
                if store.delete(plan.kind, identity).await? {
                    stats.deleted += 1;
                }
            }
        }
    }

    Ok(stats)
}

fn count(stats: &mut KindStats, is_create: bool) {
    if is_create {
        stats.created += 1;
    } else {
        stats.updated += 1;
    }
}

/// Re-read a conflicted row and write it once more against what is stored now
///
/// A second conflict means another writer is active on the same identity
/// right now; that fails the kind.
async fn retry_conflicted(store: &dyn Store, row: &EntityRow, stats: &mut KindStats) -> Result<()> {
    let kind: EntityKind = row.kind;
    let current = store.find(kind, &row.identity).await?;
    match &current {
        Some(stored) if is_superseded(stored, row) => {
            stats.superseded += 1;
            return Ok(());
        }
        Some(stored) if stored.same_content(row) && !stored.is_archived() => {
            stats.unchanged += 1;
            return Ok(());
        }
        _ => {}
    }

    let expected = current.as_ref().map(|r| r.revision);
    match store.compare_and_swap(row.clone(), expected).await? {
        CasOutcome::Applied(_) => {
            count(stats, expected.is_none());
            Ok(())
        }
        CasOutcome::Conflict(_) => {
            warn!(
                kind = %kind,
                identity = %row.identity,
                "Row still conflicts after individual retry"
            );
            Err(Error::apply_conflict(kind.to_string(), row.identity.clone()))
        }
    }
}
