//! Full and targeted refreshes
//!
//! A full refresh lists every watched kind and reconciles in full scope. A
//! kind that cannot be listed is left out of the pass rather than aborting it;
//! only when nothing could be listed does the refresh fail. A targeted refresh
//! reconciles one drained notice batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::buffer::{BufferedNotice, NoticeBatch};
use crate::collector::Lister;
use crate::kind::{RawResource, ResourceKind};
use crate::persister::{Engine, PassReport, Scope};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::EntityRef;
use crate::{Error, Result};

/// Objects and list versions from listing every watched kind
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Every listed object
    pub objects: Vec<RawResource>,
    /// List resource version per successfully listed kind
    pub versions: BTreeMap<ResourceKind, String>,
    /// Kinds that listed successfully
    pub listed: BTreeSet<ResourceKind>,
    /// Kinds that failed, with the error
    pub failed: BTreeMap<ResourceKind, String>,
}

/// Outcome of a full refresh
#[derive(Clone, Debug, Serialize)]
pub struct FullRefresh {
    /// Pass report
    pub report: PassReport,
    /// List resource versions, used to seed watches
    pub versions: BTreeMap<ResourceKind, String>,
    /// Kinds whose listing failed
    pub failed_listings: BTreeMap<ResourceKind, String>,
}

impl FullRefresh {
    /// True when every kind listed and every kind committed
    pub fn is_success(&self) -> bool {
        self.failed_listings.is_empty() && self.report.is_success()
    }
}

/// Outcome of a targeted refresh
#[derive(Debug, Default)]
pub struct TargetedRefresh {
    /// Pass report; `None` when nothing was left to reconcile
    pub report: Option<PassReport>,
    /// Notices held back because their correlated counterpart could not be
    /// fetched; the caller queues them for the next pass
    pub deferred: Vec<BufferedNotice>,
}

/// Runs refreshes for a set of watched kinds
#[derive(Clone)]
pub struct Refresher {
    lister: Arc<dyn Lister>,
    engine: Engine,
    kinds: Vec<ResourceKind>,
    retry: RetryConfig,
}

impl Refresher {
    /// Create a refresher
    pub fn new(
        lister: Arc<dyn Lister>,
        engine: Engine,
        kinds: Vec<ResourceKind>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            lister,
            engine,
            kinds,
            retry,
        }
    }

    /// Watched kinds
    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }

    /// List every watched kind
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        for kind in &self.kinds {
            let kind = *kind;
            let op = format!("list {kind}");
            match retry_with_backoff(&self.retry, &op, || self.lister.list(kind)).await {
                Ok(list) => {
                    snapshot.objects.extend(list.items);
                    if let Some(version) = list.resource_version {
                        snapshot.versions.insert(kind, version);
                    }
                    snapshot.listed.insert(kind);
                }
                Err(e) => {
                    warn!(
                        kind = %kind,
                        error = %e,
                        "Listing failed, kind left out of this refresh"
                    );
                    snapshot.failed.insert(kind, e.to_string());
                }
            }
        }

        if snapshot.listed.is_empty() && !self.kinds.is_empty() {
            return Err(Error::remote_unavailable(
                "all",
                format!("no kind could be listed ({} failed)", snapshot.failed.len()),
            ));
        }
        Ok(snapshot)
    }

    /// List everything and reconcile in full scope
    pub async fn full_refresh(&self) -> Result<FullRefresh> {
        let snapshot = self.snapshot().await?;
        info!(
            objects = snapshot.objects.len(),
            listed = snapshot.listed.len(),
            failed = snapshot.failed.len(),
            "Listed inventory"
        );

        let scope = Scope::full(&snapshot.listed);
        let report = self.engine.reconcile(&snapshot.objects, scope).await?;
        Ok(FullRefresh {
            report,
            versions: snapshot.versions,
            failed_listings: snapshot.failed,
        })
    }

    /// Reconcile one drained batch in targeted scope
    pub async fn targeted_refresh(&self, mut batch: NoticeBatch) -> Result<TargetedRefresh> {
        if batch.is_empty() {
            return Ok(TargetedRefresh::default());
        }
        let deferred = batch
            .complete_correlated(self.lister.as_ref(), &self.retry)
            .await;
        if batch.is_empty() {
            return Ok(TargetedRefresh {
                report: None,
                deferred,
            });
        }

        let deletions: Vec<EntityRef> = batch
            .deleted_objects()
            .filter_map(|raw| {
                let kind = raw.kind().entity_kind()?;
                Some(EntityRef::new(kind, raw.uid()?))
            })
            .collect();
        let live: Vec<RawResource> = batch.live_objects().cloned().collect();

        let report = self
            .engine
            .reconcile(&live, Scope::targeted(deletions))
            .await?;
        Ok(TargetedRefresh {
            report: Some(report),
            deferred,
        })
    }
}
