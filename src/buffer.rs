//! Notice buffer and deduplication
//!
//! Watch workers push notices concurrently; the coordinator drains them in one
//! go. The lock is held only for the push or the swap, never across I/O.
//!
//! Deduplication keeps the last notice per (kind, identity) by arrival order.
//! Every notice carries the object's full current representation, so the
//! last one alone describes the final state.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::collector::{ChangeType, Lister};
use crate::kind::{RawResource, ResourceKind};
use crate::retry::{retry_with_backoff, RetryConfig};

/// An object-bearing notice as queued
#[derive(Clone, Debug, PartialEq)]
pub struct BufferedNotice {
    /// Change type
    pub change: ChangeType,
    /// Full current representation
    pub object: RawResource,
}

impl BufferedNotice {
    /// Create a buffered notice
    pub fn new(change: ChangeType, object: RawResource) -> Self {
        Self { change, object }
    }
}

/// Thread-safe queue shared by watch workers and the coordinator
#[derive(Debug, Default)]
pub struct NoticeBuffer {
    queue: Mutex<Vec<BufferedNotice>>,
}

impl NoticeBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one notice
    pub fn ingest(&self, notice: BufferedNotice) {
        self.queue.lock().push(notice);
    }

    /// Return and clear everything queued since the last drain
    pub fn drain(&self) -> Vec<BufferedNotice> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Drain and deduplicate in one step
    pub fn drain_batch(&self) -> NoticeBatch {
        NoticeBatch::from_notices(self.drain())
    }

    /// Number of queued notices
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Kinds whose instances are correlated by secondary key rather than by reference
///
/// A Service and its Endpoints share namespace and name; the parser needs both
/// halves to build one Service entity.
pub const CORRELATED_KINDS: [(ResourceKind, ResourceKind); 2] = [
    (ResourceKind::Endpoints, ResourceKind::Service),
    (ResourceKind::Service, ResourceKind::Endpoints),
];

type NamespacedName = (Option<String>, String);

/// Deduplicated notices of one drain, grouped by kind
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoticeBatch {
    by_kind: BTreeMap<ResourceKind, Vec<BufferedNotice>>,
}

impl NoticeBatch {
    /// Reduce notices to the last one per (kind, identity)
    ///
    /// Arrival order decides: a DELETED beats anything before it, and anything
    /// after a DELETED beats the DELETED. Output keeps arrival order of the
    /// surviving notices.
    pub fn from_notices(notices: Vec<BufferedNotice>) -> Self {
        let total = notices.len();
        let mut last: HashMap<(ResourceKind, String), (usize, BufferedNotice)> = HashMap::new();
        for (seq, notice) in notices.into_iter().enumerate() {
            let key = (notice.object.kind(), notice.object.dedup_key());
            last.insert(key, (seq, notice));
        }

        let mut survivors: Vec<(usize, BufferedNotice)> = last.into_values().collect();
        survivors.sort_by_key(|(seq, _)| *seq);

        let mut by_kind: BTreeMap<ResourceKind, Vec<BufferedNotice>> = BTreeMap::new();
        for (_, notice) in survivors {
            by_kind
                .entry(notice.object.kind())
                .or_default()
                .push(notice);
        }

        let batch = Self { by_kind };
        if total > 0 {
            debug!(received = total, kept = batch.len(), "Deduplicated notices");
        }
        batch
    }

    /// Number of notices after deduplication
    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    /// True when the batch holds no notices
    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// Notices of one kind, in arrival order
    pub fn notices(&self, kind: ResourceKind) -> &[BufferedNotice] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every notice, grouped by kind
    pub fn iter(&self) -> impl Iterator<Item = &BufferedNotice> {
        self.by_kind.values().flatten()
    }

    /// Kinds present in the batch
    pub fn kinds(&self) -> BTreeSet<ResourceKind> {
        self.by_kind.keys().copied().collect()
    }

    /// Objects of the batch that are still alive (not DELETED)
    pub fn live_objects(&self) -> impl Iterator<Item = &RawResource> {
        self.iter()
            .filter(|n| n.change != ChangeType::Deleted)
            .map(|n| &n.object)
    }

    /// Objects named by DELETED notices
    pub fn deleted_objects(&self) -> impl Iterator<Item = &RawResource> {
        self.iter()
            .filter(|n| n.change == ChangeType::Deleted)
            .map(|n| &n.object)
    }

    fn names(&self, kind: ResourceKind) -> BTreeSet<NamespacedName> {
        self.notices(kind)
            .iter()
            .map(|n| {
                (
                    n.object.namespace().map(String::from),
                    n.object.name().to_string(),
                )
            })
            .collect()
    }

    /// Keys observed in `from` that have no counterpart of kind `to` in this batch
    ///
    /// DELETED notices of `from` only need their counterpart when the
    /// counterpart outlives them (an Endpoints deletion still changes its
    /// Service), so they are included; a deleted Service needs no Endpoints.
    pub fn missing_counterparts(
        &self,
        from: ResourceKind,
        to: ResourceKind,
    ) -> Vec<NamespacedName> {
        let present = self.names(to);
        let needs_counterpart = |n: &&BufferedNotice| {
            n.change != ChangeType::Deleted || from == ResourceKind::Endpoints
        };
        let mut missing: BTreeSet<NamespacedName> = BTreeSet::new();
        for notice in self.notices(from).iter().filter(needs_counterpart) {
            let key = (
                notice.object.namespace().map(String::from),
                notice.object.name().to_string(),
            );
            if !present.contains(&key) {
                missing.insert(key);
            }
        }
        missing.into_iter().collect()
    }

    /// Add a fetched counterpart as if it had been observed as MODIFIED
    pub fn insert_fetched(&mut self, object: RawResource) {
        self.by_kind
            .entry(object.kind())
            .or_default()
            .push(BufferedNotice::new(ChangeType::Modified, object));
    }

    /// Remove and return the notices of one kind under a namespaced name
    pub fn take(&mut self, kind: ResourceKind, key: &NamespacedName) -> Vec<BufferedNotice> {
        let Some(notices) = self.by_kind.get_mut(&kind) else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(notices).into_iter().partition(|n| {
            n.object.namespace() == key.0.as_deref() && n.object.name() == key.1
        });
        if kept.is_empty() {
            self.by_kind.remove(&kind);
        } else {
            *notices = kept;
        }
        taken
    }

    /// Fetch every missing half of a correlated pair before parsing
    ///
    /// A notice whose counterpart cannot be fetched is taken out of the batch
    /// and returned, so the pair is never reconciled half-built. A counterpart
    /// that does not exist is not an error. Returns the deferred notices.
    pub async fn complete_correlated(
        &mut self,
        lister: &dyn Lister,
        retry: &RetryConfig,
    ) -> Vec<BufferedNotice> {
        let mut fetched = 0;
        let mut deferred = Vec::new();
        for (from, to) in CORRELATED_KINDS {
            for key in self.missing_counterparts(from, to) {
                let (namespace, name) = &key;
                let op = format!("fetch {to} {}/{name}", namespace.as_deref().unwrap_or_default());
                let result = retry_with_backoff(retry, &op, || {
                    lister.get(to, namespace.clone(), name.clone())
                })
                .await;
                match result {
                    Ok(Some(object)) => {
                        self.insert_fetched(object);
                        fetched += 1;
                    }
                    Ok(None) => {
                        debug!(
                            kind = %to,
                            namespace = ?namespace,
                            name = %name,
                            "Counterpart not found"
                        );
                    }
                    Err(e) => {
                        warn!(
                            kind = %to,
                            namespace = ?namespace,
                            name = %name,
                            error = %e,
                            deferred = %from,
                            "Failed to fetch counterpart, deferring to the next pass"
                        );
                        deferred.extend(self.take(from, &key));
                    }
                }
            }
        }
        if fetched > 0 {
            debug!(fetched, "Fetched correlated counterparts");
        }
        deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockLister;
    use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(ns: &str, name: &str, uid: &str, rv: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            uid: Some(uid.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        }
    }

    fn pod(uid: &str, rv: &str) -> RawResource {
        RawResource::Pod(Pod {
            metadata: meta("ns1", uid, uid, rv),
            ..Default::default()
        })
    }

    fn service(name: &str) -> RawResource {
        RawResource::Service(Service {
            metadata: meta("ns1", name, &format!("svc-{name}"), "1"),
            ..Default::default()
        })
    }

    fn endpoints(name: &str) -> RawResource {
        RawResource::Endpoints(Endpoints {
            metadata: meta("ns1", name, &format!("ep-{name}"), "1"),
            ..Default::default()
        })
    }

    fn n(change: ChangeType, object: RawResource) -> BufferedNotice {
        BufferedNotice::new(change, object)
    }

    // =========================================================================
    // Buffer
    // =========================================================================

    #[test]
    fn drain_returns_and_clears() {
        let buffer = NoticeBuffer::new();
        buffer.ingest(n(ChangeType::Added, pod("a", "1")));
        buffer.ingest(n(ChangeType::Added, pod("b", "1")));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.drain().len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn concurrent_ingest_loses_nothing() {
        let buffer = std::sync::Arc::new(NoticeBuffer::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        buffer.ingest(n(ChangeType::Added, pod(&format!("{t}-{i}"), "1")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(buffer.drain_batch().len(), 800);
    }

    // =========================================================================
    // Deduplication
    // =========================================================================

    #[test]
    fn last_notice_per_identity_wins() {
        let batch = NoticeBatch::from_notices(vec![
            n(ChangeType::Added, pod("a", "1")),
            n(ChangeType::Modified, pod("a", "2")),
            n(ChangeType::Modified, pod("a", "3")),
        ]);
        let pods = batch.notices(ResourceKind::Pod);
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].object.resource_version(), Some(3));
    }

    #[test]
    fn deleted_after_modified_wins() {
        let batch = NoticeBatch::from_notices(vec![
            n(ChangeType::Modified, pod("a", "2")),
            n(ChangeType::Deleted, pod("a", "3")),
        ]);
        assert_eq!(batch.notices(ResourceKind::Pod)[0].change, ChangeType::Deleted);
        assert_eq!(batch.deleted_objects().count(), 1);
        assert_eq!(batch.live_objects().count(), 0);
    }

    #[test]
    fn notice_after_deleted_overrides_it() {
        let batch = NoticeBatch::from_notices(vec![
            n(ChangeType::Deleted, pod("a", "3")),
            n(ChangeType::Added, pod("a", "4")),
        ]);
        assert_eq!(batch.notices(ResourceKind::Pod)[0].change, ChangeType::Added);
    }

    #[test]
    fn distinct_identities_keep_arrival_order() {
        let batch = NoticeBatch::from_notices(vec![
            n(ChangeType::Added, pod("b", "1")),
            n(ChangeType::Added, pod("a", "1")),
            n(ChangeType::Modified, pod("b", "2")),
        ]);
        let names: Vec<&str> = batch
            .notices(ResourceKind::Pod)
            .iter()
            .map(|n| n.object.name())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn same_uid_in_different_kinds_is_not_merged() {
        let mut svc = service("x");
        if let RawResource::Service(s) = &mut svc {
            s.metadata.uid = Some("shared".to_string());
        }
        let mut ep = endpoints("x");
        if let RawResource::Endpoints(e) = &mut ep {
            e.metadata.uid = Some("shared".to_string());
        }
        let batch = NoticeBatch::from_notices(vec![
            n(ChangeType::Added, svc),
            n(ChangeType::Added, ep),
        ]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.kinds().len(), 2);
    }

    // =========================================================================
    // Correlated kinds
    // =========================================================================

    #[test]
    fn missing_counterparts_both_directions() {
        let batch = NoticeBatch::from_notices(vec![
            n(ChangeType::Modified, endpoints("web")),
            n(ChangeType::Modified, service("db")),
            n(ChangeType::Modified, service("api")),
            n(ChangeType::Modified, endpoints("api")),
        ]);

        let services_needed =
            batch.missing_counterparts(ResourceKind::Endpoints, ResourceKind::Service);
        assert_eq!(services_needed, vec![(Some("ns1".to_string()), "web".to_string())]);

        let endpoints_needed =
            batch.missing_counterparts(ResourceKind::Service, ResourceKind::Endpoints);
        assert_eq!(endpoints_needed, vec![(Some("ns1".to_string()), "db".to_string())]);
    }

    #[test]
    fn deleted_service_needs_no_endpoints() {
        let batch = NoticeBatch::from_notices(vec![n(ChangeType::Deleted, service("gone"))]);
        assert!(batch
            .missing_counterparts(ResourceKind::Service, ResourceKind::Endpoints)
            .is_empty());
    }

    #[test]
    fn deleted_endpoints_still_refresh_their_service() {
        let batch = NoticeBatch::from_notices(vec![n(ChangeType::Deleted, endpoints("web"))]);
        assert_eq!(
            batch.missing_counterparts(ResourceKind::Endpoints, ResourceKind::Service),
            vec![(Some("ns1".to_string()), "web".to_string())]
        );
    }

    #[tokio::test]
    async fn complete_correlated_fetches_missing_half() {
        let mut lister = MockLister::new();
        lister
            .expect_get()
            .withf(|kind, ns, name| {
                *kind == ResourceKind::Service && ns.as_deref() == Some("ns1") && name == "web"
            })
            .times(1)
            .returning(|_, _, _| Ok(Some(service("web"))));

        let mut batch = NoticeBatch::from_notices(vec![n(ChangeType::Modified, endpoints("web"))]);
        let deferred = batch
            .complete_correlated(&lister, &RetryConfig::with_max_attempts(1))
            .await;

        assert!(deferred.is_empty());
        assert_eq!(batch.notices(ResourceKind::Endpoints).len(), 1);
        assert_eq!(batch.notices(ResourceKind::Service).len(), 1);
        assert_eq!(batch.notices(ResourceKind::Service)[0].change, ChangeType::Modified);
    }

    #[tokio::test]
    async fn failed_counterpart_fetch_defers_the_notice() {
        let mut lister = MockLister::new();
        lister
            .expect_get()
            .returning(|kind, _, _| Err(crate::Error::remote_unavailable(kind.plural(), "down")));

        let mut batch = NoticeBatch::from_notices(vec![
            n(ChangeType::Modified, service("db")),
            n(ChangeType::Modified, service("api")),
            n(ChangeType::Modified, endpoints("api")),
            n(ChangeType::Modified, pod("p1", "4")),
        ]);
        let deferred = batch
            .complete_correlated(&lister, &RetryConfig::with_max_attempts(1))
            .await;

        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].object.name(), "db");
        let services: Vec<&str> = batch
            .notices(ResourceKind::Service)
            .iter()
            .map(|n| n.object.name())
            .collect();
        assert_eq!(services, vec!["api"]);
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn missing_counterpart_is_not_deferred() {
        let mut lister = MockLister::new();
        lister.expect_get().returning(|_, _, _| Ok(None));

        let mut batch = NoticeBatch::from_notices(vec![n(ChangeType::Modified, service("db"))]);
        let deferred = batch
            .complete_correlated(&lister, &RetryConfig::with_max_attempts(1))
            .await;

        assert!(deferred.is_empty());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn take_drops_empty_kinds() {
        let mut batch = NoticeBatch::from_notices(vec![n(ChangeType::Modified, service("db"))]);
        let key = (Some("ns1".to_string()), "db".to_string());
        assert_eq!(batch.take(ResourceKind::Service, &key).len(), 1);
        assert!(batch.is_empty());
        assert!(batch.take(ResourceKind::Service, &key).is_empty());
    }
}
