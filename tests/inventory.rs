//! End-to-end passes against the in-memory store and a scripted cluster

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Namespace, Node, Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;

use kube_inventory::buffer::{BufferedNotice, NoticeBatch};
use kube_inventory::collector::{
    ChangeType, ListResult, Lister, Notice, NoticeStream, WatchFailure, Watcher,
};
use kube_inventory::kind::{EntityKind, RawResource, ResourceKind};
use kube_inventory::persister::{ApplyStrategy, Engine, Scope};
use kube_inventory::refresh::Refresher;
use kube_inventory::retry::RetryConfig;
use kube_inventory::store::{CasOutcome, EntityRef, EntityRow, MemoryStore, Store};
use kube_inventory::supervisor::{Supervisor, SupervisorConfig};
use kube_inventory::tags::TagMapper;
use kube_inventory::Result;

// =============================================================================
// Scripted cluster
// =============================================================================

/// Serves listings from a mutable object set and watch streams from scripts
#[derive(Default)]
struct FakeCluster {
    objects: Mutex<BTreeMap<ResourceKind, Vec<RawResource>>>,
    scripts: Mutex<HashMap<ResourceKind, VecDeque<Vec<Notice>>>>,
    watch_calls: Mutex<Vec<(ResourceKind, Option<String>)>>,
}

impl FakeCluster {
    fn set(&self, objects: Vec<RawResource>) {
        let mut by_kind: BTreeMap<ResourceKind, Vec<RawResource>> = BTreeMap::new();
        for object in objects {
            by_kind.entry(object.kind()).or_default().push(object);
        }
        *self.objects.lock() = by_kind;
    }

    fn script(&self, kind: ResourceKind, notices: Vec<Notice>) {
        self.scripts.lock().entry(kind).or_default().push_back(notices);
    }

    fn watch_calls(&self) -> Vec<(ResourceKind, Option<String>)> {
        self.watch_calls.lock().clone()
    }
}

#[async_trait]
impl Lister for FakeCluster {
    async fn list(&self, kind: ResourceKind) -> Result<ListResult> {
        Ok(ListResult {
            items: self.objects.lock().get(&kind).cloned().unwrap_or_default(),
            resource_version: Some("100".to_string()),
        })
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
    ) -> Result<Option<RawResource>> {
        Ok(self.objects.lock().get(&kind).and_then(|objects| {
            objects
                .iter()
                .find(|o| o.name() == name && o.namespace().map(str::to_string) == namespace)
                .cloned()
        }))
    }
}

#[async_trait]
impl Watcher for FakeCluster {
    async fn watch(
        &self,
        kind: ResourceKind,
        from_version: Option<String>,
    ) -> Result<NoticeStream> {
        self.watch_calls.lock().push((kind, from_version));
        let next = self.scripts.lock().get_mut(&kind).and_then(VecDeque::pop_front);
        Ok(match next {
            Some(notices) => futures::stream::iter(notices.into_iter().map(Ok)).boxed(),
            None => futures::stream::pending().boxed(),
        })
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn meta(namespace: Option<&str>, name: &str, uid: &str, rv: u64) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        uid: Some(uid.to_string()),
        resource_version: Some(rv.to_string()),
        ..Default::default()
    }
}

fn namespace(name: &str, rv: u64) -> RawResource {
    RawResource::Namespace(Namespace {
        metadata: meta(None, name, &format!("{name}-uid"), rv),
        ..Default::default()
    })
}

fn node(name: &str, rv: u64) -> RawResource {
    RawResource::Node(Node {
        metadata: meta(None, name, &format!("{name}-uid"), rv),
        ..Default::default()
    })
}

fn pod(ns: &str, name: &str, node_name: Option<&str>, phase: &str, rv: u64) -> RawResource {
    RawResource::Pod(Pod {
        metadata: meta(Some(ns), name, &format!("{name}-uid"), rv),
        spec: Some(PodSpec {
            node_name: node_name.map(str::to_string),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    })
}

/// Add a container, reported by the kubelet as running `image_id`
fn with_container(mut raw: RawResource, name: &str, image: &str, image_id: &str) -> RawResource {
    if let RawResource::Pod(pod) = &mut raw {
        if let Some(spec) = pod.spec.as_mut() {
            spec.containers.push(Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            });
        }
        if let Some(status) = pod.status.as_mut() {
            status
                .container_statuses
                .get_or_insert_with(Vec::new)
                .push(ContainerStatus {
                    name: name.to_string(),
                    image: image.to_string(),
                    image_id: image_id.to_string(),
                    ready: true,
                    ..Default::default()
                });
        }
    }
    raw
}

/// Pods sharing one image digest pulled through two registries, plus a tag-only image
fn workload(rv: u64) -> Vec<RawResource> {
    vec![
        with_container(
            pod("ns1", "pa", Some("n1"), "Running", rv),
            "app",
            "quay.io/acme/app:1",
            "docker-pullable://quay.io/acme/app@sha256:aa",
        ),
        with_container(
            pod("ns1", "pb", Some("n1"), "Running", rv + 1),
            "app",
            "docker.io/mirror/app:2",
            "docker-pullable://docker.io/mirror/app@sha256:aa",
        ),
        with_container(
            pod("ns1", "pc", Some("n1"), "Running", rv + 2),
            "sidecar",
            "registry.local:5000/tools/proxy:3",
            "",
        ),
    ]
}

async fn rows(store: &MemoryStore, kind: EntityKind) -> Vec<EntityRow> {
    let mut rows = store.list(kind).await.unwrap();
    for row in &mut rows {
        row.revision = 0;
    }
    rows
}

fn engine(store: Arc<MemoryStore>, strategy: ApplyStrategy) -> Engine {
    Engine::new(store, Arc::new(TagMapper::default()), strategy)
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}

fn refresher(
    cluster: &Arc<FakeCluster>,
    store: &Arc<MemoryStore>,
    kinds: Vec<ResourceKind>,
) -> Refresher {
    Refresher::new(
        cluster.clone(),
        engine(store.clone(), ApplyStrategy::Default),
        kinds,
        fast_retry(),
    )
}

fn core_kinds() -> Vec<ResourceKind> {
    vec![ResourceKind::Namespace, ResourceKind::Node, ResourceKind::Pod]
}

async fn phase_of(store: &MemoryStore, uid: &str) -> Option<String> {
    store
        .find(EntityKind::Pod, uid)
        .await
        .unwrap()
        .and_then(|row| row.attributes.get("phase").and_then(|v| v.as_str()).map(str::to_string))
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Full refresh properties
// =============================================================================

#[tokio::test]
async fn second_full_refresh_without_changes_writes_nothing() {
    for strategy in ApplyStrategy::ALL {
        let cluster = Arc::new(FakeCluster::default());
        let mut objects = vec![namespace("ns1", 1), node("n1", 2)];
        objects.extend(workload(3));
        cluster.set(objects.clone());
        let store = Arc::new(MemoryStore::new());
        let refresher = Refresher::new(
            cluster.clone(),
            engine(store.clone(), strategy),
            core_kinds(),
            fast_retry(),
        );

        let first = refresher.full_refresh().await.unwrap();
        assert!(first.is_success(), "{strategy}");
        assert_eq!(first.report.stats(EntityKind::Container).created, 3, "{strategy}");
        assert_eq!(first.report.stats(EntityKind::Image).created, 2, "{strategy}");
        assert_eq!(first.report.stats(EntityKind::ImageRegistry).created, 3, "{strategy}");

        // Listing order changes between passes
        objects.reverse();
        cluster.set(objects);
        let second = refresher.full_refresh().await.unwrap();
        let totals = second.report.totals();
        assert_eq!(totals.writes(), 0, "{strategy}: {totals:?}");
        assert!(totals.unchanged > 0);

        // Replaying one pod's notice rewrites nothing it shares with others
        let batch = NoticeBatch::from_notices(vec![BufferedNotice::new(
            ChangeType::Modified,
            workload(3).remove(0),
        )]);
        let replay = refresher.targeted_refresh(batch).await.unwrap().report.unwrap();
        let totals = replay.totals();
        assert_eq!(totals.writes(), 0, "{strategy}: {totals:?}");
    }
}

#[tokio::test]
async fn disappeared_pod_is_archived_and_keeps_its_references() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set(vec![
        namespace("ns1", 1),
        node("n1", 2),
        pod("ns1", "p1", Some("n1"), "Running", 3),
        pod("ns1", "p2", Some("n1"), "Running", 4),
    ]);
    let store = Arc::new(MemoryStore::new());
    let refresher = refresher(&cluster, &store, core_kinds());
    refresher.full_refresh().await.unwrap();

    cluster.set(vec![
        namespace("ns1", 1),
        node("n1", 2),
        pod("ns1", "p2", Some("n1"), "Running", 4),
    ]);
    let refresh = refresher.full_refresh().await.unwrap();
    assert_eq!(refresh.report.stats(EntityKind::Pod).archived, 1);

    let gone = store.find(EntityKind::Pod, "p1-uid").await.unwrap().unwrap();
    assert!(gone.is_archived());
    assert_eq!(
        gone.refs["namespace"],
        Some(EntityRef::new(EntityKind::Namespace, "ns1-uid"))
    );
    assert_eq!(gone.refs["node"], Some(EntityRef::new(EntityKind::Node, "n1-uid")));
    assert!(store.find(EntityKind::Namespace, "ns1-uid").await.unwrap().is_some());
    assert!(!store.find(EntityKind::Pod, "p2-uid").await.unwrap().unwrap().is_archived());
}

#[tokio::test]
async fn parse_order_does_not_change_resolved_references() {
    let mut objects = vec![namespace("ns1", 1), node("n1", 2)];
    objects.extend(workload(3));
    let mut reversed = objects.clone();
    reversed.reverse();

    let kinds = [
        EntityKind::Pod,
        EntityKind::Container,
        EntityKind::Image,
        EntityKind::ImageRegistry,
    ];
    let mut stored = Vec::new();
    for order in [objects, reversed] {
        let store = Arc::new(MemoryStore::new());
        let report = engine(store.clone(), ApplyStrategy::Batch)
            .reconcile(&order, Scope::full_all())
            .await
            .unwrap();
        assert!(report.unresolved.is_empty());
        let mut snapshot = Vec::new();
        for kind in kinds {
            snapshot.push(rows(&store, kind).await);
        }
        stored.push(snapshot);
    }
    assert_eq!(stored[0], stored[1]);

    let pods = &stored[0][0];
    let pa = pods.iter().find(|row| row.identity == "pa-uid").unwrap();
    assert_eq!(pa.refs["node"], Some(EntityRef::new(EntityKind::Node, "n1-uid")));

    let containers = &stored[0][1];
    let registry_of = |pod: &str| {
        containers
            .iter()
            .find(|row| row.identity.starts_with(pod))
            .and_then(|row| row.refs["registry"].clone())
    };
    assert_eq!(
        registry_of("pa-uid"),
        Some(EntityRef::new(EntityKind::ImageRegistry, "quay.io:443"))
    );
    assert_eq!(
        registry_of("pb-uid"),
        Some(EntityRef::new(EntityKind::ImageRegistry, "docker.io:443"))
    );

    let registries: Vec<&str> = stored[0][3].iter().map(|row| row.identity.as_str()).collect();
    assert_eq!(registries, vec!["docker.io:443", "quay.io:443", "registry.local:5000"]);
}

// =============================================================================
// Concurrent writers
// =============================================================================

/// Lands a newer observation of one row right before the first write of its kind
struct InterleavingStore {
    inner: MemoryStore,
    newer: Mutex<Option<EntityRow>>,
}

impl InterleavingStore {
    async fn interleave(&self, kind: EntityKind) {
        let pending = {
            let mut newer = self.newer.lock();
            match newer.as_ref() {
                Some(row) if row.kind == kind => newer.take(),
                _ => None,
            }
        };
        if let Some(row) = pending {
            self.inner.upsert(row).await.unwrap();
        }
    }
}

#[async_trait]
impl Store for InterleavingStore {
    async fn find(&self, kind: EntityKind, identity: &str) -> Result<Option<EntityRow>> {
        self.inner.find(kind, identity).await
    }

    async fn find_by_key(&self, kind: EntityKind, key: &[String]) -> Result<Vec<EntityRow>> {
        self.inner.find_by_key(kind, key).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRow>> {
        self.inner.list(kind).await
    }

    async fn list_children(&self, kind: EntityKind, parent: &EntityRef) -> Result<Vec<EntityRow>> {
        self.inner.list_children(kind, parent).await
    }

    async fn upsert(&self, row: EntityRow) -> Result<Option<u64>> {
        self.interleave(row.kind).await;
        self.inner.upsert(row).await
    }

    async fn upsert_batch(
        &self,
        kind: EntityKind,
        rows: Vec<EntityRow>,
    ) -> Result<Vec<EntityRow>> {
        self.interleave(kind).await;
        self.inner.upsert_batch(kind, rows).await
    }

    async fn compare_and_swap(
        &self,
        row: EntityRow,
        expected_revision: Option<u64>,
    ) -> Result<CasOutcome> {
        self.interleave(row.kind).await;
        self.inner.compare_and_swap(row, expected_revision).await
    }

    async fn compare_and_swap_batch(
        &self,
        kind: EntityKind,
        rows: Vec<(EntityRow, Option<u64>)>,
    ) -> Result<Vec<EntityRow>> {
        self.interleave(kind).await;
        self.inner.compare_and_swap_batch(kind, rows).await
    }

    async fn archive(&self, kind: EntityKind, identity: &str, at: DateTime<Utc>) -> Result<bool> {
        self.inner.archive(kind, identity, at).await
    }

    async fn delete(&self, kind: EntityKind, identity: &str) -> Result<bool> {
        self.inner.delete(kind, identity).await
    }
}

#[tokio::test]
async fn strategies_converge_when_a_newer_write_lands_mid_pass() {
    let mut finals = Vec::new();
    for strategy in ApplyStrategy::ALL {
        let store = Arc::new(InterleavingStore {
            inner: MemoryStore::new(),
            newer: Mutex::new(None),
        });
        let engine = Engine::new(store.clone(), Arc::new(TagMapper::default()), strategy);
        engine
            .reconcile(
                &[namespace("ns1", 1), pod("ns1", "p1", None, "Pending", 5)],
                Scope::full_all(),
            )
            .await
            .unwrap();

        // Another pass observes rv 9 while ours still carries rv 6
        let mut newer = store.inner.find(EntityKind::Pod, "p1-uid").await.unwrap().unwrap();
        newer.resource_version = Some(9);
        newer.attributes.insert("phase".to_string(), "Succeeded".into());
        *store.newer.lock() = Some(newer);

        let report = engine
            .reconcile(&[pod("ns1", "p1", None, "Running", 6)], Scope::targeted(Vec::new()))
            .await
            .unwrap();
        assert!(report.is_success(), "{strategy}");
        assert_eq!(report.stats(EntityKind::Pod).superseded, 1, "{strategy}");

        let row = store.inner.find(EntityKind::Pod, "p1-uid").await.unwrap().unwrap();
        assert_eq!(row.resource_version, Some(9), "{strategy}");
        assert_eq!(phase_of(&store.inner, "p1-uid").await.as_deref(), Some("Succeeded"));
        finals.push(rows(&store.inner, EntityKind::Pod).await);
    }
    assert!(finals.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn dangling_node_reference_is_null_not_a_failure() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(store.clone(), ApplyStrategy::Default);
    engine
        .reconcile(&[namespace("ns1", 1)], Scope::full_all())
        .await
        .unwrap();

    let report = engine
        .reconcile(
            &[pod("ns1", "p1", Some("n-unknown"), "Pending", 5)],
            Scope::targeted(Vec::new()),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(report
        .unresolved
        .iter()
        .any(|u| u.field == "node" && u.target.contains("n-unknown")));
    let row = store.find(EntityKind::Pod, "p1-uid").await.unwrap().unwrap();
    assert_eq!(row.refs["node"], None);
    assert_eq!(
        row.refs["namespace"],
        Some(EntityRef::new(EntityKind::Namespace, "ns1-uid"))
    );
}

// =============================================================================
// Targeted refresh properties
// =============================================================================

#[tokio::test]
async fn modified_notice_updates_pod_and_keeps_namespace() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set(vec![namespace("ns1", 1), pod("ns1", "p1", None, "Pending", 3)]);
    let store = Arc::new(MemoryStore::new());
    let refresher = refresher(&cluster, &store, core_kinds());
    refresher.full_refresh().await.unwrap();
    assert_eq!(phase_of(&store, "p1-uid").await.as_deref(), Some("Pending"));

    let batch = NoticeBatch::from_notices(vec![BufferedNotice::new(
        ChangeType::Modified,
        pod("ns1", "p1", None, "Running", 4),
    )]);
    let report = refresher.targeted_refresh(batch).await.unwrap().report.unwrap();

    assert_eq!(report.stats(EntityKind::Pod).updated, 1);
    assert_eq!(phase_of(&store, "p1-uid").await.as_deref(), Some("Running"));
    let row = store.find(EntityKind::Pod, "p1-uid").await.unwrap().unwrap();
    assert_eq!(
        row.refs["namespace"],
        Some(EntityRef::new(EntityKind::Namespace, "ns1-uid"))
    );
}

#[tokio::test]
async fn targeted_pass_leaves_unnamed_peers_alone() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set(vec![
        namespace("ns1", 1),
        pod("ns1", "p1", None, "Pending", 3),
        pod("ns1", "p2", None, "Pending", 4),
    ]);
    let store = Arc::new(MemoryStore::new());
    let refresher = Refresher::new(
        cluster.clone(),
        engine(store.clone(), ApplyStrategy::ConcurrentSafeBatch),
        core_kinds(),
        fast_retry(),
    );
    refresher.full_refresh().await.unwrap();
    let before = store.find(EntityKind::Pod, "p2-uid").await.unwrap().unwrap();

    let batch = NoticeBatch::from_notices(vec![BufferedNotice::new(
        ChangeType::Deleted,
        pod("ns1", "p1", None, "Pending", 5),
    )]);
    let report = refresher.targeted_refresh(batch).await.unwrap().report.unwrap();

    assert_eq!(report.stats(EntityKind::Pod).archived, 1);
    let after = store.find(EntityKind::Pod, "p2-uid").await.unwrap().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn last_notice_per_identity_decides() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set(vec![namespace("ns1", 1)]);
    let store = Arc::new(MemoryStore::new());
    let refresher = refresher(&cluster, &store, core_kinds());
    refresher.full_refresh().await.unwrap();

    let batch = NoticeBatch::from_notices(vec![
        BufferedNotice::new(ChangeType::Added, pod("ns1", "p1", None, "Pending", 3)),
        BufferedNotice::new(ChangeType::Modified, pod("ns1", "p1", None, "Running", 4)),
        BufferedNotice::new(ChangeType::Added, pod("ns1", "p2", None, "Pending", 5)),
        BufferedNotice::new(ChangeType::Modified, pod("ns1", "p2", None, "Running", 6)),
        BufferedNotice::new(ChangeType::Deleted, pod("ns1", "p2", None, "Running", 7)),
    ]);
    assert_eq!(batch.len(), 2);
    refresher.targeted_refresh(batch).await.unwrap();

    assert_eq!(phase_of(&store, "p1-uid").await.as_deref(), Some("Running"));
    // Never persisted live, so there is nothing to archive
    assert!(store.find(EntityKind::Pod, "p2-uid").await.unwrap().is_none());
}

// =============================================================================
// Watch supervision
// =============================================================================

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(1),
        backoff: RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn stale_watch_resumes_from_fresh_baseline_without_rewrites() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set(vec![namespace("ns1", 3)]);
    let store = Arc::new(MemoryStore::new());
    let refresher = refresher(&cluster, &store, vec![ResourceKind::Namespace]);
    let initial = refresher.full_refresh().await.unwrap();

    cluster.script(
        ResourceKind::Namespace,
        vec![Notice::Error(WatchFailure {
            code: 410,
            reason: "Expired".to_string(),
            message: "too old resource version".to_string(),
        })],
    );
    cluster.script(
        ResourceKind::Namespace,
        vec![Notice::Added(namespace("ns1", 3)), Notice::Added(namespace("ns2", 7))],
    );

    let supervisor = Supervisor::start_workers(
        cluster.clone(),
        refresher.kinds(),
        &initial.versions,
        supervisor_config(),
    );
    wait_for(|| supervisor.buffer().len() >= 2).await;

    let calls = cluster.watch_calls();
    assert_eq!(calls[0], (ResourceKind::Namespace, Some("100".to_string())));
    assert_eq!(calls[1], (ResourceKind::Namespace, None));
    assert!(supervisor.full_refresh_requested());

    let report = refresher
        .targeted_refresh(supervisor.buffer().drain_batch())
        .await
        .unwrap()
        .report
        .unwrap();
    let stats = report.stats(EntityKind::Namespace);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.updated, 0);

    assert!(supervisor.shutdown().await.is_clean());
}

#[tokio::test]
async fn coordinator_applies_watched_changes() {
    let cluster = Arc::new(FakeCluster::default());
    cluster.set(vec![namespace("ns1", 1), pod("ns1", "p1", None, "Pending", 3)]);
    let store = Arc::new(MemoryStore::new());
    let refresher = refresher(&cluster, &store, core_kinds());
    let initial = refresher.full_refresh().await.unwrap();

    cluster.script(
        ResourceKind::Pod,
        vec![Notice::Modified(pod("ns1", "p1", None, "Running", 4))],
    );
    let supervisor = Supervisor::start(
        cluster.clone(),
        refresher,
        &initial.versions,
        supervisor_config(),
    );

    let mut phase = None;
    for _ in 0..400 {
        phase = phase_of(&store, "p1-uid").await;
        if phase.as_deref() == Some("Running") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(phase.as_deref(), Some("Running"));
    assert!(supervisor.shutdown().await.is_clean());
}
