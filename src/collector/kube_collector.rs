//! kube-rs backed collector
//!
//! Lists are paged; watches use the raw watch API rather than the
//! `kube::runtime::watcher` state machine, because the worker must see ERROR
//! notices (and stale-version rejections) to drive its own resume logic.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Endpoints, LimitRange, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod,
    ReplicationController, ResourceQuota, Service,
};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use super::{ListResult, Lister, Notice, NoticeStream, WatchFailure, Watcher};
use crate::kind::{RawResource, ResourceKind};
use crate::{Error, Result};

/// Default page size for list calls
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Server-side watch timeout (seconds); must stay below the client read timeout
/// so idle watches are closed by the server first
pub const WATCH_TIMEOUT_SECS: u32 = 290;

/// Collector talking to the API server through kube-rs
#[derive(Clone)]
pub struct KubeCollector {
    client: Client,
    page_size: u32,
    watch_timeout_secs: u32,
}

impl KubeCollector {
    /// Create a collector with default paging and watch timeout
    pub fn new(client: Client) -> Self {
        Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
        }
    }

    /// Override the list page size
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    async fn list_typed<K>(
        &self,
        kind: ResourceKind,
        wrap: fn(K) -> RawResource,
    ) -> Result<ListResult>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let mut params = ListParams::default().limit(self.page_size);
        let mut result = ListResult::default();

        loop {
            let page = match api.list(&params).await {
                Ok(page) => page,
                Err(kube::Error::Api(resp)) if resp.code == 404 => {
                    debug!(kind = %kind, "Kind not served by this cluster, treating as empty");
                    return Ok(ListResult::default());
                }
                Err(e) => return Err(Error::from_kube(kind.plural(), e)),
            };

            result.resource_version = page.metadata.resource_version.clone();
            result.items.extend(page.items.into_iter().map(wrap));

            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => {
                    trace!(kind = %kind, fetched = result.items.len(), "Fetching next page");
                    params = params.continue_token(&token);
                }
                _ => break,
            }
        }

        debug!(kind = %kind, count = result.items.len(), "Listed resources");
        Ok(result)
    }

    async fn get_namespaced<K>(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        wrap: fn(K) -> RawResource,
    ) -> Result<Option<RawResource>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map(|found| found.map(wrap))
            .map_err(|e| Error::from_kube(kind.plural(), e))
    }

    async fn get_cluster<K>(
        &self,
        kind: ResourceKind,
        name: &str,
        wrap: fn(K) -> RawResource,
    ) -> Result<Option<RawResource>>
    where
        K: Resource<DynamicType = (), Scope = ClusterResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map(|found| found.map(wrap))
            .map_err(|e| Error::from_kube(kind.plural(), e))
    }

    async fn watch_typed<K>(
        &self,
        kind: ResourceKind,
        from_version: Option<String>,
        wrap: fn(K) -> RawResource,
    ) -> Result<NoticeStream>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let params = WatchParams::default().timeout(self.watch_timeout_secs);
        // An empty version is the same as omitting it: a fresh baseline
        let version = from_version.unwrap_or_default();

        debug!(kind = %kind, version = %version, "Opening watch");
        let stream = api
            .watch(&params, &version)
            .await
            .map_err(|e| Error::from_kube(kind.plural(), e))?;

        Ok(stream
            .map(move |event| translate_event(kind, event, wrap))
            .boxed())
    }
}

/// Map a kube watch event onto the notice protocol
fn translate_event<K>(
    kind: ResourceKind,
    event: kube::Result<WatchEvent<K>>,
    wrap: fn(K) -> RawResource,
) -> Result<Notice>
where
    K: Clone + Debug,
{
    match event {
        Ok(WatchEvent::Added(obj)) => Ok(Notice::Added(wrap(obj))),
        Ok(WatchEvent::Modified(obj)) => Ok(Notice::Modified(wrap(obj))),
        Ok(WatchEvent::Deleted(obj)) => Ok(Notice::Deleted(wrap(obj))),
        Ok(WatchEvent::Error(resp)) => Ok(Notice::Error(WatchFailure {
            code: resp.code,
            reason: resp.reason,
            message: resp.message,
        })),
        // Bookmarks are never requested, so receiving one is a violation
        Ok(WatchEvent::Bookmark(_)) => Err(Error::protocol(
            kind.plural(),
            "unexpected BOOKMARK notice",
        )),
        Err(kube::Error::SerdeError(e)) => Err(Error::protocol(kind.plural(), e.to_string())),
        Err(e) => Err(Error::from_kube(kind.plural(), e)),
    }
}

#[async_trait]
impl Lister for KubeCollector {
    async fn list(&self, kind: ResourceKind) -> Result<ListResult> {
        match kind {
            ResourceKind::Namespace => {
                self.list_typed::<Namespace>(kind, RawResource::Namespace)
                    .await
            }
            ResourceKind::Node => self.list_typed::<Node>(kind, RawResource::Node).await,
            ResourceKind::Pod => self.list_typed::<Pod>(kind, RawResource::Pod).await,
            ResourceKind::Service => self.list_typed::<Service>(kind, RawResource::Service).await,
            ResourceKind::Endpoints => {
                self.list_typed::<Endpoints>(kind, RawResource::Endpoints)
                    .await
            }
            ResourceKind::ReplicationController => {
                self.list_typed::<ReplicationController>(kind, RawResource::ReplicationController)
                    .await
            }
            ResourceKind::PersistentVolume => {
                self.list_typed::<PersistentVolume>(kind, RawResource::PersistentVolume)
                    .await
            }
            ResourceKind::PersistentVolumeClaim => {
                self.list_typed::<PersistentVolumeClaim>(kind, RawResource::PersistentVolumeClaim)
                    .await
            }
            ResourceKind::ResourceQuota => {
                self.list_typed::<ResourceQuota>(kind, RawResource::ResourceQuota)
                    .await
            }
            ResourceKind::LimitRange => {
                self.list_typed::<LimitRange>(kind, RawResource::LimitRange)
                    .await
            }
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
    ) -> Result<Option<RawResource>> {
        let ns = namespace.unwrap_or_default();
        match kind {
            ResourceKind::Namespace => {
                self.get_cluster::<Namespace>(kind, &name, RawResource::Namespace)
                    .await
            }
            ResourceKind::Node => self.get_cluster::<Node>(kind, &name, RawResource::Node).await,
            ResourceKind::PersistentVolume => {
                self.get_cluster::<PersistentVolume>(kind, &name, RawResource::PersistentVolume)
                    .await
            }
            ResourceKind::Pod => {
                self.get_namespaced::<Pod>(kind, &ns, &name, RawResource::Pod)
                    .await
            }
            ResourceKind::Service => {
                self.get_namespaced::<Service>(kind, &ns, &name, RawResource::Service)
                    .await
            }
            ResourceKind::Endpoints => {
                self.get_namespaced::<Endpoints>(kind, &ns, &name, RawResource::Endpoints)
                    .await
            }
            ResourceKind::ReplicationController => {
                self.get_namespaced::<ReplicationController>(
                    kind,
                    &ns,
                    &name,
                    RawResource::ReplicationController,
                )
                .await
            }
            ResourceKind::PersistentVolumeClaim => {
                self.get_namespaced::<PersistentVolumeClaim>(
                    kind,
                    &ns,
                    &name,
                    RawResource::PersistentVolumeClaim,
                )
                .await
            }
            ResourceKind::ResourceQuota => {
                self.get_namespaced::<ResourceQuota>(kind, &ns, &name, RawResource::ResourceQuota)
                    .await
            }
            ResourceKind::LimitRange => {
                self.get_namespaced::<LimitRange>(kind, &ns, &name, RawResource::LimitRange)
                    .await
            }
        }
    }
}

#[async_trait]
impl Watcher for KubeCollector {
    async fn watch(
        &self,
        kind: ResourceKind,
        from_version: Option<String>,
    ) -> Result<NoticeStream> {
        match kind {
            ResourceKind::Namespace => {
                self.watch_typed::<Namespace>(kind, from_version, RawResource::Namespace)
                    .await
            }
            ResourceKind::Node => {
                self.watch_typed::<Node>(kind, from_version, RawResource::Node)
                    .await
            }
            ResourceKind::Pod => {
                self.watch_typed::<Pod>(kind, from_version, RawResource::Pod)
                    .await
            }
            ResourceKind::Service => {
                self.watch_typed::<Service>(kind, from_version, RawResource::Service)
                    .await
            }
            ResourceKind::Endpoints => {
                self.watch_typed::<Endpoints>(kind, from_version, RawResource::Endpoints)
                    .await
            }
            ResourceKind::ReplicationController => {
                self.watch_typed::<ReplicationController>(
                    kind,
                    from_version,
                    RawResource::ReplicationController,
                )
                .await
            }
            ResourceKind::PersistentVolume => {
                self.watch_typed::<PersistentVolume>(
                    kind,
                    from_version,
                    RawResource::PersistentVolume,
                )
                .await
            }
            ResourceKind::PersistentVolumeClaim => {
                self.watch_typed::<PersistentVolumeClaim>(
                    kind,
                    from_version,
                    RawResource::PersistentVolumeClaim,
                )
                .await
            }
            ResourceKind::ResourceQuota => {
                self.watch_typed::<ResourceQuota>(kind, from_version, RawResource::ResourceQuota)
                    .await
            }
            ResourceKind::LimitRange => {
                self.watch_typed::<LimitRange>(kind, from_version, RawResource::LimitRange)
                    .await
            }
        }
    }
}
