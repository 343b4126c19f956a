//! Resource collection from the API server
//!
//! Two capabilities, kept separate so tests can fake either one:
//! [`Lister`] returns a full snapshot of a kind (or a single object by key),
//! [`Watcher`] opens a change stream for a kind from a resource version.

mod kube_collector;

pub use kube_collector::{KubeCollector, DEFAULT_PAGE_SIZE};

use async_trait::async_trait;
use futures::stream::BoxStream;

#[cfg(test)]
use mockall::automock;

use crate::kind::{RawResource, ResourceKind};
use crate::Result;

/// Snapshot of one kind
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListResult {
    /// Every instance currently served
    pub items: Vec<RawResource>,
    /// Collection resource version, used to start a watch right after the list
    pub resource_version: Option<String>,
}

/// Change type carried by an object-bearing notice
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// Object created
    Added,
    /// Object changed
    Modified,
    /// Object removed
    Deleted,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        })
    }
}

/// Status carried by an ERROR notice
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchFailure {
    /// HTTP-style status code (410 means the start version expired)
    pub code: u16,
    /// Machine-readable reason (e.g. "Expired", "Gone")
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl WatchFailure {
    /// True when the server says our resource version is too old to resume from
    pub fn is_stale_version(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }
}

/// One message from a watch stream
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// The object was created
    Added(RawResource),
    /// The object changed; carries the complete current representation
    Modified(RawResource),
    /// The object was removed; carries its last representation
    Deleted(RawResource),
    /// The stream attempt failed; the worker reconnects
    Error(WatchFailure),
}

impl Notice {
    /// Split an object-bearing notice into its change type and object
    pub fn into_change(self) -> Option<(ChangeType, RawResource)> {
        match self {
            Self::Added(o) => Some((ChangeType::Added, o)),
            Self::Modified(o) => Some((ChangeType::Modified, o)),
            Self::Deleted(o) => Some((ChangeType::Deleted, o)),
            Self::Error(_) => None,
        }
    }

    /// Resource version of the carried object
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o.resource_version_str(),
            Self::Error(_) => None,
        }
    }
}

/// Stream of notices; an `Err` item means the connection is unusable
pub type NoticeStream = BoxStream<'static, Result<Notice>>;

/// Trait for full-list collection
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Lister: Send + Sync {
    /// List every instance of a kind
    ///
    /// A kind the server does not serve yields an empty result rather than
    /// an error.
    async fn list(&self, kind: ResourceKind) -> Result<ListResult>;

    /// Fetch a single instance by namespace and name
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
    ) -> Result<Option<RawResource>>;
}

/// Trait for change streams
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Open a watch on a kind
    ///
    /// `from_version = None` requests a fresh baseline: the server replays
    /// every current object as ADDED before streaming changes.
    async fn watch(&self, kind: ResourceKind, from_version: Option<String>) -> Result<NoticeStream>;
}
