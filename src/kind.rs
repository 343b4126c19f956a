//! Resource and entity kinds
//!
//! `ResourceKind` names what the API server serves and we watch.
//! `EntityKind` names what we persist. The two differ: Endpoints are only
//! used to correlate Services with Pods, while containers, images and the
//! polymorphic child kinds exist only on the persisted side.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{
    Endpoints, LimitRange, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod,
    ReplicationController, ResourceQuota, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A category of remote object served by the API server
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// core/v1 Namespace
    Namespace,
    /// core/v1 Node
    Node,
    /// core/v1 Pod
    Pod,
    /// core/v1 Service
    Service,
    /// core/v1 Endpoints
    Endpoints,
    /// core/v1 ReplicationController
    ReplicationController,
    /// core/v1 PersistentVolume
    PersistentVolume,
    /// core/v1 PersistentVolumeClaim
    PersistentVolumeClaim,
    /// core/v1 ResourceQuota
    ResourceQuota,
    /// core/v1 LimitRange
    LimitRange,
}

impl ResourceKind {
    /// Every watchable kind, in collection order
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Namespace,
        ResourceKind::Node,
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::Endpoints,
        ResourceKind::ReplicationController,
        ResourceKind::PersistentVolume,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::ResourceQuota,
        ResourceKind::LimitRange,
    ];

    /// Plural resource name as used in API paths
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Namespace => "namespaces",
            Self::Node => "nodes",
            Self::Pod => "pods",
            Self::Service => "services",
            Self::Endpoints => "endpoints",
            Self::ReplicationController => "replicationcontrollers",
            Self::PersistentVolume => "persistentvolumes",
            Self::PersistentVolumeClaim => "persistentvolumeclaims",
            Self::ResourceQuota => "resourcequotas",
            Self::LimitRange => "limitranges",
        }
    }

    /// Whether instances live inside a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            Self::Namespace | Self::Node | Self::PersistentVolume
        )
    }

    /// The persisted kind this resource maps to, if it is persisted at all
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            Self::Namespace => Some(EntityKind::Namespace),
            Self::Node => Some(EntityKind::Node),
            Self::Pod => Some(EntityKind::Pod),
            Self::Service => Some(EntityKind::Service),
            Self::Endpoints => None,
            Self::ReplicationController => Some(EntityKind::ReplicationController),
            Self::PersistentVolume => Some(EntityKind::PersistentVolume),
            Self::PersistentVolumeClaim => Some(EntityKind::PersistentVolumeClaim),
            Self::ResourceQuota => Some(EntityKind::ResourceQuota),
            Self::LimitRange => Some(EntityKind::LimitRange),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| {
                k.plural().eq_ignore_ascii_case(s) || format!("{k:?}").eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| Error::config(format!("unknown resource kind: {s}")))
    }
}

/// How a kind's rows leave the live inventory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// Soft delete: the row stays with an archive marker
    Archive,
    /// Physical delete
    Delete,
}

/// A category of persisted entity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// Namespace (project)
    Namespace,
    /// Cluster node
    Node,
    /// Image registry endpoint, keyed by host and port
    ImageRegistry,
    /// Container image, content-addressed
    Image,
    /// Persistent volume
    PersistentVolume,
    /// Persistent volume claim
    PersistentVolumeClaim,
    /// Replication controller
    ReplicationController,
    /// Service
    Service,
    /// Pod (container group)
    Pod,
    /// Container inside a pod
    Container,
    /// Resource quota
    ResourceQuota,
    /// One resource line of a quota
    QuotaItem,
    /// Limit range
    LimitRange,
    /// One (type, resource) line of a limit range
    LimitItem,
    /// Status condition of a node or pod
    Condition,
    /// Label or node selector entry
    CustomAttribute,
    /// Tag assigned through the label mapping registry
    Tagging,
}

impl EntityKind {
    /// Every persisted kind in apply order (parents before children)
    pub const ALL: [EntityKind; 17] = [
        EntityKind::Namespace,
        EntityKind::Node,
        EntityKind::ImageRegistry,
        EntityKind::Image,
        EntityKind::PersistentVolume,
        EntityKind::PersistentVolumeClaim,
        EntityKind::ReplicationController,
        EntityKind::Service,
        EntityKind::Pod,
        EntityKind::Container,
        EntityKind::ResourceQuota,
        EntityKind::QuotaItem,
        EntityKind::LimitRange,
        EntityKind::LimitItem,
        EntityKind::Condition,
        EntityKind::CustomAttribute,
        EntityKind::Tagging,
    ];

    /// Whether the kind's identity is derived from a parent
    pub fn is_child(&self) -> bool {
        matches!(
            self,
            Self::Container
                | Self::QuotaItem
                | Self::LimitItem
                | Self::Condition
                | Self::CustomAttribute
                | Self::Tagging
        )
    }

    /// How rows of this kind are removed
    pub fn removal(&self) -> Removal {
        match self {
            Self::QuotaItem
            | Self::LimitItem
            | Self::Condition
            | Self::CustomAttribute
            | Self::Tagging => Removal::Delete,
            _ => Removal::Archive,
        }
    }

    /// Kinds that can own rows of this kind; empty for top-level kinds
    pub fn parent_kinds(&self) -> &'static [EntityKind] {
        match self {
            Self::Container => &[Self::Pod],
            Self::QuotaItem => &[Self::ResourceQuota],
            Self::LimitItem => &[Self::LimitRange],
            Self::Condition => &[Self::Node, Self::Pod],
            Self::CustomAttribute | Self::Tagging => &[Self::Namespace, Self::Node, Self::Pod],
            _ => &[],
        }
    }

    /// Resource kinds whose listing must succeed for this kind to be a complete enumeration
    pub fn sources(&self) -> &'static [ResourceKind] {
        use ResourceKind as R;
        match self {
            Self::Namespace => &[R::Namespace],
            Self::Node => &[R::Node],
            Self::ImageRegistry | Self::Image | Self::Container => &[R::Pod],
            Self::PersistentVolume => &[R::PersistentVolume],
            Self::PersistentVolumeClaim => &[R::PersistentVolumeClaim],
            Self::ReplicationController => &[R::ReplicationController],
            Self::Service => &[R::Service, R::Endpoints],
            Self::Pod => &[R::Pod],
            Self::ResourceQuota | Self::QuotaItem => &[R::ResourceQuota],
            Self::LimitRange | Self::LimitItem => &[R::LimitRange],
            Self::Condition => &[R::Node, R::Pod],
            Self::CustomAttribute | Self::Tagging => &[R::Namespace, R::Node, R::Pod],
        }
    }

    /// Position in apply order
    pub fn apply_order(&self) -> usize {
        EntityKind::ALL
            .iter()
            .position(|k| k == self)
            .unwrap_or(EntityKind::ALL.len())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Raw representation of one remote instance as served by the API server
#[derive(Clone, Debug, PartialEq)]
pub enum RawResource {
    /// Namespace object
    Namespace(Namespace),
    /// Node object
    Node(Node),
    /// Pod object
    Pod(Pod),
    /// Service object
    Service(Service),
    /// Endpoints object
    Endpoints(Endpoints),
    /// ReplicationController object
    ReplicationController(ReplicationController),
    /// PersistentVolume object
    PersistentVolume(PersistentVolume),
    /// PersistentVolumeClaim object
    PersistentVolumeClaim(PersistentVolumeClaim),
    /// ResourceQuota object
    ResourceQuota(ResourceQuota),
    /// LimitRange object
    LimitRange(LimitRange),
}

impl RawResource {
    /// Kind of this instance
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Namespace(_) => ResourceKind::Namespace,
            Self::Node(_) => ResourceKind::Node,
            Self::Pod(_) => ResourceKind::Pod,
            Self::Service(_) => ResourceKind::Service,
            Self::Endpoints(_) => ResourceKind::Endpoints,
            Self::ReplicationController(_) => ResourceKind::ReplicationController,
            Self::PersistentVolume(_) => ResourceKind::PersistentVolume,
            Self::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            Self::ResourceQuota(_) => ResourceKind::ResourceQuota,
            Self::LimitRange(_) => ResourceKind::LimitRange,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Namespace(o) => &o.metadata,
            Self::Node(o) => &o.metadata,
            Self::Pod(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Endpoints(o) => &o.metadata,
            Self::ReplicationController(o) => &o.metadata,
            Self::PersistentVolume(o) => &o.metadata,
            Self::PersistentVolumeClaim(o) => &o.metadata,
            Self::ResourceQuota(o) => &o.metadata,
            Self::LimitRange(o) => &o.metadata,
        }
    }

    /// Remote identity assigned by the API server
    pub fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    /// Object name (empty when missing)
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, if namespaced
    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    /// Resource version as served (opaque string)
    pub fn resource_version_str(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    /// Resource version parsed as a number, when numeric
    pub fn resource_version(&self) -> Option<u64> {
        parse_resource_version(self.resource_version_str())
    }

    /// `namespace/name` or just `name`, for logs
    pub fn display_name(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }

    /// Identity used for notice deduplication
    ///
    /// Prefers the uid; falls back to the namespaced name for objects that
    /// somehow lack one, so they still collapse correctly.
    pub fn dedup_key(&self) -> String {
        match self.uid() {
            Some(uid) => uid.to_string(),
            None => format!("name:{}", self.display_name()),
        }
    }
}

/// Parse an opaque resource version into a number when possible
pub fn parse_resource_version(version: Option<&str>) -> Option<u64> {
    version.and_then(|v| v.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ns: &str, name: &str, uid: Option<&str>, rv: &str) -> RawResource {
        RawResource::Pod(Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                uid: uid.map(String::from),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn resource_kind_parses_plural_and_variant_names() {
        assert_eq!("pods".parse::<ResourceKind>().unwrap(), ResourceKind::Pod);
        assert_eq!(
            "PersistentVolumeClaim".parse::<ResourceKind>().unwrap(),
            ResourceKind::PersistentVolumeClaim
        );
        assert!("deployments".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn endpoints_are_not_persisted() {
        assert_eq!(ResourceKind::Endpoints.entity_kind(), None);
        assert_eq!(ResourceKind::Pod.entity_kind(), Some(EntityKind::Pod));
    }

    #[test]
    fn cluster_scoped_kinds() {
        assert!(!ResourceKind::Node.is_namespaced());
        assert!(!ResourceKind::PersistentVolume.is_namespaced());
        assert!(ResourceKind::PersistentVolumeClaim.is_namespaced());
    }

    #[test]
    fn parents_apply_before_children() {
        assert!(EntityKind::Pod.apply_order() < EntityKind::Container.apply_order());
        assert!(EntityKind::Image.apply_order() < EntityKind::Container.apply_order());
        assert!(EntityKind::ImageRegistry.apply_order() < EntityKind::Image.apply_order());
        assert!(EntityKind::Node.apply_order() < EntityKind::Condition.apply_order());
    }

    #[test]
    fn every_child_kind_has_parents_applied_first() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.is_child(), !kind.parent_kinds().is_empty(), "{kind}");
            for parent in kind.parent_kinds() {
                assert!(parent.apply_order() < kind.apply_order(), "{parent} before {kind}");
            }
        }
    }

    #[test]
    fn child_kinds_delete_physically_except_containers() {
        assert_eq!(EntityKind::Condition.removal(), Removal::Delete);
        assert_eq!(EntityKind::Container.removal(), Removal::Archive);
        assert!(EntityKind::Container.is_child());
        assert!(!EntityKind::Image.is_child());
    }

    #[test]
    fn raw_resource_accessors() {
        let raw = pod("ns1", "p1", Some("uid-1"), "42");
        assert_eq!(raw.kind(), ResourceKind::Pod);
        assert_eq!(raw.uid(), Some("uid-1"));
        assert_eq!(raw.display_name(), "ns1/p1");
        assert_eq!(raw.resource_version(), Some(42));
        assert_eq!(raw.dedup_key(), "uid-1");
    }

    #[test]
    fn dedup_key_falls_back_to_name() {
        let raw = pod("ns1", "p1", None, "x");
        assert_eq!(raw.dedup_key(), "name:ns1/p1");
        assert_eq!(raw.resource_version(), None);
    }
}
