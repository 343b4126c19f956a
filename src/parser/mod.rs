//! Graph parser/builder
//!
//! Maps raw API objects onto graph nodes. Every outgoing relationship is
//! declared as a lazy reference by `(kind, secondary key)` so parse order
//! never matters: a Pod can be parsed before the Node it runs on.
//!
//! Each kind implements [`Parser`] for [`GraphBuilder`]; [`GraphBuilder::add`]
//! dispatches over the closed [`RawResource`] sum, so a new kind is a
//! compile error until it has a parser.

mod image;
mod namespace;
mod node;
mod pod;
mod quantity;
mod quota;
mod replicator;
mod service;
mod volume;

pub use image::{digest_from_image_id, ImageRef, DEFAULT_REGISTRY_PORT};
pub use quantity::{parse_quantity, quantity_value};

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::{Endpoints, NodeCondition, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::graph::{Graph, GraphNode, LazyResolver, RefField, ResolutionHint};
use crate::kind::{EntityKind, RawResource};
use crate::store::EntityRef;
use crate::tags::TagMapper;
use crate::{Error, Result};

/// Parse one raw object of kind `K` into the graph
pub trait Parser<K> {
    /// Add the nodes for `raw`; on error nothing from `raw` is added
    fn parse(&mut self, raw: &K) -> Result<()>;
}

/// A raw instance that could not be parsed
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParseFailure {
    /// Resource kind
    pub kind: String,
    /// Namespaced name
    pub name: String,
    /// Entity the instance would have produced, when its identity is known
    pub entity: Option<EntityRef>,
    /// What went wrong
    pub message: String,
}

/// Output of a build: the graph plus its pending references
#[derive(Debug, Default)]
pub struct BuiltGraph {
    /// Nodes
    pub graph: Graph,
    /// Declared lazy references, not yet settled
    pub resolver: LazyResolver,
    /// Instances skipped because they could not be parsed
    pub failures: Vec<ParseFailure>,
}

/// A condition in the shape shared by nodes and pods
pub(crate) struct ConditionView<'a> {
    type_: &'a str,
    status: &'a str,
    reason: Option<&'a str>,
    message: Option<&'a str>,
    last_probe: Option<&'a Time>,
    last_transition: Option<&'a Time>,
}

impl<'a> From<&'a NodeCondition> for ConditionView<'a> {
    fn from(c: &'a NodeCondition) -> Self {
        Self {
            type_: &c.type_,
            status: &c.status,
            reason: c.reason.as_deref(),
            message: c.message.as_deref(),
            last_probe: c.last_heartbeat_time.as_ref(),
            last_transition: c.last_transition_time.as_ref(),
        }
    }
}

impl<'a> From<&'a PodCondition> for ConditionView<'a> {
    fn from(c: &'a PodCondition) -> Self {
        Self {
            type_: &c.type_,
            status: &c.status,
            reason: c.reason.as_deref(),
            message: c.message.as_deref(),
            last_probe: c.last_probe_time.as_ref(),
            last_transition: c.last_transition_time.as_ref(),
        }
    }
}

/// Builds the graph for one pass
///
/// State lives only as long as the pass: the graph, the lazy reference
/// registry, the Endpoints index, and the two content caches (images by
/// digest-preferring identity, registries by host and port).
pub struct GraphBuilder<'a> {
    tags: &'a TagMapper,
    graph: Graph,
    resolver: LazyResolver,
    failures: Vec<ParseFailure>,
    endpoints: HashMap<(String, String), Endpoints>,
    image_cache: HashSet<String>,
    registry_cache: HashMap<(String, u16), String>,
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder using the given tag registry
    pub fn new(tags: &'a TagMapper) -> Self {
        Self {
            tags,
            graph: Graph::new(),
            resolver: LazyResolver::new(),
            failures: Vec::new(),
            endpoints: HashMap::new(),
            image_cache: HashSet::new(),
            registry_cache: HashMap::new(),
        }
    }

    /// Build a graph from a set of raw objects
    pub fn build<'r>(
        tags: &'a TagMapper,
        raws: impl IntoIterator<Item = &'r RawResource> + Clone,
    ) -> BuiltGraph {
        let mut builder = Self::new(tags);
        builder.index_endpoints(raws.clone());
        for raw in raws {
            builder.add(raw);
        }
        builder.finish()
    }

    /// Index Endpoints by namespace and name so Services can find theirs
    pub fn index_endpoints<'r>(&mut self, raws: impl IntoIterator<Item = &'r RawResource>) {
        for raw in raws {
            if let RawResource::Endpoints(ep) = raw {
                let key = (
                    ep.metadata.namespace.clone().unwrap_or_default(),
                    ep.metadata.name.clone().unwrap_or_default(),
                );
                self.endpoints.insert(key, ep.clone());
            }
        }
    }

    /// Parse one object; failures are logged and recorded, never propagated
    pub fn add(&mut self, raw: &RawResource) {
        let result = match raw {
            RawResource::Namespace(o) => self.parse(o),
            RawResource::Node(o) => self.parse(o),
            RawResource::Pod(o) => self.parse(o),
            RawResource::Service(o) => self.parse(o),
            // Consumed through the Endpoints index by the Service parser
            RawResource::Endpoints(_) => Ok(()),
            RawResource::ReplicationController(o) => self.parse(o),
            RawResource::PersistentVolume(o) => self.parse(o),
            RawResource::PersistentVolumeClaim(o) => self.parse(o),
            RawResource::ResourceQuota(o) => self.parse(o),
            RawResource::LimitRange(o) => self.parse(o),
        };

        if let Err(e) = result {
            warn!(
                kind = %raw.kind(),
                name = %raw.display_name(),
                error = %e,
                "Skipping unparseable instance"
            );
            let entity = raw
                .kind()
                .entity_kind()
                .zip(raw.uid())
                .map(|(kind, uid)| EntityRef::new(kind, uid));
            self.failures.push(ParseFailure {
                kind: raw.kind().to_string(),
                name: raw.display_name(),
                entity,
                message: e.to_string(),
            });
        }
    }

    /// Finish the build
    pub fn finish(self) -> BuiltGraph {
        debug!(
            nodes = self.graph.len(),
            references = self.resolver.len(),
            failures = self.failures.len(),
            "Graph built"
        );
        BuiltGraph {
            graph: self.graph,
            resolver: self.resolver,
            failures: self.failures,
        }
    }

    // =========================================================================
    // Helpers shared by the per-kind parsers
    // =========================================================================

    pub(crate) fn endpoints_for(&self, namespace: &str, name: &str) -> Option<&Endpoints> {
        self.endpoints
            .get(&(namespace.to_string(), name.to_string()))
    }

    pub(crate) fn insert(&mut self, node: GraphNode) {
        self.graph.insert(node);
    }

    /// Declare a reference by secondary key
    pub(crate) fn lazy(&mut self, kind: EntityKind, key: &[&str]) -> RefField {
        let key = key.iter().map(|s| s.to_string()).collect();
        RefField::Lazy(self.resolver.declare(kind, key, ResolutionHint::SecondaryKey))
    }

    /// Declare a reference by remote identity
    pub(crate) fn lazy_identity(&mut self, kind: EntityKind, identity: &str) -> RefField {
        RefField::Lazy(
            self.resolver
                .declare(kind, vec![identity.to_string()], ResolutionHint::Identity),
        )
    }

    /// Declare a reference only when the key is present
    pub(crate) fn lazy_opt(&mut self, kind: EntityKind, key: Option<Vec<&str>>) -> RefField {
        match key {
            Some(parts) if parts.iter().all(|p| !p.is_empty()) => self.lazy(kind, &parts),
            _ => RefField::Null,
        }
    }

    /// Registry node for `host:port`, created once per pass
    pub(crate) fn registry(&mut self, host: &str, port: u16) -> RefField {
        let cache_key = (host.to_string(), port);
        if !self.registry_cache.contains_key(&cache_key) {
            let identity = format!("{host}:{port}");
            let mut node = GraphNode::new(
                EntityKind::ImageRegistry,
                identity.clone(),
                vec![host.to_string(), port.to_string()],
                identity.clone(),
            );
            node.set("host", host);
            node.set("port", port);
            self.graph.insert(node);
            self.registry_cache.insert(cache_key, identity);
        }
        self.lazy(EntityKind::ImageRegistry, &[host, &port.to_string()])
    }

    /// Image node for a reference, created once per content identity
    ///
    /// The Image row carries only what its identity determines, so every
    /// reference reaching the same content builds the same row regardless of
    /// parse order. The registry serving this particular reference is
    /// returned alongside for the referencing container.
    pub(crate) fn image(&mut self, image: &ImageRef) -> (RefField, RefField) {
        let registry = match image.registry_key() {
            Some((host, port)) => self.registry(&host, port),
            None => RefField::Null,
        };

        let identity = image.content_identity();
        if self.image_cache.insert(identity.clone()) {
            let mut node = GraphNode::new(
                EntityKind::Image,
                identity.clone(),
                vec![identity.clone()],
                match image.digest {
                    Some(_) => identity.clone(),
                    None => image.name.clone(),
                },
            );
            match &image.digest {
                Some(digest) => {
                    node.set("digest", digest.clone());
                    node.set_ref("registry", RefField::Null);
                }
                None => {
                    node.set("name", image.name.clone());
                    node.set("tag", image.tag.as_deref().unwrap_or("latest"));
                    node.set("image_ref", image.full_name());
                    node.set_ref("registry", registry.clone());
                }
            }
            self.graph.insert(node);
        }
        (self.lazy(EntityKind::Image, &[&identity]), registry)
    }

    /// CustomAttribute children for one section of key/value pairs
    pub(crate) fn custom_attributes(
        &mut self,
        parent: &EntityRef,
        section: &str,
        pairs: Option<&BTreeMap<String, String>>,
    ) {
        let Some(pairs) = pairs else {
            return;
        };
        for (name, value) in pairs {
            let discriminator = format!("{section}/{name}");
            let mut node = child_node(EntityKind::CustomAttribute, parent, &discriminator);
            node.set("section", section);
            node.set("name", name.clone());
            node.set("value", value.clone());
            self.graph.insert(node);
        }
    }

    /// Tagging children from the tag registry
    pub(crate) fn taggings(
        &mut self,
        parent: &EntityRef,
        labels: Option<&BTreeMap<String, String>>,
    ) {
        let Some(labels) = labels else {
            return;
        };
        let tags = self.tags.tags_for(parent.kind, labels);
        for tag in tags {
            let mut node = child_node(EntityKind::Tagging, parent, &tag);
            node.set("tag", tag.clone());
            self.graph.insert(node);
        }
    }

    /// Labels as custom attributes plus their taggings
    pub(crate) fn labels(&mut self, parent: &EntityRef, meta: &ObjectMeta) {
        self.custom_attributes(parent, "labels", meta.labels.as_ref());
        self.taggings(parent, meta.labels.as_ref());
    }

    /// Condition children
    pub(crate) fn conditions<'c, C>(
        &mut self,
        parent: &EntityRef,
        conditions: impl IntoIterator<Item = &'c C>,
    ) where
        C: 'c,
        ConditionView<'c>: From<&'c C>,
    {
        for c in conditions {
            let view = ConditionView::from(c);
            let mut node = child_node(EntityKind::Condition, parent, view.type_);
            node.set("type", view.type_);
            node.set("status", view.status);
            node.set_opt("reason", view.reason);
            node.set_opt("message", view.message);
            node.set_opt("last_probe_time", view.last_probe.map(time_value));
            node.set_opt("last_transition_time", view.last_transition.map(time_value));
            self.graph.insert(node);
        }
    }
}

/// Identity and name of a top-level object; the uid is mandatory
pub(crate) fn require_identity(kind: EntityKind, meta: &ObjectMeta) -> Result<(String, String)> {
    let name = meta
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::parse(kind.to_string(), "<unnamed>", "missing metadata.name"))?;
    let uid = meta.uid.clone().filter(|u| !u.is_empty()).ok_or_else(|| {
        Error::parse(
            kind.to_string(),
            qualified(meta.namespace.as_deref(), &name),
            "missing metadata.uid",
        )
    })?;
    Ok((uid, name))
}

/// Base node for a top-level object: identity, key, namespace, version, creation time
pub(crate) fn top_level_node(kind: EntityKind, meta: &ObjectMeta) -> Result<GraphNode> {
    let (uid, name) = require_identity(kind, meta)?;
    let namespace = meta.namespace.as_deref();
    let key = match namespace {
        Some(ns) => vec![ns.to_string(), name.clone()],
        None => vec![name.clone()],
    };
    let mut node = GraphNode::new(kind, uid, key, name)
        .in_namespace(namespace)
        .with_version(crate::kind::parse_resource_version(
            meta.resource_version.as_deref(),
        ));
    node.set_opt("created_on", meta.creation_timestamp.as_ref().map(time_value));
    Ok(node)
}

/// Child node with identity `parent-kind/parent-identity/discriminator`
pub(crate) fn child_node(kind: EntityKind, parent: &EntityRef, discriminator: &str) -> GraphNode {
    let identity = format!("{}/{}/{}", parent.kind, parent.identity, discriminator);
    GraphNode::new(
        kind,
        identity,
        vec![parent.identity.clone(), discriminator.to_string()],
        discriminator,
    )
    .with_parent(parent.clone())
}

pub(crate) fn time_value(t: &Time) -> Value {
    Value::from(t.0.to_rfc3339())
}

pub(crate) fn qualified(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::graph::RefField;

    /// Resolve a ref field against an unsettled builder output for assertions
    pub fn target_of(built: &BuiltGraph, field: &RefField) -> Option<String> {
        match field {
            RefField::Lazy(handle) => built.resolver.target(*handle).map(|t| t.to_string()),
            RefField::Resolved(r) => Some(r.to_string()),
            RefField::Null => None,
        }
    }

    pub fn meta(ns: Option<&str>, name: &str, uid: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: ns.map(String::from),
            uid: Some(uid.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        }
    }
}
