//! In-pass entity graph
//!
//! Nodes are typed attribute bags. Relationships are [`RefField`]s that hold
//! either a resolved identity, a lazy placeholder, or nothing. The graph
//! indexes nodes by identity and by secondary key so lazy references can be
//! settled against it.

mod lazy;

pub use lazy::{LazyRef, LazyResolver, LazyTarget, ResolutionHint};

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::kind::EntityKind;
use crate::store::EntityRef;

/// One relationship slot on a graph node
#[derive(Clone, Debug, PartialEq)]
pub enum RefField {
    /// Identity already known
    Resolved(EntityRef),
    /// Deferred until the resolver settles
    Lazy(LazyRef),
    /// No relationship
    Null,
}

/// In-memory, not yet committed entity
#[derive(Clone, Debug, PartialEq)]
pub struct GraphNode {
    /// Entity kind
    pub kind: EntityKind,
    /// Remote or synthesized identity
    pub identity: String,
    /// Secondary key
    pub key: Vec<String>,
    /// Human name
    pub name: String,
    /// Namespace for namespaced kinds
    pub namespace: Option<String>,
    /// Owning node for child kinds
    pub parent: Option<EntityRef>,
    /// Resource version of the raw object this node came from
    pub resource_version: Option<u64>,
    /// Flat attributes
    pub attributes: BTreeMap<String, Value>,
    /// Single-valued relationships
    pub refs: BTreeMap<String, RefField>,
    /// Multi-valued relationships
    pub ref_lists: BTreeMap<String, Vec<RefField>>,
}

impl GraphNode {
    /// Create a node with no attributes or relationships
    pub fn new(
        kind: EntityKind,
        identity: impl Into<String>,
        key: Vec<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            identity: identity.into(),
            key,
            name: name.into(),
            namespace: None,
            parent: None,
            resource_version: None,
            attributes: BTreeMap::new(),
            refs: BTreeMap::new(),
            ref_lists: BTreeMap::new(),
        }
    }

    /// Reference to this node
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.identity.clone())
    }

    /// Set the namespace
    pub fn in_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(String::from);
        self
    }

    /// Set the parent
    pub fn with_parent(mut self, parent: EntityRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set the resource version
    pub fn with_version(mut self, version: Option<u64>) -> Self {
        self.resource_version = version;
        self
    }

    /// Set an attribute; `Value::Null` is stored as-is
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Set an attribute only when present, storing null otherwise
    pub fn set_opt<V: Into<Value>>(&mut self, name: &str, value: Option<V>) {
        let value = value.map(Into::into).unwrap_or(Value::Null);
        self.attributes.insert(name.to_string(), value);
    }

    /// Set a single-valued relationship
    pub fn set_ref(&mut self, name: &str, field: RefField) {
        self.refs.insert(name.to_string(), field);
    }

    /// Set a multi-valued relationship
    pub fn set_ref_list(&mut self, name: &str, fields: Vec<RefField>) {
        self.ref_lists.insert(name.to_string(), fields);
    }
}

/// Nodes built during one pass
#[derive(Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<EntityKind, Vec<GraphNode>>,
    by_identity: HashMap<EntityRef, usize>,
    by_key: HashMap<(EntityKind, Vec<String>), Vec<usize>>,
}

impl Graph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node
    ///
    /// A second node with the same identity replaces the first only if its
    /// resource version is not older; this collapses the same object seen
    /// twice in one pass.
    pub fn insert(&mut self, node: GraphNode) {
        let entity = node.entity_ref();
        let nodes = self.nodes.entry(node.kind).or_default();

        if let Some(&idx) = self.by_identity.get(&entity) {
            let existing = &mut nodes[idx];
            if node.resource_version >= existing.resource_version {
                if existing.key != node.key {
                    if let Some(slots) = self.by_key.get_mut(&(node.kind, existing.key.clone())) {
                        slots.retain(|i| *i != idx);
                    }
                    self.by_key
                        .entry((node.kind, node.key.clone()))
                        .or_default()
                        .push(idx);
                }
                *existing = node;
            }
            return;
        }

        let idx = nodes.len();
        self.by_identity.insert(entity, idx);
        self.by_key
            .entry((node.kind, node.key.clone()))
            .or_default()
            .push(idx);
        nodes.push(node);
    }

    /// Nodes of one kind
    pub fn nodes(&self, kind: EntityKind) -> &[GraphNode] {
        self.nodes.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every node, in apply order of kinds
    pub fn iter(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values().flatten()
    }

    /// Total number of nodes
    pub fn len(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    /// True when the graph is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a node with this identity exists
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.by_identity.contains_key(entity)
    }

    /// Get a node by identity
    pub fn get(&self, entity: &EntityRef) -> Option<&GraphNode> {
        let idx = *self.by_identity.get(entity)?;
        self.nodes.get(&entity.kind).and_then(|n| n.get(idx))
    }

    /// Drop every node of a kind
    pub fn remove_kind(&mut self, kind: EntityKind) -> usize {
        let removed = self.nodes.remove(&kind).map(|n| n.len()).unwrap_or(0);
        self.by_identity.retain(|e, _| e.kind != kind);
        self.by_key.retain(|(k, _), _| *k != kind);
        removed
    }

    /// Take every node of a kind out of the graph, leaving the indexes intact
    pub(crate) fn take_nodes(&mut self) -> BTreeMap<EntityKind, Vec<GraphNode>> {
        std::mem::take(&mut self.nodes)
    }

    /// Resolve a lazy target against in-pass nodes
    ///
    /// When several nodes share a secondary key the most recently observed
    /// resource version wins.
    pub fn resolve(&self, target: &LazyTarget) -> Option<EntityRef> {
        match target.hint {
            ResolutionHint::Identity => {
                let entity = EntityRef::new(target.kind, target.key.first()?.clone());
                self.contains(&entity).then_some(entity)
            }
            ResolutionHint::SecondaryKey => {
                let nodes = self.nodes.get(&target.kind)?;
                self.by_key
                    .get(&(target.kind, target.key.clone()))?
                    .iter()
                    .filter_map(|idx| nodes.get(*idx))
                    .max_by_key(|n| n.resource_version)
                    .map(GraphNode::entity_ref)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn pod(uid: &str, name: &str, rv: u64) -> GraphNode {
        GraphNode::new(EntityKind::Pod, uid, key(&["ns1", name]), name).with_version(Some(rv))
    }

    #[test]
    fn secondary_key_collision_picks_newest_version() {
        let mut graph = Graph::new();
        graph.insert(pod("old", "p1", 5));
        graph.insert(pod("new", "p1", 9));

        let target = LazyTarget {
            kind: EntityKind::Pod,
            key: key(&["ns1", "p1"]),
            hint: ResolutionHint::SecondaryKey,
        };
        assert_eq!(graph.resolve(&target).unwrap().identity, "new");
    }

    #[test]
    fn duplicate_identity_keeps_newer_version() {
        let mut graph = Graph::new();
        graph.insert(pod("u1", "p1", 9));
        graph.insert(pod("u1", "p1", 3));
        assert_eq!(graph.len(), 1);
        assert_eq!(
            graph
                .get(&EntityRef::new(EntityKind::Pod, "u1"))
                .unwrap()
                .resource_version,
            Some(9)
        );

        graph.insert(pod("u1", "renamed", 10));
        let target = LazyTarget {
            kind: EntityKind::Pod,
            key: key(&["ns1", "renamed"]),
            hint: ResolutionHint::SecondaryKey,
        };
        assert_eq!(graph.resolve(&target).unwrap().identity, "u1");
        let stale = LazyTarget {
            kind: EntityKind::Pod,
            key: key(&["ns1", "p1"]),
            hint: ResolutionHint::SecondaryKey,
        };
        assert!(graph.resolve(&stale).is_none());
    }

    #[test]
    fn identity_hint_resolves_by_uid() {
        let mut graph = Graph::new();
        graph.insert(pod("u1", "p1", 1));
        let target = LazyTarget {
            kind: EntityKind::Pod,
            key: key(&["u1"]),
            hint: ResolutionHint::Identity,
        };
        assert!(graph.resolve(&target).is_some());
        let missing = LazyTarget {
            key: key(&["u2"]),
            ..target
        };
        assert!(graph.resolve(&missing).is_none());
    }

    #[test]
    fn remove_kind_clears_indexes() {
        let mut graph = Graph::new();
        graph.insert(pod("u1", "p1", 1));
        graph.insert(GraphNode::new(EntityKind::Node, "n1", key(&["node-a"]), "node-a"));

        assert_eq!(graph.remove_kind(EntityKind::Pod), 1);
        assert!(!graph.contains(&EntityRef::new(EntityKind::Pod, "u1")));
        assert_eq!(graph.len(), 1);
        assert!(graph.nodes(EntityKind::Pod).is_empty());
    }

    #[test]
    fn set_opt_stores_null_for_missing() {
        let mut node = pod("u1", "p1", 1);
        node.set_opt::<String>("reason", None);
        node.set("phase", "Running");
        assert_eq!(node.attributes["reason"], Value::Null);
        assert_eq!(node.attributes["phase"], Value::from("Running"));
    }
}
