//! Lazy reference registry
//!
//! Parsers declare "this points at a `kind` identified by `key`" and get back a
//! placeholder handle. Identical declarations share one handle, so each
//! target is looked up once per pass. `settle` resolves every handle against
//! the in-pass graph first and the persisted store second.

use std::collections::HashMap;

use serde::Serialize;
use tracing::trace;

use super::Graph;
use crate::kind::EntityKind;
use crate::store::{pick_current, EntityRef, Store};
use crate::Result;

/// How a lazy reference's key should be matched
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ResolutionHint {
    /// Key is the secondary key tuple (e.g. namespace + name)
    SecondaryKey,
    /// Key is a single remote identity
    Identity,
}

/// What a lazy reference points at
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LazyTarget {
    /// Target kind
    pub kind: EntityKind,
    /// Lookup key
    pub key: Vec<String>,
    /// How to match the key
    pub hint: ResolutionHint,
}

impl std::fmt::Display for LazyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.key.join("/"))
    }
}

/// Placeholder handle returned by [`LazyResolver::declare`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LazyRef(usize);

/// Registry of lazy references for one pass
#[derive(Debug, Default)]
pub struct LazyResolver {
    targets: Vec<LazyTarget>,
    index: HashMap<LazyTarget, LazyRef>,
    resolutions: Vec<Option<EntityRef>>,
    settled: bool,
}

impl LazyResolver {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a reference and get its placeholder
    pub fn declare(&mut self, kind: EntityKind, key: Vec<String>, hint: ResolutionHint) -> LazyRef {
        let target = LazyTarget { kind, key, hint };
        if let Some(existing) = self.index.get(&target) {
            return *existing;
        }
        let handle = LazyRef(self.targets.len());
        self.targets.push(target.clone());
        self.index.insert(target, handle);
        handle
    }

    /// Number of distinct declared targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when nothing was declared
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Target behind a handle
    pub fn target(&self, handle: LazyRef) -> Option<&LazyTarget> {
        self.targets.get(handle.0)
    }

    /// True once `settle` has run
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Resolve every declared target
    ///
    /// In-pass nodes win over persisted rows. Returns how many targets stayed
    /// unresolved; those resolve to null.
    pub async fn settle(&mut self, graph: &Graph, store: &dyn Store) -> Result<usize> {
        let mut resolutions = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let resolved = match graph.resolve(target) {
                Some(found) => Some(found),
                None => lookup_persisted(target, store).await?,
            };
            trace!(target = %target, resolved = ?resolved, "Settled lazy reference");
            resolutions.push(resolved);
        }

        let unresolved = resolutions.iter().filter(|r| r.is_none()).count();
        self.resolutions = resolutions;
        self.settled = true;
        Ok(unresolved)
    }

    /// Resolution of a handle; `None` when unresolved or not yet settled
    pub fn resolution(&self, handle: LazyRef) -> Option<&EntityRef> {
        self.resolutions.get(handle.0).and_then(Option::as_ref)
    }
}

async fn lookup_persisted(target: &LazyTarget, store: &dyn Store) -> Result<Option<EntityRef>> {
    match target.hint {
        ResolutionHint::Identity => {
            let Some(identity) = target.key.first() else {
                return Ok(None);
            };
            Ok(store
                .find(target.kind, identity)
                .await?
                .map(|row| row.entity_ref()))
        }
        ResolutionHint::SecondaryKey => {
            let rows = store.find_by_key(target.kind, &target.key).await?;
            Ok(pick_current(rows).map(|row| row.entity_ref()))
        }
    }
}
