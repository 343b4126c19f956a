//! DIFF: per-kind plans against persisted state

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::warn;

use super::{KindStats, UnresolvedReference};
use crate::graph::{GraphNode, LazyResolver, RefField};
use crate::kind::{EntityKind, Removal};
use crate::store::{EntityRef, EntityRow, Store};
use crate::Result;

/// A row to write and the revision it was diffed against
#[derive(Clone, Debug)]
pub(crate) struct PlannedWrite {
    pub row: EntityRow,
    /// `None` for creates
    pub expected_revision: Option<u64>,
}

impl PlannedWrite {
    pub fn is_create(&self) -> bool {
        self.expected_revision.is_none()
    }
}

/// Everything APPLY does for one kind
#[derive(Clone, Debug)]
pub(crate) struct KindPlan {
    pub kind: EntityKind,
    pub writes: Vec<PlannedWrite>,
    /// Identities to archive or delete, per the kind's removal policy
    pub removals: Vec<String>,
    /// Counters settled during DIFF (unchanged, superseded, skipped)
    pub stats: KindStats,
}

impl KindPlan {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            writes: Vec::new(),
            removals: Vec::new(),
            stats: KindStats::default(),
        }
    }

    /// Drop writes whose parent kind failed to commit
    pub fn skip_orphans(&mut self, failed: &BTreeSet<EntityKind>) {
        let before = self.writes.len();
        self.writes.retain(|w| {
            !w.row
                .parent
                .as_ref()
                .is_some_and(|p| failed.contains(&p.kind))
        });
        let skipped = before - self.writes.len();
        if skipped > 0 {
            warn!(kind = %self.kind, skipped, "Parent kind failed, skipping children");
            self.stats.skipped += skipped;
        }
    }
}

/// True when the stored row is a newer observation than `candidate`
pub(crate) fn is_superseded(current: &EntityRow, candidate: &EntityRow) -> bool {
    current.supersedes(candidate)
}

/// State carried across kinds while diffing one pass
pub(crate) struct DiffContext<'a> {
    store: &'a dyn Store,
    full: bool,
    dropped: BTreeSet<EntityKind>,
    protected: HashSet<EntityRef>,
    deletions: Vec<EntityRef>,
    removed: HashSet<EntityRef>,
}

impl<'a> DiffContext<'a> {
    pub fn new(
        store: &'a dyn Store,
        full: bool,
        dropped: BTreeSet<EntityKind>,
        protected: HashSet<EntityRef>,
        deletions: Vec<EntityRef>,
    ) -> Self {
        Self {
            store,
            full,
            dropped,
            protected,
            deletions,
            removed: HashSet::new(),
        }
    }

    /// Plan one kind; kinds must be planned in apply order
    pub async fn plan_kind(
        &mut self,
        kind: EntityKind,
        nodes: Vec<GraphNode>,
        resolver: &LazyResolver,
        graph_refs: &HashSet<EntityRef>,
    ) -> Result<(KindPlan, Vec<UnresolvedReference>)> {
        let mut plan = KindPlan::new(kind);
        let mut unresolved = Vec::new();
        if self.dropped.contains(&kind) {
            return Ok((plan, unresolved));
        }

        let mut rows = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node
                .parent
                .as_ref()
                .is_some_and(|p| self.dropped.contains(&p.kind))
            {
                plan.stats.skipped += 1;
                continue;
            }
            rows.push(to_row(node, resolver, &mut unresolved));
        }

        // Parents whose children this pass enumerates completely
        let complete_parents: Vec<EntityRef> = kind
            .parent_kinds()
            .iter()
            .flat_map(|pk| {
                graph_refs
                    .iter()
                    .chain(self.removed.iter())
                    .filter(move |r| r.kind == *pk)
            })
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let existing = self.existing_rows(kind, &rows, &complete_parents).await?;
        let observed: HashSet<&str> = rows.iter().map(|r| r.identity.as_str()).collect();

        let mut removals = Vec::new();
        if kind.is_child() {
            let complete: HashSet<&EntityRef> = complete_parents.iter().collect();
            for row in existing.values() {
                let owned = row.parent.as_ref().is_some_and(|p| complete.contains(p));
                if owned && !observed.contains(row.identity.as_str()) && is_live_for(kind, row) {
                    removals.push(row.identity.clone());
                }
            }
        } else if self.full {
            for row in existing.values() {
                if !row.is_archived()
                    && !observed.contains(row.identity.as_str())
                    && !self.protected.contains(&row.entity_ref())
                {
                    removals.push(row.identity.clone());
                }
            }
        } else {
            removals.extend(
                self.deletions
                    .iter()
                    .filter(|d| d.kind == kind)
                    .filter(|d| existing.get(&d.identity).is_some_and(|r| is_live_for(kind, r)))
                    .map(|d| d.identity.clone()),
            );
        }
        removals.sort();
        self.removed
            .extend(removals.iter().map(|id| EntityRef::new(kind, id.clone())));
        plan.removals = removals;

        for row in rows {
            match existing.get(&row.identity) {
                None => plan.writes.push(PlannedWrite {
                    row,
                    expected_revision: None,
                }),
                Some(current) if is_superseded(current, &row) => plan.stats.superseded += 1,
                Some(current) if current.same_content(&row) && !current.is_archived() => {
                    plan.stats.unchanged += 1
                }
                Some(current) => plan.writes.push(PlannedWrite {
                    expected_revision: Some(current.revision),
                    row,
                }),
            }
        }

        Ok((plan, unresolved))
    }

    async fn existing_rows(
        &self,
        kind: EntityKind,
        rows: &[EntityRow],
        complete_parents: &[EntityRef],
    ) -> Result<HashMap<String, EntityRow>> {
        let mut existing = HashMap::new();
        if self.full {
            for row in self.store.list(kind).await? {
                existing.insert(row.identity.clone(), row);
            }
            return Ok(existing);
        }

        for row in rows {
            if let Some(current) = self.store.find(kind, &row.identity).await? {
                existing.insert(current.identity.clone(), current);
            }
        }
        for deletion in self.deletions.iter().filter(|d| d.kind == kind) {
            if let Some(current) = self.store.find(kind, &deletion.identity).await? {
                existing.insert(current.identity.clone(), current);
            }
        }
        for parent in complete_parents {
            for child in self.store.list_children(kind, parent).await? {
                existing.insert(child.identity.clone(), child);
            }
        }
        Ok(existing)
    }
}

// Archived rows are already out of the live inventory
fn is_live_for(kind: EntityKind, row: &EntityRow) -> bool {
    match kind.removal() {
        Removal::Archive => !row.is_archived(),
        Removal::Delete => true,
    }
}

/// Replace every reference with its resolution; unresolved ones become null
fn to_row(
    node: GraphNode,
    resolver: &LazyResolver,
    unresolved: &mut Vec<UnresolvedReference>,
) -> EntityRow {
    let owner = node.entity_ref();
    let mut resolve = |field: &str, value: &RefField| -> Option<EntityRef> {
        match value {
            RefField::Resolved(r) => Some(r.clone()),
            RefField::Null => None,
            RefField::Lazy(handle) => {
                let resolved = resolver.resolution(*handle).cloned();
                if resolved.is_none() {
                    let target = resolver
                        .target(*handle)
                        .map(|t| t.to_string())
                        .unwrap_or_default();
                    warn!(
                        owner = %owner,
                        field = %field,
                        target = %target,
                        "Unresolved reference, storing null"
                    );
                    unresolved.push(UnresolvedReference {
                        owner: owner.clone(),
                        field: field.to_string(),
                        target,
                    });
                }
                resolved
            }
        }
    };

    let refs: BTreeMap<String, Option<EntityRef>> = node
        .refs
        .iter()
        .map(|(field, value)| (field.clone(), resolve(field, value)))
        .collect();
    let ref_lists: BTreeMap<String, Vec<EntityRef>> = node
        .ref_lists
        .iter()
        .map(|(field, values)| {
            let resolved: Vec<EntityRef> =
                values.iter().filter_map(|v| resolve(field, v)).collect();
            (field.clone(), resolved)
        })
        .collect();

    EntityRow {
        kind: node.kind,
        identity: node.identity,
        key: node.key,
        name: node.name,
        namespace: node.namespace,
        parent: node.parent,
        resource_version: node.resource_version,
        attributes: node.attributes,
        refs,
        ref_lists,
        archived_at: None,
        revision: 0,
    }
}
