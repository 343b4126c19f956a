//! Reconciliation engine
//!
//! A pass walks `Init -> Build -> Resolve -> Diff -> Apply -> Done`:
//!
//! - **Build**: raw objects become graph nodes with lazy references
//! - **Resolve**: every lazy reference settles against the pass, then the store
//! - **Diff**: per kind, in apply order, compute creates, updates and removals
//! - **Apply**: commit each kind independently with the selected strategy
//!
//! The scope decides what absence means. A full pass is a complete
//! enumeration of the kinds it could list, so anything persisted but not
//! observed is archived. A targeted pass only touches what its notices
//! named; deletions are explicit.

mod apply;
mod diff;

pub use apply::ApplyStrategy;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::graph::{Graph, LazyResolver};
use crate::kind::{EntityKind, RawResource, ResourceKind};
use crate::parser::{BuiltGraph, GraphBuilder, ParseFailure};
use crate::store::{EntityRef, Store};
use crate::tags::TagMapper;
use crate::{Error, Result};

use diff::{DiffContext, KindPlan};

/// What a pass is allowed to conclude from absence
#[derive(Clone, Debug, PartialEq)]
pub enum Scope {
    /// Complete enumeration of the listed kinds
    Full {
        /// Entity kinds whose every source listing succeeded
        enumerated: BTreeSet<EntityKind>,
    },
    /// Only the named entities participate
    Targeted {
        /// Entities removed by DELETED notices
        deletions: Vec<EntityRef>,
    },
}

impl Scope {
    /// Full scope derived from the resource kinds that listed successfully
    pub fn full(listed: &BTreeSet<ResourceKind>) -> Self {
        let enumerated = EntityKind::ALL
            .into_iter()
            .filter(|k| k.sources().iter().all(|s| listed.contains(s)))
            .collect();
        Scope::Full { enumerated }
    }

    /// Full scope over every kind
    pub fn full_all() -> Self {
        Scope::full(&ResourceKind::ALL.into_iter().collect())
    }

    /// Targeted scope with explicit deletions
    pub fn targeted(deletions: Vec<EntityRef>) -> Self {
        Scope::Targeted { deletions }
    }

    /// True for full scope
    pub fn is_full(&self) -> bool {
        matches!(self, Scope::Full { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Scope::Full { .. } => "full",
            Scope::Targeted { .. } => "targeted",
        }
    }
}

/// Phase of a reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PassPhase {
    /// Created, nothing done yet
    Init,
    /// Graph built
    Build,
    /// Lazy references settled
    Resolve,
    /// Per-kind plans computed
    Diff,
    /// Plans committed
    Apply,
    /// Report produced
    Done,
}

impl fmt::Display for PassPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Per-kind outcome counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    /// New rows written
    pub created: usize,
    /// Existing rows rewritten (including un-archived rows)
    pub updated: usize,
    /// Observed rows whose content did not change
    pub unchanged: usize,
    /// Rows soft-deleted
    pub archived: usize,
    /// Rows physically removed
    pub deleted: usize,
    /// Rows skipped because the store already holds a newer version
    pub superseded: usize,
    /// Rows skipped because their parent could not be committed
    pub skipped: usize,
}

impl KindStats {
    /// Number of store mutations
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.archived + self.deleted
    }

    fn add(&mut self, other: &KindStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.archived += other.archived;
        self.deleted += other.deleted;
        self.superseded += other.superseded;
        self.skipped += other.skipped;
    }
}

/// A lazy reference that settled to null
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnresolvedReference {
    /// Entity holding the reference
    pub owner: EntityRef,
    /// Reference field name
    pub field: String,
    /// What it pointed at
    pub target: String,
}

/// Outcome of one reconciliation pass
#[derive(Clone, Debug, Serialize)]
pub struct PassReport {
    /// `full` or `targeted`
    pub scope: &'static str,
    /// Strategy used in APPLY
    pub strategy: ApplyStrategy,
    /// When the pass started
    pub started_at: DateTime<Utc>,
    /// Counters per kind
    pub kinds: BTreeMap<EntityKind, KindStats>,
    /// Kinds left out of a full pass because a source listing failed
    pub dropped_kinds: Vec<EntityKind>,
    /// References stored as null
    pub unresolved: Vec<UnresolvedReference>,
    /// Instances skipped during BUILD
    pub parse_failures: Vec<ParseFailure>,
    /// Kinds whose APPLY failed, with the error
    pub failed_kinds: BTreeMap<EntityKind, String>,
}

impl PassReport {
    fn new(scope: &Scope, strategy: ApplyStrategy) -> Self {
        Self {
            scope: scope.name(),
            strategy,
            started_at: Utc::now(),
            kinds: BTreeMap::new(),
            dropped_kinds: Vec::new(),
            unresolved: Vec::new(),
            parse_failures: Vec::new(),
            failed_kinds: BTreeMap::new(),
        }
    }

    /// True when every kind committed
    pub fn is_success(&self) -> bool {
        self.failed_kinds.is_empty()
    }

    /// Counters summed over every kind
    pub fn totals(&self) -> KindStats {
        let mut total = KindStats::default();
        for stats in self.kinds.values() {
            total.add(stats);
        }
        total
    }

    /// Counters for one kind
    pub fn stats(&self, kind: EntityKind) -> KindStats {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }
}

/// One reconciliation pass, driven phase by phase
pub struct Pass {
    phase: PassPhase,
    scope: Scope,
    strategy: ApplyStrategy,
    graph: Graph,
    resolver: LazyResolver,
    plans: Vec<KindPlan>,
    report: PassReport,
}

impl Pass {
    /// Start a pass
    pub fn new(scope: Scope, strategy: ApplyStrategy) -> Self {
        let report = PassReport::new(&scope, strategy);
        Self {
            phase: PassPhase::Init,
            scope,
            strategy,
            graph: Graph::new(),
            resolver: LazyResolver::new(),
            plans: Vec::new(),
            report,
        }
    }

    /// Current phase
    pub fn phase(&self) -> PassPhase {
        self.phase
    }

    fn advance(&mut self, from: PassPhase, to: PassPhase) -> Result<()> {
        if self.phase != from {
            return Err(Error::internal_with_context(
                "pass",
                format!("cannot enter {to} from {}, expected {from}", self.phase),
            ));
        }
        debug!(scope = self.scope.name(), from = %from, to = %to, "Pass phase transition");
        self.phase = to;
        Ok(())
    }

    /// BUILD from raw objects
    pub fn build<'r>(
        &mut self,
        tags: &TagMapper,
        raws: impl IntoIterator<Item = &'r RawResource> + Clone,
    ) -> Result<()> {
        self.advance(PassPhase::Init, PassPhase::Build)?;
        let built = GraphBuilder::build(tags, raws);
        self.accept(built);
        Ok(())
    }

    /// BUILD from a graph built elsewhere
    pub fn build_from(&mut self, built: BuiltGraph) -> Result<()> {
        self.advance(PassPhase::Init, PassPhase::Build)?;
        self.accept(built);
        Ok(())
    }

    fn accept(&mut self, built: BuiltGraph) {
        self.graph = built.graph;
        self.resolver = built.resolver;
        self.report.parse_failures = built.failures;

        if let Scope::Full { enumerated } = &self.scope {
            for kind in EntityKind::ALL {
                if !kind.is_child() && !enumerated.contains(&kind) {
                    let dropped = self.graph.remove_kind(kind);
                    warn!(
                        kind = %kind,
                        nodes = dropped,
                        "Source listing failed, leaving kind out of full pass"
                    );
                    self.report.dropped_kinds.push(kind);
                }
            }
        }
    }

    /// RESOLVE lazy references
    pub async fn resolve(&mut self, store: &dyn Store) -> Result<()> {
        self.advance(PassPhase::Build, PassPhase::Resolve)?;
        let unresolved = self.resolver.settle(&self.graph, store).await?;
        debug!(
            references = self.resolver.len(),
            unresolved, "Lazy references settled"
        );
        Ok(())
    }

    /// DIFF every kind against the store
    ///
    /// A kind whose diff fails (store read error) is recorded as failed and
    /// the remaining kinds still diff.
    pub async fn diff(&mut self, store: &dyn Store) -> Result<()> {
        self.advance(PassPhase::Resolve, PassPhase::Diff)?;

        let protected: HashSet<EntityRef> = self
            .report
            .parse_failures
            .iter()
            .filter_map(|f| f.entity.clone())
            .collect();
        let deletions = match &self.scope {
            Scope::Targeted { deletions } => deletions.clone(),
            Scope::Full { .. } => Vec::new(),
        };
        let mut ctx = DiffContext::new(
            store,
            self.scope.is_full(),
            self.report.dropped_kinds.iter().copied().collect(),
            protected,
            deletions,
        );

        let graph_refs: HashSet<EntityRef> = self.graph.iter().map(|n| n.entity_ref()).collect();
        let mut nodes = self.graph.take_nodes();
        for kind in EntityKind::ALL {
            let kind_nodes = nodes.remove(&kind).unwrap_or_default();
            match ctx
                .plan_kind(kind, kind_nodes, &self.resolver, &graph_refs)
                .await
            {
                Ok((plan, unresolved)) => {
                    self.report.unresolved.extend(unresolved);
                    self.plans.push(plan);
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "Diff failed, kind left out of pass");
                    self.report.failed_kinds.insert(kind, e.to_string());
                }
            }
        }
        Ok(())
    }

    /// APPLY every plan, kind by kind
    pub async fn apply(&mut self, store: &dyn Store) -> Result<()> {
        self.advance(PassPhase::Diff, PassPhase::Apply)?;
        let at = self.report.started_at;

        for mut plan in std::mem::take(&mut self.plans) {
            let kind = plan.kind;
            let failed: BTreeSet<EntityKind> = self.report.failed_kinds.keys().copied().collect();
            plan.skip_orphans(&failed);

            match apply::apply_plan(store, self.strategy, &plan, at).await {
                Ok(stats) => {
                    if stats.writes() > 0 {
                        debug!(kind = %kind, ?stats, "Applied");
                    }
                    self.report.kinds.insert(kind, stats);
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "Apply failed");
                    self.report.kinds.insert(kind, plan.stats);
                    self.report.failed_kinds.insert(kind, e.to_string());
                }
            }
        }
        Ok(())
    }

    /// Finish and hand back the report
    pub fn finish(mut self) -> Result<PassReport> {
        self.advance(PassPhase::Apply, PassPhase::Done)?;
        Ok(self.report)
    }
}

/// Drives reconciliation passes against one store
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    tags: Arc<TagMapper>,
    strategy: ApplyStrategy,
}

impl Engine {
    /// Create an engine
    pub fn new(store: Arc<dyn Store>, tags: Arc<TagMapper>, strategy: ApplyStrategy) -> Self {
        Self {
            store,
            tags,
            strategy,
        }
    }

    /// Store passes write to
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Strategy used in APPLY
    pub fn strategy(&self) -> ApplyStrategy {
        self.strategy
    }

    /// Run a complete pass over raw objects
    pub async fn reconcile<'r>(
        &self,
        raws: impl IntoIterator<Item = &'r RawResource> + Clone,
        scope: Scope,
    ) -> Result<PassReport> {
        let mut pass = Pass::new(scope, self.strategy);
        pass.build(&self.tags, raws)?;
        self.drive(pass).await
    }

    /// Run a pass over an already built graph
    pub async fn reconcile_built(&self, built: BuiltGraph, scope: Scope) -> Result<PassReport> {
        let mut pass = Pass::new(scope, self.strategy);
        pass.build_from(built)?;
        self.drive(pass).await
    }

    async fn drive(&self, mut pass: Pass) -> Result<PassReport> {
        let store = self.store.as_ref();
        pass.resolve(store).await?;
        pass.diff(store).await?;
        pass.apply(store).await?;
        let report = pass.finish()?;

        let totals = report.totals();
        if report.is_success() {
            info!(
                scope = report.scope,
                strategy = %report.strategy,
                created = totals.created,
                updated = totals.updated,
                archived = totals.archived,
                deleted = totals.deleted,
                unchanged = totals.unchanged,
                unresolved = report.unresolved.len(),
                parse_failures = report.parse_failures.len(),
                "Reconciliation pass complete"
            );
        } else {
            warn!(
                scope = report.scope,
                failed_kinds = ?report.failed_kinds.keys().collect::<Vec<_>>(),
                "Reconciliation pass finished with failed kinds"
            );
        }
        Ok(report)
    }
}
