use crate::diff::{ActionKind, DiffSet, diff};
use crate::graph::ResourceGraph;
use crate::provider::ProviderRegistry;
use crate::resource::{Resource, ResourceId};
use crate::scheduler::{ApplyReport, Scheduler};
use crate::state::{StateSnapshot, StateStore};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Everything `plan` computed, handed to `apply` so the two share one
/// pipeline.
pub struct PlanOutcome {
    pub graph: ResourceGraph,
    pub snapshot: StateSnapshot,
    pub diff: DiffSet,
}

/// Facade tying the graph builder, diff engine, scheduler, and state store
/// together. All configuration is explicit; there is no ambient context.
pub struct Engine {
    providers: ProviderRegistry,
    store: StateStore,
    concurrency: usize,
    abort: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(providers: ProviderRegistry, store: StateStore, concurrency: usize) -> Self {
        Self {
            providers,
            store,
            concurrency,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Flag that stops dispatch of new waves when set. In-flight provider
    /// calls always finish.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Graph + diff, no mutation. With a target, the desired set narrows to
    /// the target and its transitive dependencies, and deletes of
    /// out-of-target resources are not planned.
    pub fn plan(
        &self,
        resources: Vec<Resource>,
        target: Option<&ResourceId>,
    ) -> Result<PlanOutcome> {
        let mut graph = ResourceGraph::build(resources)?;
        if let Some(target) = target {
            graph = graph.restrict_to(target)?;
        }
        let snapshot = self.store.load()?;
        let mut set = diff(&graph, &snapshot, &self.providers)?;
        if target.is_some() {
            set.entries.retain(|e| e.action != ActionKind::Delete);
        }
        Ok(PlanOutcome {
            graph,
            snapshot,
            diff: set,
        })
    }

    /// Plan then execute.
    pub fn apply(
        &self,
        resources: Vec<Resource>,
        target: Option<&ResourceId>,
    ) -> Result<(PlanOutcome, ApplyReport)> {
        let outcome = self.plan(resources, target)?;
        let report = self.execute(&outcome)?;
        Ok((outcome, report))
    }

    pub fn execute(&self, outcome: &PlanOutcome) -> Result<ApplyReport> {
        let scheduler = Scheduler::with_abort(
            &self.providers,
            &self.store,
            self.concurrency,
            Arc::clone(&self.abort),
        );
        scheduler.execute(&outcome.diff, &outcome.graph, &outcome.snapshot)
    }

    /// Diff against an empty desired graph. With a target, only the target
    /// and its transitive dependents are destroyed; everything else stays.
    pub fn destroy(&self, target: Option<&ResourceId>) -> Result<(PlanOutcome, ApplyReport)> {
        let snapshot = self.store.load()?;
        let recorded = snapshot_resources(&snapshot);

        let desired = match target {
            None => Vec::new(),
            Some(target) => {
                let full = ResourceGraph::build(recorded.clone())?;
                let mut doomed: HashSet<ResourceId> = HashSet::new();
                let mut stack = vec![target.clone()];
                while let Some(id) = stack.pop() {
                    if doomed.insert(id.clone()) {
                        stack.extend(full.dependents_of(&id));
                    }
                }
                recorded
                    .into_iter()
                    .filter(|r| !doomed.contains(&r.id))
                    .collect()
            }
        };

        let graph = ResourceGraph::build(desired)?;
        let set = diff(&graph, &snapshot, &self.providers)?;
        let outcome = PlanOutcome {
            graph,
            snapshot,
            diff: set,
        };
        let report = self.execute(&outcome)?;
        Ok((outcome, report))
    }

    /// Converge back to a prior snapshot: deletes resources created since,
    /// re-applies prior properties to updated ones. Caller-invoked, never
    /// automatic.
    pub fn rollback(&self, before: &StateSnapshot) -> Result<ApplyReport> {
        let desired = snapshot_resources(before);
        let (_, report) = self.apply(desired, None)?;
        Ok(report)
    }
}

/// Rebuild declarations from snapshot records. The recorded bags keep their
/// reference tokens, so inferred edges survive; explicit `depends_on`
/// declarations are not part of the snapshot schema and only matter for
/// not-yet-applied resources.
fn snapshot_resources(snapshot: &StateSnapshot) -> Vec<Resource> {
    snapshot
        .resources
        .values()
        .map(|record| Resource::new(record.identity.clone(), record.properties.clone()))
        .collect()
}
