use crate::diff::{ActionKind, DiffSet};
use crate::graph::ResourceGraph;
use crate::provider::ProviderRegistry;
use crate::resource::{ResourceId, resolve_references, scan_references};
use crate::state::{ResourceRecord, StateSnapshot, StateStore};
use crate::{EngineError, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which half of a transition a step performs. A Replace entry expands into
/// a Forward step (create the new instance) and a DeleteOld step that runs
/// only after every dependent has completed its own transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StepOp {
    Forward,
    DeleteOld,
}

/// One schedulable unit of work against the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: ResourceId,
    pub action: ActionKind,
    pub op: StepOp,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.op, self.action) {
            (StepOp::Forward, ActionKind::Replace) => write!(f, "create new {}", self.id),
            (StepOp::DeleteOld, ActionKind::Replace) => write!(f, "delete old {}", self.id),
            (StepOp::DeleteOld, _) => write!(f, "delete {}", self.id),
            (StepOp::Forward, action) => write!(f, "{action} {}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Succeeded,
    PartialFailure,
    Aborted,
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ApplyStatus::Succeeded => "succeeded",
            ApplyStatus::PartialFailure => "partial failure",
            ApplyStatus::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Identity-level outcome of an apply. Committed work is already persisted
/// in the snapshot; pending entries were never dispatched and a re-run will
/// pick them up from a fresh diff. An identity appears in both `committed`
/// and `failed` when its replace committed the new instance but the
/// delete-half of the old one failed.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub status: ApplyStatus,
    pub committed: Vec<ResourceId>,
    pub failed: Vec<(ResourceId, String)>,
    pub pending: Vec<ResourceId>,
}

impl ApplyReport {
    /// Convert a non-success into the summary error, for callers that want
    /// `?` semantics over the report.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            ApplyStatus::Succeeded => Ok(self),
            _ => Err(EngineError::PartialApply {
                committed: self.committed.iter().map(ResourceId::to_string).collect(),
                failed: self
                    .failed
                    .iter()
                    .map(|(id, msg)| (id.to_string(), msg.clone()))
                    .collect(),
            }),
        }
    }
}

/// Group diff entries into execution waves: every step's dependencies live
/// in strictly earlier waves; steps within a wave are independent.
///
/// Ordering rules:
/// - forward steps follow the desired graph's dependency edges;
/// - a Replace's delete-half follows its create-half and every dependent's
///   forward step, so nothing ever dangles on the old instance;
/// - deletes run in reverse dependency order, with edges inferred from the
///   reference tokens recorded in the snapshot.
pub fn plan_waves(
    diff: &DiffSet,
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
) -> Result<Vec<Vec<Step>>> {
    let mut steps = DiGraph::<Step, ()>::new();
    let mut forward: HashMap<ResourceId, NodeIndex> = HashMap::new();
    let mut delete: HashMap<ResourceId, NodeIndex> = HashMap::new();

    for entry in &diff.entries {
        match entry.action {
            ActionKind::NoOp => {}
            ActionKind::Create | ActionKind::Update => {
                let node = steps.add_node(Step {
                    id: entry.id.clone(),
                    action: entry.action,
                    op: StepOp::Forward,
                });
                forward.insert(entry.id.clone(), node);
            }
            ActionKind::Replace => {
                let create = steps.add_node(Step {
                    id: entry.id.clone(),
                    action: ActionKind::Replace,
                    op: StepOp::Forward,
                });
                let remove = steps.add_node(Step {
                    id: entry.id.clone(),
                    action: ActionKind::Replace,
                    op: StepOp::DeleteOld,
                });
                forward.insert(entry.id.clone(), create);
                delete.insert(entry.id.clone(), remove);
            }
            ActionKind::Delete => {
                let node = steps.add_node(Step {
                    id: entry.id.clone(),
                    action: ActionKind::Delete,
                    op: StepOp::DeleteOld,
                });
                delete.insert(entry.id.clone(), node);
            }
        }
    }

    // A record still carrying deposed ids from an interrupted replace gets
    // its delete-half rescheduled even though the resource itself is
    // otherwise settled. Replace and Delete entries fold the deposed ids
    // into their own steps.
    for entry in &diff.entries {
        if entry.deposed.is_empty()
            || !matches!(entry.action, ActionKind::NoOp | ActionKind::Update)
        {
            continue;
        }
        let node = steps.add_node(Step {
            id: entry.id.clone(),
            action: ActionKind::Replace,
            op: StepOp::DeleteOld,
        });
        delete.insert(entry.id.clone(), node);
    }

    // Forward steps respect desired-graph dependency order.
    for (id, &node) in &forward {
        for dep in graph.dependencies_of(id) {
            if let Some(&dep_node) = forward.get(&dep) {
                steps.update_edge(dep_node, node, ());
            }
        }
    }

    for entry in &diff.entries {
        match entry.action {
            ActionKind::Replace => {
                let remove = delete[&entry.id];
                steps.update_edge(forward[&entry.id], remove, ());
                // Dependents transition off the old instance first.
                for dependent in graph.dependents_of(&entry.id) {
                    if let Some(&node) = forward.get(&dependent) {
                        steps.update_edge(node, remove, ());
                    }
                }
            }
            ActionKind::Delete => {
                let remove = delete[&entry.id];
                let Some(record) = snapshot.get(&entry.id) else {
                    continue;
                };
                // This resource goes away before anything it referenced.
                for reference in scan_references(&record.properties) {
                    if let Some(&dep_remove) = delete.get(&reference.target) {
                        if dep_remove != remove {
                            steps.update_edge(remove, dep_remove, ());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // Rescheduled delete-halves get the same gating a fresh replace would:
    // the resource's own forward step (if any) and every dependent's
    // transition run first.
    for entry in &diff.entries {
        if entry.deposed.is_empty()
            || !matches!(entry.action, ActionKind::NoOp | ActionKind::Update)
        {
            continue;
        }
        let remove = delete[&entry.id];
        if let Some(&node) = forward.get(&entry.id) {
            steps.update_edge(node, remove, ());
        }
        for dependent in graph.dependents_of(&entry.id) {
            if let Some(&node) = forward.get(&dependent) {
                steps.update_edge(node, remove, ());
            }
        }
    }

    // Surviving resources that referenced a deleted one in the snapshot
    // must complete their transition before the delete runs.
    for (id, &node) in &forward {
        let Some(record) = snapshot.get(id) else {
            continue;
        };
        for reference in scan_references(&record.properties) {
            if graph.contains(&reference.target) {
                continue;
            }
            if let Some(&remove) = delete.get(&reference.target) {
                steps.update_edge(node, remove, ());
            }
        }
    }

    let sorted = toposort(&steps, None).map_err(|cycle| {
        EngineError::Cycle(vec![steps[cycle.node_id()].id.to_string()])
    })?;

    // Wave index = longest dependency chain leading to the step.
    let mut levels: HashMap<NodeIndex, usize> = HashMap::new();
    let mut waves: Vec<Vec<Step>> = Vec::new();
    for node in sorted {
        let level = steps
            .neighbors_directed(node, Direction::Incoming)
            .filter_map(|pred| levels.get(&pred))
            .max()
            .map(|&l| l + 1)
            .unwrap_or(0);
        levels.insert(node, level);
        if level >= waves.len() {
            waves.resize(level + 1, Vec::new());
        }
        waves[level].push(steps[node].clone());
    }

    for wave in &mut waves {
        wave.sort_by(|a, b| (a.op, &a.id).cmp(&(b.op, &b.id)));
    }
    Ok(waves)
}

/// Dispatches waves onto a worker pool and converges the snapshot one
/// resource at a time.
pub struct Scheduler<'a> {
    providers: &'a ProviderRegistry,
    store: &'a StateStore,
    concurrency: usize,
    abort: Arc<AtomicBool>,
}

struct ApplyContext<'a> {
    graph: &'a ResourceGraph,
    // Live view of applied resources, used to resolve reference tokens and
    // to find deposed instances awaiting their delete-half.
    results: Mutex<BTreeMap<ResourceId, ResourceRecord>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(providers: &'a ProviderRegistry, store: &'a StateStore, concurrency: usize) -> Self {
        Self::with_abort(providers, store, concurrency, Arc::new(AtomicBool::new(false)))
    }

    /// Share an abort flag owned by the caller.
    pub fn with_abort(
        providers: &'a ProviderRegistry,
        store: &'a StateStore,
        concurrency: usize,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            providers,
            store,
            concurrency: concurrency.max(1),
            abort,
        }
    }

    /// Handle a caller can flip to stop dispatching new waves. In-flight
    /// provider calls always run to completion.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn execute(
        &self,
        diff: &DiffSet,
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> Result<ApplyReport> {
        let waves = plan_waves(diff, graph, snapshot)?;
        let total: usize = waves.iter().map(Vec::len).sum();
        if total == 0 {
            tracing::info!("nothing to apply");
            return Ok(ApplyReport {
                status: ApplyStatus::Succeeded,
                committed: Vec::new(),
                failed: Vec::new(),
                pending: Vec::new(),
            });
        }

        let token = self.store.begin_apply()?;
        tracing::info!(
            steps = total,
            waves = waves.len(),
            concurrency = self.concurrency,
            "starting apply"
        );

        let context = ApplyContext {
            graph,
            results: Mutex::new(snapshot.resources.clone()),
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .build()
            .map_err(|e| EngineError::State(format!("worker pool: {e}")))?;

        let mut committed: Vec<ResourceId> = Vec::new();
        let mut failed: Vec<(ResourceId, String)> = Vec::new();
        let mut pending: Vec<ResourceId> = Vec::new();
        let mut status = ApplyStatus::Succeeded;

        for (index, wave) in waves.iter().enumerate() {
            if self.abort.load(Ordering::SeqCst) {
                tracing::warn!(wave = index, "apply aborted by caller");
                status = ApplyStatus::Aborted;
                pending.extend(waves[index..].iter().flatten().map(|s| s.id.clone()));
                break;
            }
            if !failed.is_empty() {
                status = ApplyStatus::PartialFailure;
                pending.extend(waves[index..].iter().flatten().map(|s| s.id.clone()));
                break;
            }

            tracing::debug!(wave = index, steps = wave.len(), "dispatching wave");
            let outcomes: Vec<(Step, Result<()>)> = pool.install(|| {
                wave.par_iter()
                    .map(|step| (step.clone(), self.run_step(step, &token, &context)))
                    .collect()
            });

            for (step, outcome) in outcomes {
                match outcome {
                    Ok(()) => {
                        tracing::info!(step = %step, "completed");
                        committed.push(step.id);
                    }
                    Err(e) => {
                        tracing::error!(step = %step, error = %e, "failed");
                        failed.push((step.id, e.to_string()));
                    }
                }
            }
        }

        if !failed.is_empty() && status == ApplyStatus::Succeeded {
            status = ApplyStatus::PartialFailure;
        }

        self.store.end_apply(token)?;

        committed.sort();
        committed.dedup();
        pending.sort();
        pending.dedup();
        pending.retain(|id| !committed.contains(id) && !failed.iter().any(|(f, _)| f == id));

        tracing::info!(
            status = %status,
            committed = committed.len(),
            failed = failed.len(),
            pending = pending.len(),
            "apply finished"
        );
        Ok(ApplyReport {
            status,
            committed,
            failed,
            pending,
        })
    }

    fn run_step(&self, step: &Step, token: &crate::state::LockToken, ctx: &ApplyContext<'_>) -> Result<()> {
        let provider = self.providers.provider_for(&step.id.kind)?;

        match (step.op, step.action) {
            (StepOp::Forward, ActionKind::Create) | (StepOp::Forward, ActionKind::Replace) => {
                let resource = ctx
                    .graph
                    .get(&step.id)
                    .ok_or_else(|| EngineError::State(format!("{} missing from graph", step.id)))?;
                let resolved = resolve_references(&resource.properties, &|target, attr| {
                    lookup_output(&ctx.results, target, attr)
                })?;
                let response = provider
                    .create(&step.id, &resolved)
                    .map_err(|e| step_error(step, e))?;
                let mut record = ResourceRecord::new(
                    step.id.clone(),
                    resource.properties.clone(),
                    response.physical_id,
                    response.outputs,
                );
                // A replace deposes the prior instance: the old physical id
                // is committed alongside the new record so the delete-half
                // survives a crash or a failed delete.
                if step.action == ActionKind::Replace {
                    if let Some(prev) = ctx.results.lock().unwrap().get(&step.id) {
                        record.deposed = prev.deposed.clone();
                        record.deposed.push(prev.physical_id.clone());
                    }
                }
                self.store.commit_resource(token, record.clone())?;
                ctx.results.lock().unwrap().insert(step.id.clone(), record);
                Ok(())
            }
            (StepOp::Forward, ActionKind::Update) => {
                let resource = ctx
                    .graph
                    .get(&step.id)
                    .ok_or_else(|| EngineError::State(format!("{} missing from graph", step.id)))?;
                let previous = ctx
                    .results
                    .lock()
                    .unwrap()
                    .get(&step.id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::State(format!("{} updated but never applied", step.id))
                    })?;
                let resolved = resolve_references(&resource.properties, &|target, attr| {
                    lookup_output(&ctx.results, target, attr)
                })?;
                let outputs = provider
                    .update(&previous.physical_id, &previous.properties, &resolved)
                    .map_err(|e| step_error(step, e))?;
                let mut record = ResourceRecord::new(
                    step.id.clone(),
                    resource.properties.clone(),
                    previous.physical_id,
                    outputs,
                );
                // Pending deposed deletes outlive an in-place update.
                record.deposed = previous.deposed;
                self.store.commit_resource(token, record.clone())?;
                ctx.results.lock().unwrap().insert(step.id.clone(), record);
                Ok(())
            }
            (StepOp::DeleteOld, ActionKind::Replace) => {
                let record = ctx
                    .results
                    .lock()
                    .unwrap()
                    .get(&step.id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::State(format!(
                            "{} has no record to clean deposed instances from",
                            step.id
                        ))
                    })?;
                for physical_id in &record.deposed {
                    provider
                        .delete(physical_id)
                        .map_err(|e| step_error(step, e))?;
                }
                let mut cleared = record;
                cleared.deposed.clear();
                self.store.commit_resource(token, cleared.clone())?;
                ctx.results.lock().unwrap().insert(step.id.clone(), cleared);
                Ok(())
            }
            (StepOp::DeleteOld, ActionKind::Delete) => {
                let record = ctx
                    .results
                    .lock()
                    .unwrap()
                    .get(&step.id)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::State(format!("{} deleted but not in state", step.id))
                    })?;
                for physical_id in &record.deposed {
                    provider
                        .delete(physical_id)
                        .map_err(|e| step_error(step, e))?;
                }
                provider
                    .delete(&record.physical_id)
                    .map_err(|e| step_error(step, e))?;
                self.store.remove_resource(token, &step.id)?;
                ctx.results.lock().unwrap().remove(&step.id);
                Ok(())
            }
            (op, action) => Err(EngineError::State(format!(
                "unschedulable step {op:?}/{action:?} for {}",
                step.id
            ))),
        }
    }
}

/// Resolve a `${type.name.attr}` reference against applied results:
/// provider outputs first, then the `id` pseudo-attribute (physical id),
/// then the dependency's own declared properties.
fn lookup_output(
    results: &Mutex<BTreeMap<ResourceId, ResourceRecord>>,
    target: &ResourceId,
    attribute: &str,
) -> Option<Value> {
    let results = results.lock().unwrap();
    let record = results.get(target)?;
    if let Some(value) = record.outputs.get(attribute) {
        return Some(value.clone());
    }
    if attribute == "id" {
        return Some(Value::String(record.physical_id.clone()));
    }
    record.properties.get(attribute).cloned()
}

fn step_error(step: &Step, error: EngineError) -> EngineError {
    match error {
        already @ EngineError::Provider { .. } => already,
        other => EngineError::Provider {
            identity: step.id.to_string(),
            message: other.to_string(),
        },
    }
}
