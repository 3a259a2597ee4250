use crate::graph::ResourceGraph;
use crate::provider::{PropertyPolicy, ProviderRegistry};
use crate::resource::{PropertyBag, ResourceId, fingerprint, scan_references};
use crate::state::StateSnapshot;
use crate::Result;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Update,
    Replace,
    Delete,
    NoOp,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Replace => "replace",
            ActionKind::Delete => "delete",
            ActionKind::NoOp => "no-op",
        };
        f.write_str(label)
    }
}

/// One resource's classified transition for an apply.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub id: ResourceId,
    pub action: ActionKind,
    pub old: Option<PropertyBag>,
    pub new: Option<PropertyBag>,
    /// Old physical instances recorded as deposed in the snapshot, carried
    /// so an interrupted replace's delete-half gets rescheduled.
    pub deposed: Vec<String>,
}

/// Full diff between a desired graph and the last-applied snapshot.
/// Entries are ordered: graph resources in creation order, then deletes.
#[derive(Debug, Clone, Default)]
pub struct DiffSet {
    pub entries: Vec<DiffEntry>,
}

impl DiffSet {
    pub fn get(&self, id: &ResourceId) -> Option<&DiffEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn is_noop(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.action == ActionKind::NoOp && e.deposed.is_empty())
    }

    pub fn count(&self, action: ActionKind) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Entries that mutate something, in diff order. A no-op entry still
    /// counts when it carries deposed ids awaiting deletion.
    pub fn changes(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(|e| e.action != ActionKind::NoOp || !e.deposed.is_empty())
    }
}

/// Classify every resource present in the graph or the snapshot.
///
/// Property comparison happens on the raw desired bags (reference tokens
/// intact), which the snapshot also stores; this keeps a re-diff after a
/// successful apply a pure no-op. A resource whose own bag is unchanged but
/// which reads an output of a dependency being created or replaced is
/// upgraded to Update, since its resolved values change.
pub fn diff(
    graph: &ResourceGraph,
    snapshot: &StateSnapshot,
    providers: &ProviderRegistry,
) -> Result<DiffSet> {
    let order = graph.topo_order();
    let mut actions: HashMap<ResourceId, ActionKind> = HashMap::new();
    let mut entries = Vec::new();

    for id in &order {
        let resource = graph.get(id).expect("topo order yields graph members");
        let provider = providers.provider_for(&id.kind)?;

        let action = match snapshot.get(id) {
            None => ActionKind::Create,
            Some(record) => {
                if record.property_hash == fingerprint(&resource.properties)
                    && record.properties == resource.properties
                {
                    dependency_driven_action(id, resource.properties.clone(), graph, &actions)
                } else {
                    classify_change(&record.properties, &resource.properties, |key| {
                        provider.policy(key)
                    })
                }
            }
        };

        tracing::debug!(identity = %id, action = %action, "diffed resource");
        actions.insert(id.clone(), action);
        entries.push(DiffEntry {
            id: id.clone(),
            action,
            old: snapshot.get(id).map(|r| r.properties.clone()),
            new: Some(resource.properties.clone()),
            deposed: snapshot.get(id).map(|r| r.deposed.clone()).unwrap_or_default(),
        });
    }

    // Present in the snapshot, absent from the desired graph.
    for id in snapshot.identities() {
        if graph.contains(id) {
            continue;
        }
        let record = snapshot.get(id).expect("iterating snapshot identities");
        tracing::debug!(identity = %id, "resource removed from desired set");
        entries.push(DiffEntry {
            id: id.clone(),
            action: ActionKind::Delete,
            old: Some(record.properties.clone()),
            new: None,
            deposed: record.deposed.clone(),
        });
    }

    Ok(DiffSet { entries })
}

/// NoOp unless the resource reads an output of a dependency being created
/// or replaced. An in-place update keeps the dependency's physical id, so
/// its outputs stay valid.
fn dependency_driven_action(
    id: &ResourceId,
    properties: PropertyBag,
    graph: &ResourceGraph,
    actions: &HashMap<ResourceId, ActionKind>,
) -> ActionKind {
    let referenced: BTreeSet<ResourceId> = scan_references(&properties)
        .into_iter()
        .map(|r| r.target)
        .collect();

    for dep in graph.dependencies_of(id) {
        if !referenced.contains(&dep) {
            continue;
        }
        match actions.get(&dep) {
            Some(ActionKind::Create) | Some(ActionKind::Replace) => {
                tracing::debug!(identity = %id, dependency = %dep, "update forced by dependency transition");
                return ActionKind::Update;
            }
            _ => {}
        }
    }
    ActionKind::NoOp
}

/// Tie-break across differing properties: Replace dominates Update.
fn classify_change<F>(old: &PropertyBag, new: &PropertyBag, policy: F) -> ActionKind
where
    F: Fn(&str) -> PropertyPolicy,
{
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut action = ActionKind::NoOp;

    for key in keys {
        if old.get(key) == new.get(key) {
            continue;
        }
        match policy(key) {
            PropertyPolicy::RequiresReplacement => return ActionKind::Replace,
            PropertyPolicy::UpdateInPlace => action = ActionKind::Update,
        }
    }
    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CreateResponse, Provider};
    use crate::resource::Resource;
    use crate::state::ResourceRecord;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct PolicyOnly {
        kind: String,
        policy: HashMap<String, PropertyPolicy>,
    }

    impl Provider for PolicyOnly {
        fn kind(&self) -> &str {
            &self.kind
        }

        fn replacement_policy(&self) -> &HashMap<String, PropertyPolicy> {
            &self.policy
        }

        fn create(&self, id: &ResourceId, _props: &PropertyBag) -> crate::Result<CreateResponse> {
            Ok(CreateResponse {
                physical_id: format!("phys-{id}"),
                outputs: PropertyBag::new(),
            })
        }

        fn read(&self, _physical_id: &str) -> crate::Result<PropertyBag> {
            Ok(PropertyBag::new())
        }

        fn update(
            &self,
            _physical_id: &str,
            _old: &PropertyBag,
            _new: &PropertyBag,
        ) -> crate::Result<PropertyBag> {
            Ok(PropertyBag::new())
        }

        fn delete(&self, _physical_id: &str) -> crate::Result<()> {
            Ok(())
        }
    }

    fn registry(replace_keys: &[&str]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.set_fallback(Arc::new(PolicyOnly {
            kind: "any".to_string(),
            policy: replace_keys
                .iter()
                .map(|k| (k.to_string(), PropertyPolicy::RequiresReplacement))
                .collect(),
        }));
        registry
    }

    fn bag(pairs: &[(&str, serde_json::Value)]) -> PropertyBag {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn graph_of(resources: Vec<Resource>) -> ResourceGraph {
        ResourceGraph::build(resources).unwrap()
    }

    fn snapshot_of(records: Vec<ResourceRecord>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        for record in records {
            snapshot.resources.insert(record.identity.clone(), record);
        }
        snapshot
    }

    fn record(id: &str, properties: PropertyBag) -> ResourceRecord {
        ResourceRecord::new(
            ResourceId::parse(id).unwrap(),
            properties,
            format!("phys-{id}"),
            PropertyBag::new(),
        )
    }

    #[test]
    fn test_create_when_absent_from_snapshot() {
        let graph = graph_of(vec![Resource::new(
            ResourceId::new("database", "main"),
            bag(&[("size", json!("small"))]),
        )]);
        let set = diff(&graph, &StateSnapshot::default(), &registry(&[])).unwrap();
        assert_eq!(set.entries.len(), 1);
        assert_eq!(set.entries[0].action, ActionKind::Create);
        assert!(set.entries[0].old.is_none());
    }

    #[test]
    fn test_self_diff_is_all_noop() {
        let properties = bag(&[("size", json!("small")), ("port", json!(5432))]);
        let graph = graph_of(vec![Resource::new(
            ResourceId::new("database", "main"),
            properties.clone(),
        )]);
        let snapshot = snapshot_of(vec![record("database.main", properties)]);

        let set = diff(&graph, &snapshot, &registry(&["engine"])).unwrap();
        assert!(set.is_noop());
    }

    #[test]
    fn test_update_in_place_change() {
        let graph = graph_of(vec![Resource::new(
            ResourceId::new("database", "main"),
            bag(&[("size", json!("large"))]),
        )]);
        let snapshot = snapshot_of(vec![record("database.main", bag(&[("size", json!("small"))]))]);

        let set = diff(&graph, &snapshot, &registry(&["engine"])).unwrap();
        assert_eq!(set.entries[0].action, ActionKind::Update);
    }

    #[test]
    fn test_replacement_policy_change() {
        let graph = graph_of(vec![Resource::new(
            ResourceId::new("database", "main"),
            bag(&[("engine", json!("postgres"))]),
        )]);
        let snapshot = snapshot_of(vec![record(
            "database.main",
            bag(&[("engine", json!("mysql"))]),
        )]);

        let set = diff(&graph, &snapshot, &registry(&["engine"])).unwrap();
        assert_eq!(set.entries[0].action, ActionKind::Replace);
    }

    #[test]
    fn test_replace_dominates_update() {
        let graph = graph_of(vec![Resource::new(
            ResourceId::new("database", "main"),
            bag(&[("engine", json!("postgres")), ("size", json!("large"))]),
        )]);
        let snapshot = snapshot_of(vec![record(
            "database.main",
            bag(&[("engine", json!("mysql")), ("size", json!("small"))]),
        )]);

        let set = diff(&graph, &snapshot, &registry(&["engine"])).unwrap();
        assert_eq!(set.entries[0].action, ActionKind::Replace);
    }

    #[test]
    fn test_added_and_removed_keys_count_as_changes() {
        let graph = graph_of(vec![Resource::new(
            ResourceId::new("database", "main"),
            bag(&[("size", json!("small")), ("backup", json!(true))]),
        )]);
        let snapshot = snapshot_of(vec![record("database.main", bag(&[("size", json!("small"))]))]);

        let set = diff(&graph, &snapshot, &registry(&[])).unwrap();
        assert_eq!(set.entries[0].action, ActionKind::Update);
    }

    #[test]
    fn test_delete_when_absent_from_graph() {
        let graph = graph_of(vec![]);
        let snapshot = snapshot_of(vec![record("database.main", bag(&[("size", json!("small"))]))]);

        let set = diff(&graph, &snapshot, &registry(&[])).unwrap();
        assert_eq!(set.entries.len(), 1);
        assert_eq!(set.entries[0].action, ActionKind::Delete);
        assert!(set.entries[0].new.is_none());
    }

    #[test]
    fn test_dependent_updates_when_dependency_replaced() {
        let db_props = bag(&[("engine", json!("postgres"))]);
        let api_props = bag(&[("db_url", json!("${database.main.endpoint}"))]);

        let graph = graph_of(vec![
            Resource::new(ResourceId::new("database", "main"), db_props),
            Resource::new(ResourceId::new("service", "api"), api_props.clone()),
        ]);
        let snapshot = snapshot_of(vec![
            record("database.main", bag(&[("engine", json!("mysql"))])),
            record("service.api", api_props),
        ]);

        let set = diff(&graph, &snapshot, &registry(&["engine"])).unwrap();
        assert_eq!(
            set.get(&ResourceId::new("database", "main")).unwrap().action,
            ActionKind::Replace
        );
        assert_eq!(
            set.get(&ResourceId::new("service", "api")).unwrap().action,
            ActionKind::Update
        );
    }

    #[test]
    fn test_in_place_dependency_update_keeps_dependent_noop() {
        let api_props = bag(&[("db_url", json!("${database.main.endpoint}"))]);

        let graph = graph_of(vec![
            Resource::new(
                ResourceId::new("database", "main"),
                bag(&[("size", json!("large"))]),
            ),
            Resource::new(ResourceId::new("service", "api"), api_props.clone()),
        ]);
        let snapshot = snapshot_of(vec![
            record("database.main", bag(&[("size", json!("small"))])),
            record("service.api", api_props),
        ]);

        // "size" updates in place; the database keeps its physical id, so
        // the service's resolved reference is unchanged.
        let set = diff(&graph, &snapshot, &registry(&[])).unwrap();
        assert_eq!(
            set.get(&ResourceId::new("database", "main")).unwrap().action,
            ActionKind::Update
        );
        assert_eq!(
            set.get(&ResourceId::new("service", "api")).unwrap().action,
            ActionKind::NoOp
        );
    }

    #[test]
    fn test_deposed_ids_keep_diff_actionable() {
        let properties = bag(&[("engine", json!("postgres"))]);
        let graph = graph_of(vec![Resource::new(
            ResourceId::new("database", "main"),
            properties.clone(),
        )]);
        let mut leftover = record("database.main", properties);
        leftover.deposed = vec!["phys-database.main-old".to_string()];
        let snapshot = snapshot_of(vec![leftover]);

        let set = diff(&graph, &snapshot, &registry(&["engine"])).unwrap();
        let entry = set.get(&ResourceId::new("database", "main")).unwrap();
        assert_eq!(entry.action, ActionKind::NoOp);
        assert_eq!(entry.deposed, vec!["phys-database.main-old".to_string()]);
        assert!(!set.is_noop(), "pending deletes must not plan as no-change");
        assert_eq!(set.changes().count(), 1);
    }

    #[test]
    fn test_explicit_dependency_without_reference_stays_noop() {
        let db_props = bag(&[("engine", json!("postgres"))]);
        let api_props = bag(&[("replicas", json!(2))]);

        let graph = graph_of(vec![
            Resource::new(ResourceId::new("database", "main"), db_props),
            Resource::new(ResourceId::new("service", "api"), api_props.clone())
                .with_depends_on(vec![ResourceId::new("database", "main")]),
        ]);
        let snapshot = snapshot_of(vec![
            record("database.main", bag(&[("engine", json!("mysql"))])),
            record("service.api", api_props),
        ]);

        let set = diff(&graph, &snapshot, &registry(&["engine"])).unwrap();
        assert_eq!(
            set.get(&ResourceId::new("service", "api")).unwrap().action,
            ActionKind::NoOp
        );
    }
}
