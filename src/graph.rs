use crate::resource::{Resource, ResourceId};
use crate::{EngineError, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Acyclic graph of declared resources. Edges point from a dependency to its
/// dependent, so topological order is creation order.
#[derive(Debug)]
pub struct ResourceGraph {
    graph: DiGraph<Resource, ()>,
    index: HashMap<ResourceId, NodeIndex>,
}

impl ResourceGraph {
    /// Build a graph from declarations. Pure transformation: resolves
    /// explicit `depends_on` entries and reference tokens into edges, then
    /// validates acyclicity.
    pub fn build(resources: Vec<Resource>) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for resource in resources {
            let id = resource.id.clone();
            if index.contains_key(&id) {
                return Err(EngineError::DuplicateIdentity(id.to_string()));
            }
            let node = graph.add_node(resource);
            index.insert(id, node);
        }

        // Collect first so we can keep borrowing the graph immutably.
        let deps: Vec<(ResourceId, Vec<ResourceId>)> = graph
            .node_indices()
            .map(|node| (graph[node].id.clone(), graph[node].dependencies()))
            .collect();

        for (id, resource_deps) in deps {
            let dependent = index[&id];
            for dep in resource_deps {
                let Some(&dependency) = index.get(&dep) else {
                    return Err(EngineError::UnknownReference {
                        resource: id.to_string(),
                        reference: dep.to_string(),
                    });
                };
                graph.update_edge(dependency, dependent, ());
            }
        }

        let built = Self { graph, index };
        if toposort(&built.graph, None).is_err() {
            return Err(EngineError::Cycle(built.find_cycle()));
        }
        Ok(built)
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&node| &self.graph[node])
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Resource identities in dependency (creation) order.
    pub fn topo_order(&self) -> Vec<ResourceId> {
        let sorted = toposort(&self.graph, None)
            .expect("graph validated acyclic at build time");
        sorted.into_iter().map(|n| self.graph[n].id.clone()).collect()
    }

    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn dependents_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &ResourceId, direction: Direction) -> Vec<ResourceId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<ResourceId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Subgraph containing the target and its transitive dependencies, for
    /// `--target` runs. The closure keeps every reference resolvable.
    pub fn restrict_to(&self, target: &ResourceId) -> Result<Self> {
        let Some(&start) = self.index.get(target) else {
            return Err(EngineError::UnknownReference {
                resource: "--target".to_string(),
                reference: target.to_string(),
            });
        };

        let mut keep = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !keep.insert(node) {
                continue;
            }
            stack.extend(self.graph.neighbors_directed(node, Direction::Incoming));
        }

        let resources = self
            .graph
            .node_indices()
            .filter(|n| keep.contains(n))
            .map(|n| self.graph[n].clone())
            .collect();
        Self::build(resources)
    }

    /// Walk the dependency edges to name one cycle for the error message.
    fn find_cycle(&self) -> Vec<String> {
        let adjacency: HashMap<ResourceId, Vec<ResourceId>> = self
            .index
            .keys()
            .map(|id| (id.clone(), self.dependents_of(id)))
            .collect();

        let mut starts: Vec<&ResourceId> = self.index.keys().collect();
        starts.sort();
        for start in starts {
            let mut visited = HashSet::new();
            let mut path = Vec::new();
            if let Some(cycle) = dfs_cycle(start, &adjacency, &mut visited, &mut path) {
                return cycle.iter().map(ResourceId::to_string).collect();
            }
        }
        Vec::new()
    }
}

fn dfs_cycle(
    node: &ResourceId,
    adjacency: &HashMap<ResourceId, Vec<ResourceId>>,
    visited: &mut HashSet<ResourceId>,
    path: &mut Vec<ResourceId>,
) -> Option<Vec<ResourceId>> {
    if let Some(pos) = path.iter().position(|n| n == node) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(node.clone());
        return Some(cycle);
    }
    if !visited.insert(node.clone()) {
        return None;
    }

    path.push(node.clone());
    if let Some(neighbors) = adjacency.get(node) {
        for neighbor in neighbors {
            if let Some(cycle) = dfs_cycle(neighbor, adjacency, visited, path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::PropertyBag;
    use serde_json::json;

    fn resource(id: &str, props: &[(&str, &str)], deps: &[&str]) -> Resource {
        let properties: PropertyBag = props
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect();
        Resource::new(ResourceId::parse(id).unwrap(), properties).with_depends_on(
            deps.iter().map(|d| ResourceId::parse(d).unwrap()).collect(),
        )
    }

    #[test]
    fn test_build_with_inferred_edges() {
        let graph = ResourceGraph::build(vec![
            resource("network.vpc", &[], &[]),
            resource("database.main", &[("subnet", "${network.vpc.subnet_id}")], &[]),
            resource("service.api", &[("db", "${database.main.endpoint}")], &[]),
        ])
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(
            graph.dependencies_of(&ResourceId::new("service", "api")),
            vec![ResourceId::new("database", "main")]
        );
        assert_eq!(
            graph.dependents_of(&ResourceId::new("network", "vpc")),
            vec![ResourceId::new("database", "main")]
        );

        let order = graph.topo_order();
        let pos = |id: &str| {
            order
                .iter()
                .position(|r| r == &ResourceId::parse(id).unwrap())
                .unwrap()
        };
        assert!(pos("network.vpc") < pos("database.main"));
        assert!(pos("database.main") < pos("service.api"));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let result = ResourceGraph::build(vec![
            resource("network.vpc", &[], &[]),
            resource("network.vpc", &[], &[]),
        ]);
        assert!(matches!(result, Err(EngineError::DuplicateIdentity(id)) if id == "network.vpc"));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let result = ResourceGraph::build(vec![resource(
            "service.api",
            &[("db", "${database.missing.endpoint}")],
            &[],
        )]);
        assert!(matches!(
            result,
            Err(EngineError::UnknownReference { reference, .. }) if reference == "database.missing"
        ));
    }

    #[test]
    fn test_cycle_names_all_members() {
        let result = ResourceGraph::build(vec![
            resource("a.one", &[], &["b.two"]),
            resource("b.two", &[], &["c.three"]),
            resource("c.three", &[], &["a.one"]),
        ]);

        match result {
            Err(EngineError::Cycle(members)) => {
                for id in ["a.one", "b.two", "c.three"] {
                    assert!(members.contains(&id.to_string()), "missing {id} in {members:?}");
                }
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_restrict_to_keeps_transitive_dependencies() {
        let graph = ResourceGraph::build(vec![
            resource("network.vpc", &[], &[]),
            resource("database.main", &[], &["network.vpc"]),
            resource("service.api", &[], &["database.main"]),
            resource("queue.jobs", &[], &["network.vpc"]),
        ])
        .unwrap();

        let restricted = graph
            .restrict_to(&ResourceId::new("service", "api"))
            .unwrap();
        assert_eq!(restricted.len(), 3);
        assert!(restricted.contains(&ResourceId::new("network", "vpc")));
        assert!(!restricted.contains(&ResourceId::new("queue", "jobs")));
    }

    #[test]
    fn test_restrict_to_unknown_target_fails() {
        let graph = ResourceGraph::build(vec![resource("network.vpc", &[], &[])]).unwrap();
        assert!(graph.restrict_to(&ResourceId::new("service", "api")).is_err());
    }
}
