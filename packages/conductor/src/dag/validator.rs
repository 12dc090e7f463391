//! Graph construction and cycle detection over manifest groups.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use uuid::Uuid;

use crate::store::{Manifest, ManifestGroup};

/// Identity of a DAG node: a real group, or a singleton for an ungrouped
/// manifest keyed by its external id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    Group(Uuid),
    Singleton(String),
}

/// A node with its display name. Ordering ties are broken alphabetically by
/// name so renderings are reproducible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    pub key: GroupKey,
    pub name: String,
}

/// The directed group graph.
#[derive(Debug, Default)]
pub struct DagGraph {
    nodes: BTreeMap<GroupKey, String>,
    /// parent -> children
    edges: BTreeMap<GroupKey, BTreeSet<GroupKey>>,
}

impl DagGraph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    pub fn children(&self, key: &GroupKey) -> impl Iterator<Item = &GroupKey> {
        self.edges.get(key).into_iter().flatten()
    }

    fn name_of(&self, key: &GroupKey) -> &str {
        self.nodes.get(key).map(String::as_str).unwrap_or("?")
    }
}

/// Configuration faults surfaced at registration time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// Fatal: the scheduler refuses to start.
    #[error("cyclic dependency between manifest groups: {}", members.join(", "))]
    CyclicDependency { members: Vec<String> },

    /// A dependency edge points outside the deployment.
    #[error("manifest {manifest} depends on unknown manifest {depends_on}")]
    UnknownDependency { manifest: String, depends_on: Uuid },
}

/// Build the group graph for a set of groups and manifests.
pub fn build_graph(
    groups: &[ManifestGroup],
    manifests: &[Manifest],
) -> Result<DagGraph, DagError> {
    let group_names: HashMap<Uuid, &str> =
        groups.iter().map(|g| (g.id, g.name.as_str())).collect();
    let manifest_by_id: HashMap<Uuid, &Manifest> =
        manifests.iter().map(|m| (m.id, m)).collect();

    let node_for = |manifest: &Manifest| -> (GroupKey, String) {
        match manifest.manifest_group_id {
            Some(group_id) => (
                GroupKey::Group(group_id),
                group_names
                    .get(&group_id)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| group_id.to_string()),
            ),
            None => (
                GroupKey::Singleton(manifest.external_id.clone()),
                manifest.external_id.clone(),
            ),
        }
    };

    let mut graph = DagGraph::default();

    for group in groups {
        graph
            .nodes
            .insert(GroupKey::Group(group.id), group.name.clone());
    }
    for manifest in manifests {
        let (key, name) = node_for(manifest);
        graph.nodes.insert(key, name);
    }

    for manifest in manifests {
        let Some(depends_on) = manifest.depends_on_manifest_id else {
            continue;
        };
        let parent = manifest_by_id.get(&depends_on).ok_or_else(|| {
            DagError::UnknownDependency {
                manifest: manifest.external_id.clone(),
                depends_on,
            }
        })?;
        let (parent_key, _) = node_for(parent);
        let (child_key, _) = node_for(manifest);
        if parent_key == child_key {
            // Intra-group ordering is not the DAG's concern.
            continue;
        }
        graph
            .edges
            .entry(parent_key)
            .or_default()
            .insert(child_key);
    }

    Ok(graph)
}

/// Kahn's algorithm. Returns nodes grouped into topological layers (layer 0
/// holds the roots); any node left with a non-zero in-degree means a cycle,
/// reported with its members sorted by name.
pub fn validate(graph: &DagGraph) -> Result<Vec<Vec<DagNode>>, DagError> {
    let mut in_degree: BTreeMap<&GroupKey, usize> =
        graph.nodes.keys().map(|k| (k, 0)).collect();
    for children in graph.edges.values() {
        for child in children {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree += 1;
            }
        }
    }

    // Ready nodes sorted by (name, key) for a stable layer order.
    let by_name = |key: &&GroupKey| (graph.name_of(key).to_string(), (*key).clone());

    let mut ready: Vec<&GroupKey> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    ready.sort_by_key(by_name);

    let mut layers: Vec<Vec<DagNode>> = Vec::new();
    let mut placed = 0usize;

    while !ready.is_empty() {
        let layer: Vec<DagNode> = ready
            .iter()
            .map(|key| DagNode {
                key: (*key).clone(),
                name: graph.name_of(key).to_string(),
            })
            .collect();
        placed += layer.len();

        let mut next: Vec<&GroupKey> = Vec::new();
        for key in ready.drain(..) {
            for child in graph.children(key) {
                let degree = in_degree.get_mut(child).expect("child is a node");
                *degree -= 1;
                if *degree == 0 {
                    next.push(child);
                }
            }
        }
        next.sort_by_key(by_name);
        ready = next;
        layers.push(layer);
    }

    if placed < graph.nodes.len() {
        let mut members: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(k, _)| graph.name_of(k).to_string())
            .collect();
        members.sort();
        return Err(DagError::CyclicDependency { members });
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> ManifestGroup {
        ManifestGroup::named(name)
    }

    fn member(name: &str, group: &ManifestGroup) -> Manifest {
        let mut manifest = Manifest::on_demand(name);
        manifest.external_id = name.to_string();
        manifest.manifest_group_id = Some(group.id);
        manifest
    }

    fn depends(child: &mut Manifest, parent: &Manifest) {
        child.depends_on_manifest_id = Some(parent.id);
    }

    #[test]
    fn linear_chain_layers_in_order() {
        let extract = group("extract");
        let transform = group("transform");
        let load = group("load");

        let a = member("a", &extract);
        let mut b = member("b", &transform);
        depends(&mut b, &a);
        let mut c = member("c", &load);
        depends(&mut c, &b);

        let graph = build_graph(&[extract, transform, load], &[a, b, c]).unwrap();
        let layers = validate(&graph).unwrap();
        let names: Vec<Vec<&str>> = layers
            .iter()
            .map(|l| l.iter().map(|n| n.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["extract"], vec!["transform"], vec!["load"]]);
    }

    #[test]
    fn ungrouped_manifests_are_singleton_nodes() {
        let mut parent = Manifest::on_demand("parent");
        parent.external_id = "parent".to_string();
        let mut child = Manifest::on_demand("child");
        child.external_id = "child".to_string();
        depends(&mut child, &parent);

        let graph = build_graph(&[], &[parent, child]).unwrap();
        assert_eq!(graph.node_count(), 2);
        let layers = validate(&graph).unwrap();
        assert_eq!(layers[0][0].name, "parent");
        assert_eq!(layers[1][0].name, "child");
    }

    #[test]
    fn same_group_edges_are_ignored() {
        let etl = group("etl");
        let a = member("a", &etl);
        let mut b = member("b", &etl);
        depends(&mut b, &a);

        let graph = build_graph(&[etl], &[a, b]).unwrap();
        assert_eq!(graph.edge_count(), 0);
        assert!(validate(&graph).is_ok());
    }

    #[test]
    fn two_node_cycle_is_reported_with_members() {
        let alpha = group("alpha");
        let beta = group("beta");
        let mut a = member("a", &alpha);
        let mut b = member("b", &beta);
        let a_snapshot = a.clone();
        depends(&mut a, &b);
        depends(&mut b, &a_snapshot);

        let graph = build_graph(&[alpha, beta], &[a, b]).unwrap();
        let err = validate(&graph).unwrap_err();
        assert_eq!(
            err,
            DagError::CyclicDependency {
                members: vec!["alpha".to_string(), "beta".to_string()]
            }
        );
    }

    #[test]
    fn cycle_report_excludes_unrelated_nodes() {
        let alpha = group("alpha");
        let beta = group("beta");
        let clean = group("clean");

        let mut a = member("a", &alpha);
        let mut b = member("b", &beta);
        let a_snapshot = a.clone();
        depends(&mut a, &b);
        depends(&mut b, &a_snapshot);
        let c = member("c", &clean);

        let graph = build_graph(&[alpha, beta, clean], &[a, b, c]).unwrap();
        let err = validate(&graph).unwrap_err();
        assert_eq!(
            err,
            DagError::CyclicDependency {
                members: vec!["alpha".to_string(), "beta".to_string()]
            }
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut orphan = Manifest::on_demand("orphan");
        orphan.external_id = "orphan".to_string();
        orphan.depends_on_manifest_id = Some(Uuid::new_v4());

        let err = build_graph(&[], &[orphan]).unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency { .. }));
    }

    #[test]
    fn layer_ties_order_alphabetically() {
        let zeta = group("zeta");
        let alpha = group("alpha");
        let a = member("a", &zeta);
        let b = member("b", &alpha);

        let graph = build_graph(&[zeta, alpha], &[a, b]).unwrap();
        let layers = validate(&graph).unwrap();
        let names: Vec<&str> = layers[0].iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
