//! Layered layout with barycenter ordering.
//!
//! Takes the topological layers from the validator and reorders each layer
//! to reduce edge crossings: a handful of alternating down/up sweeps, each
//! placing nodes at the mean position of their neighbors in the adjacent
//! layer. Ties and isolated nodes fall back to alphabetical order, so the
//! same graph always renders the same way.

use std::collections::HashMap;

use super::validator::{DagGraph, DagNode, GroupKey};

const SWEEPS: usize = 4;

/// Final dashboard layout: layers of nodes in render order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagLayout {
    pub layers: Vec<Vec<DagNode>>,
}

impl DagLayout {
    /// `(layer, position)` of every node, for renderers that draw edges.
    pub fn positions(&self) -> HashMap<GroupKey, (usize, usize)> {
        let mut positions = HashMap::new();
        for (layer_index, layer) in self.layers.iter().enumerate() {
            for (position, node) in layer.iter().enumerate() {
                positions.insert(node.key.clone(), (layer_index, position));
            }
        }
        positions
    }
}

/// Order each layer by neighbor barycenters.
pub fn layout(graph: &DagGraph, mut layers: Vec<Vec<DagNode>>) -> DagLayout {
    if layers.len() < 2 {
        return DagLayout { layers };
    }

    for sweep in 0..SWEEPS {
        let downward = sweep % 2 == 0;
        if downward {
            for i in 1..layers.len() {
                let anchor = index_of(&layers[i - 1]);
                reorder(&mut layers[i], |node| {
                    barycenter(parents_in(graph, node, &anchor))
                });
            }
        } else {
            for i in (0..layers.len() - 1).rev() {
                let anchor = index_of(&layers[i + 1]);
                reorder(&mut layers[i], |node| {
                    barycenter(children_in(graph, node, &anchor))
                });
            }
        }
    }

    DagLayout { layers }
}

fn index_of(layer: &[DagNode]) -> HashMap<GroupKey, usize> {
    layer
        .iter()
        .enumerate()
        .map(|(i, n)| (n.key.clone(), i))
        .collect()
}

fn parents_in(
    graph: &DagGraph,
    node: &DagNode,
    anchor: &HashMap<GroupKey, usize>,
) -> Vec<usize> {
    anchor
        .iter()
        .filter(|(key, _)| graph.children(key).any(|child| *child == node.key))
        .map(|(_, position)| *position)
        .collect()
}

fn children_in(
    graph: &DagGraph,
    node: &DagNode,
    anchor: &HashMap<GroupKey, usize>,
) -> Vec<usize> {
    graph
        .children(&node.key)
        .filter_map(|child| anchor.get(child).copied())
        .collect()
}

fn barycenter(neighbor_positions: Vec<usize>) -> Option<f64> {
    if neighbor_positions.is_empty() {
        return None;
    }
    let sum: usize = neighbor_positions.iter().sum();
    Some(sum as f64 / neighbor_positions.len() as f64)
}

fn reorder(layer: &mut [DagNode], score: impl Fn(&DagNode) -> Option<f64>) {
    // Nodes without neighbors keep a stable alphabetical score so they do
    // not jitter between sweeps.
    let mut keyed: Vec<(f64, DagNode)> = layer
        .iter()
        .enumerate()
        .map(|(i, node)| (score(node).unwrap_or(i as f64), node.clone()))
        .collect();
    keyed.sort_by(|(sa, na), (sb, nb)| {
        sa.partial_cmp(sb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| na.name.cmp(&nb.name))
    });
    for (slot, (_, node)) in keyed.into_iter().enumerate() {
        layer[slot] = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::validator::{build_graph, validate};
    use crate::store::{Manifest, ManifestGroup};

    fn singleton(name: &str) -> Manifest {
        let mut manifest = Manifest::on_demand(name);
        manifest.external_id = name.to_string();
        manifest
    }

    #[test]
    fn crossing_edges_are_untangled() {
        // Parents p0, p1; children c0 -> p1 and c1 -> p0 drawn naively
        // would cross. Barycenter ordering swaps the children.
        let p0 = singleton("p0");
        let p1 = singleton("p1");
        let mut c0 = singleton("c0");
        c0.depends_on_manifest_id = Some(p1.id);
        let mut c1 = singleton("c1");
        c1.depends_on_manifest_id = Some(p0.id);

        let graph = build_graph(&[], &[p0, p1, c0, c1]).unwrap();
        let layers = validate(&graph).unwrap();
        let layout = layout(&graph, layers);

        let child_layer: Vec<&str> =
            layout.layers[1].iter().map(|n| n.name.as_str()).collect();
        assert_eq!(child_layer, vec!["c1", "c0"]);
    }

    #[test]
    fn isolated_nodes_stay_alphabetical() {
        let groups: Vec<ManifestGroup> = Vec::new();
        let manifests = vec![singleton("whiskey"), singleton("echo"), singleton("mike")];
        let graph = build_graph(&groups, &manifests).unwrap();
        let layers = validate(&graph).unwrap();
        let layout = layout(&graph, layers);

        let names: Vec<&str> = layout.layers[0].iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "mike", "whiskey"]);
    }

    #[test]
    fn positions_cover_every_node() {
        let parent = singleton("parent");
        let mut child = singleton("child");
        child.depends_on_manifest_id = Some(parent.id);

        let graph = build_graph(&[], &[parent, child]).unwrap();
        let layout = layout(&graph, validate(&graph).unwrap());
        let positions = layout.positions();
        assert_eq!(positions.len(), 2);
    }

    #[test]
    fn layout_is_deterministic() {
        let a = singleton("a");
        let mut b = singleton("b");
        b.depends_on_manifest_id = Some(a.id);
        let mut c = singleton("c");
        c.depends_on_manifest_id = Some(a.id);

        let manifests = vec![a, b, c];
        let graph = build_graph(&[], &manifests).unwrap();
        let first = layout(&graph, validate(&graph).unwrap());
        let second = layout(&graph, validate(&graph).unwrap());
        assert_eq!(first, second);
    }
}
