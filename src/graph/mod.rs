//! Directed graph used for dependency and namespace bookkeeping.
//!
//! Thin domain wrapper around a stable petgraph graph: handles stay valid
//! across removals, duplicate edges replace their payload, and lookups of
//! missing nodes or edges fail explicitly instead of panicking.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

use crate::core::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(NodeIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(EdgeIndex);

/// Outcome of a topological sort. Nodes that sit on a cycle, or depend on
/// one, end up in `cyclic` and are absent from `order`.
#[derive(Debug)]
pub struct TopoOrder {
    pub order: Vec<NodeId>,
    pub cyclic: Vec<NodeId>,
}

#[derive(Debug)]
pub struct DepGraph<N, E> {
    inner: StableDiGraph<N, E>,
}

impl<N, E> Default for DepGraph<N, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N, E> DepGraph<N, E> {
    pub fn new() -> Self {
        Self {
            inner: StableDiGraph::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn add_node(&mut self, payload: N) -> NodeId {
        NodeId(self.inner.add_node(payload))
    }

    pub fn remove_node(&mut self, node: NodeId) -> Result<N> {
        self.inner
            .remove_node(node.0)
            .ok_or_else(|| RuntimeError::NotFound(format!("graph node {:?}", node.0)))
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.inner.node_weight(node.0).is_some()
    }

    pub fn node(&self, node: NodeId) -> Option<&N> {
        self.inner.node_weight(node.0)
    }

    pub fn node_mut(&mut self, node: NodeId) -> Option<&mut N> {
        self.inner.node_weight_mut(node.0)
    }

    /// Inserts an edge. If an edge between the endpoints already exists its
    /// payload is replaced and the previous payload is returned.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, payload: E) -> Result<(EdgeId, Option<E>)> {
        if !self.contains_node(from) || !self.contains_node(to) {
            return Err(RuntimeError::NotFound("graph edge endpoint".into()));
        }
        if let Some(existing) = self.inner.find_edge(from.0, to.0) {
            let slot = self
                .inner
                .edge_weight_mut(existing)
                .expect("edge weight present for found edge");
            let old = std::mem::replace(slot, payload);
            return Ok((EdgeId(existing), Some(old)));
        }
        Ok((EdgeId(self.inner.add_edge(from.0, to.0, payload)), None))
    }

    pub fn remove_edge(&mut self, edge: EdgeId) -> Result<E> {
        self.inner
            .remove_edge(edge.0)
            .ok_or_else(|| RuntimeError::NotFound(format!("graph edge {:?}", edge.0)))
    }

    pub fn find_edge(&self, from: NodeId, to: NodeId) -> Option<EdgeId> {
        self.inner.find_edge(from.0, to.0).map(EdgeId)
    }

    pub fn edge(&self, edge: EdgeId) -> Option<&E> {
        self.inner.edge_weight(edge.0)
    }

    pub fn neighbors_out(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .neighbors_directed(node.0, Direction::Outgoing)
            .map(NodeId)
            .collect()
    }

    pub fn neighbors_in(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .neighbors_directed(node.0, Direction::Incoming)
            .map(NodeId)
            .collect()
    }

    pub fn in_degree(&self, node: NodeId) -> usize {
        self.inner
            .neighbors_directed(node.0, Direction::Incoming)
            .count()
    }

    /// Nodes without incoming edges.
    pub fn sources(&self) -> Vec<NodeId> {
        self.inner
            .externals(Direction::Incoming)
            .map(NodeId)
            .collect()
    }

    /// Nodes without outgoing edges.
    pub fn sinks(&self) -> Vec<NodeId> {
        self.inner
            .externals(Direction::Outgoing)
            .map(NodeId)
            .collect()
    }

    pub fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        has_path_connecting(&self.inner, from.0, to.0, None)
    }

    /// Whether inserting `from -> to` would close a cycle.
    pub fn would_cycle(&self, from: NodeId, to: NodeId) -> bool {
        from == to || self.is_reachable(to, from)
    }

    pub fn clear_edges(&mut self) {
        let edges: Vec<_> = self.inner.edge_indices().collect();
        for e in edges {
            self.inner.remove_edge(e);
        }
    }

    /// Flips the direction of every edge in place.
    pub fn reverse(&mut self)
    where
        E: Clone,
    {
        let edges: Vec<_> = self
            .inner
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.inner.edge_endpoints(e)?;
                Some((e, a, b, self.inner.edge_weight(e)?.clone()))
            })
            .collect();
        for (e, a, b, w) in edges {
            self.inner.remove_edge(e);
            self.inner.add_edge(b, a, w);
        }
    }

    /// Depth-first clone of the subgraph reachable from `start`, following
    /// outgoing edges. Returns the clone together with the old-to-new node
    /// mapping.
    pub fn reachable_subgraph(&self, start: NodeId) -> Result<(Self, HashMap<NodeId, NodeId>)>
    where
        N: Clone,
        E: Clone,
    {
        if !self.contains_node(start) {
            return Err(RuntimeError::NotFound(format!("graph node {:?}", start.0)));
        }
        let mut clone = Self::new();
        let mut mapping: HashMap<NodeId, NodeId> = HashMap::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if mapping.contains_key(&node) {
                continue;
            }
            let payload = self
                .node(node)
                .expect("reachable node has a payload")
                .clone();
            mapping.insert(node, clone.add_node(payload));
            for next in self.neighbors_out(node) {
                if !mapping.contains_key(&next) {
                    stack.push(next);
                }
            }
        }
        for (&old, &new) in &mapping {
            for edge in self.inner.edges_directed(old.0, Direction::Outgoing) {
                let target = NodeId(edge.target());
                if let Some(&new_target) = mapping.get(&target) {
                    clone
                        .add_edge(new, new_target, edge.weight().clone())
                        .expect("cloned endpoints exist");
                }
            }
        }
        Ok((clone, mapping))
    }

    /// Kahn topological sort. Every edge `a -> b` places `a` before `b`.
    /// Ties are broken by the lexicographic order of the node labels so the
    /// result is deterministic.
    pub fn toposort_by<F>(&self, label: F) -> TopoOrder
    where
        F: Fn(&N) -> &str,
    {
        use std::collections::BTreeMap;

        let mut in_degrees: HashMap<NodeId, usize> = HashMap::new();
        let mut ready: BTreeMap<String, NodeId> = BTreeMap::new();
        for idx in self.inner.node_indices() {
            let node = NodeId(idx);
            let degree = self.in_degree(node);
            in_degrees.insert(node, degree);
            if degree == 0 {
                let name = label(self.node(node).expect("node payload")).to_string();
                ready.insert(name, node);
            }
        }

        let mut order = Vec::with_capacity(self.node_count());
        while let Some((_, node)) = ready.pop_first() {
            order.push(node);
            for next in self.neighbors_out(node) {
                let degree = in_degrees
                    .get_mut(&next)
                    .expect("neighbor tracked in degree map");
                *degree -= 1;
                if *degree == 0 {
                    let name = label(self.node(next).expect("node payload")).to_string();
                    ready.insert(name, next);
                }
            }
        }

        let cyclic = in_degrees
            .into_iter()
            .filter(|&(node, _)| !order.contains(&node))
            .map(|(node, _)| node)
            .collect();
        TopoOrder { order, cyclic }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(names: &[&str]) -> (DepGraph<String, u32>, Vec<NodeId>) {
        let mut g = DepGraph::new();
        let ids = names.iter().map(|n| g.add_node(n.to_string())).collect();
        (g, ids)
    }

    #[test]
    fn duplicate_edge_returns_old_payload() {
        let (mut g, ids) = labeled(&["a", "b"]);
        let (first, old) = g.add_edge(ids[0], ids[1], 1).unwrap();
        assert!(old.is_none());
        let (second, old) = g.add_edge(ids[0], ids[1], 2).unwrap();
        assert_eq!(first, second);
        assert_eq!(old, Some(1));
        assert_eq!(g.edge(first), Some(&2));
    }

    #[test]
    fn node_payloads_are_mutable() {
        let (mut g, ids) = labeled(&["a"]);
        g.node_mut(ids[0]).unwrap().push_str("-renamed");
        assert_eq!(g.node(ids[0]).map(String::as_str), Some("a-renamed"));
    }

    #[test]
    fn removing_missing_node_fails() {
        let (mut g, ids) = labeled(&["a"]);
        g.remove_node(ids[0]).unwrap();
        assert!(g.remove_node(ids[0]).is_err());
    }

    #[test]
    fn cycle_probe() {
        let (mut g, ids) = labeled(&["a", "b", "c"]);
        g.add_edge(ids[0], ids[1], 0).unwrap();
        g.add_edge(ids[1], ids[2], 0).unwrap();
        assert!(g.would_cycle(ids[2], ids[0]));
        assert!(g.would_cycle(ids[0], ids[0]));
        assert!(!g.would_cycle(ids[0], ids[2]));
    }

    #[test]
    fn toposort_is_deterministic() {
        let (mut g, ids) = labeled(&["c", "a", "b", "root"]);
        g.add_edge(ids[3], ids[0], 0).unwrap();
        g.add_edge(ids[3], ids[1], 0).unwrap();
        g.add_edge(ids[3], ids[2], 0).unwrap();
        let topo = g.toposort_by(|n| n.as_str());
        let names: Vec<_> = topo
            .order
            .iter()
            .map(|&n| g.node(n).unwrap().as_str())
            .collect();
        assert_eq!(names, ["root", "a", "b", "c"]);
        assert!(topo.cyclic.is_empty());
    }

    #[test]
    fn toposort_reports_cycle_members_and_dependents() {
        let (mut g, ids) = labeled(&["a", "b", "down", "free"]);
        g.add_edge(ids[0], ids[1], 0).unwrap();
        g.add_edge(ids[1], ids[0], 0).unwrap();
        g.add_edge(ids[1], ids[2], 0).unwrap();
        let topo = g.toposort_by(|n| n.as_str());
        let ordered: Vec<_> = topo
            .order
            .iter()
            .map(|&n| g.node(n).unwrap().as_str())
            .collect();
        assert_eq!(ordered, ["free"]);
        assert_eq!(topo.cyclic.len(), 3);
    }

    #[test]
    fn reachable_subgraph_clones_and_remaps() {
        let (mut g, ids) = labeled(&["a", "b", "c", "island"]);
        g.add_edge(ids[0], ids[1], 10).unwrap();
        g.add_edge(ids[1], ids[2], 20).unwrap();
        let (sub, mapping) = g.reachable_subgraph(ids[0]).unwrap();
        assert_eq!(sub.node_count(), 3);
        assert_eq!(sub.edge_count(), 2);
        assert!(!mapping.contains_key(&ids[3]));
        let new_a = mapping[&ids[0]];
        let new_b = mapping[&ids[1]];
        let edge = sub.find_edge(new_a, new_b).unwrap();
        assert_eq!(sub.edge(edge), Some(&10));
    }

    #[test]
    fn reverse_flips_edges() {
        let (mut g, ids) = labeled(&["a", "b"]);
        g.add_edge(ids[0], ids[1], 7).unwrap();
        g.reverse();
        assert!(g.find_edge(ids[0], ids[1]).is_none());
        let edge = g.find_edge(ids[1], ids[0]).unwrap();
        assert_eq!(g.edge(edge), Some(&7));
    }

    #[test]
    fn clear_edges_keeps_nodes() {
        let (mut g, ids) = labeled(&["a", "b"]);
        g.add_edge(ids[0], ids[1], 0).unwrap();
        g.clear_edges();
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn sources_and_sinks() {
        let (mut g, ids) = labeled(&["a", "b", "c"]);
        g.add_edge(ids[0], ids[1], 0).unwrap();
        g.add_edge(ids[1], ids[2], 0).unwrap();
        assert_eq!(g.sources(), vec![ids[0]]);
        assert_eq!(g.sinks(), vec![ids[2]]);
    }
}
