//! A directed graph of who can move value to whom, and the path searches run on it.
//!
//! The network builds one snapshot per search: an edge `x -> y` for payments means `x` can still send something to
//! `y`, and for cycle closing it means `y` owes `x`. Searches are breadth-first, so shorter paths always come first.

use libcredit::paths::{Path, MIN_CYCLE_LENGTH};
use libcredit::NodeId;
use log::*;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Clone, Debug, Default)]
pub struct Topology {
    edges: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if from != to {
            self.edges.entry(from).or_default().insert(to);
        }
    }

    pub fn has_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        self.edges.get(from).is_some_and(|n| n.contains(to))
    }

    pub fn edges_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    fn neighbours(&self, node: &NodeId) -> impl Iterator<Item = &NodeId> {
        self.edges.get(node).into_iter().flatten()
    }

    /// Up to `limit` loop-free paths from `source` to `destination` with at most `max_length` nodes.
    pub fn paths(&self, source: NodeId, destination: NodeId, max_length: usize, limit: usize) -> Vec<Path> {
        let found = self.search(source, max_length, limit, |next, _| next == destination);
        trace!("{} paths from {} to {}", found.len(), source.short(), destination.short());
        found
    }

    /// Every loop-free cycle starting and ending at `node` with at most `max_length` nodes, both ends included.
    pub fn cycles(&self, node: NodeId, max_length: usize, limit: usize) -> Vec<Path> {
        let found = self.search(node, max_length, limit, |next, len| next == node && len + 1 >= MIN_CYCLE_LENGTH);
        trace!("{} cycles through {}", found.len(), node.short());
        found
    }

    /// Breadth-first walk from `start`. A partial route ends as soon as `is_target(next, route_len)` accepts the
    /// next hop. Nodes never repeat inside a route, apart from the closing hop of a cycle.
    fn search<F>(&self, start: NodeId, max_length: usize, limit: usize, is_target: F) -> Vec<Path>
    where
        F: Fn(NodeId, usize) -> bool,
    {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([vec![start]]);
        while let Some(route) = queue.pop_front() {
            if found.len() >= limit {
                break;
            }
            let Some(last) = route.last().copied() else { continue };
            for &next in self.neighbours(&last) {
                if route.len() + 1 > max_length {
                    break;
                }
                if is_target(next, route.len()) {
                    let mut nodes = route.clone();
                    nodes.push(next);
                    if let Ok(path) = Path::new(nodes) {
                        found.push(path);
                    }
                    if found.len() >= limit {
                        break;
                    }
                    continue;
                }
                if next == start || route.contains(&next) {
                    continue;
                }
                let mut longer = route.clone();
                longer.push(next);
                queue.push_back(longer);
            }
        }
        found
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(name: &str) -> NodeId {
        NodeId::from_name(name)
    }

    fn path(names: &[&str]) -> Path {
        Path::new(names.iter().map(|n| id(n)).collect()).unwrap()
    }

    fn graph(edges: &[(&str, &str)]) -> Topology {
        let mut topology = Topology::new();
        for (from, to) in edges {
            topology.add_edge(id(from), id(to));
        }
        topology
    }

    #[test]
    fn shortest_paths_come_first() {
        let topology = graph(&[("a", "b"), ("b", "c"), ("a", "d"), ("d", "e"), ("e", "c"), ("a", "c")]);
        let paths = topology.paths(id("a"), id("c"), 7, 10);
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0], path(&["a", "c"]));
        assert!(paths[1..].contains(&path(&["a", "b", "c"])));
        assert_eq!(paths[2], path(&["a", "d", "e", "c"]));
    }

    #[test]
    fn paths_respect_length_and_limit() {
        let topology = graph(&[("a", "b"), ("b", "c"), ("a", "d"), ("d", "e"), ("e", "c")]);
        assert_eq!(topology.paths(id("a"), id("c"), 3, 10), vec![path(&["a", "b", "c"])]);
        assert_eq!(topology.paths(id("a"), id("c"), 7, 1).len(), 1);
        assert!(topology.paths(id("c"), id("a"), 7, 10).is_empty());
    }

    #[test]
    fn routes_never_revisit_a_node() {
        let topology = graph(&[("a", "b"), ("b", "a"), ("b", "c"), ("c", "b")]);
        assert_eq!(topology.paths(id("a"), id("c"), 7, 10), vec![path(&["a", "b", "c"])]);
    }

    #[test]
    fn cycles_start_and_end_at_the_node() {
        let topology = graph(&[("a", "b"), ("b", "c"), ("c", "a"), ("b", "a"), ("c", "d"), ("d", "a")]);
        let cycles = topology.cycles(id("a"), 7, 10);
        assert_eq!(cycles, vec![path(&["a", "b", "a"]), path(&["a", "b", "c", "a"]), path(&["a", "b", "c", "d", "a"])]);
        assert_eq!(topology.cycles(id("a"), 4, 10).len(), 2);
        assert!(topology.cycles(id("e"), 7, 10).is_empty());
    }

    #[test]
    fn self_loops_are_ignored() {
        let mut topology = Topology::new();
        topology.add_edge(id("a"), id("a"));
        assert_eq!(topology.edges_count(), 0);
        assert!(!topology.has_edge(&id("a"), &id("a")));
    }
}
