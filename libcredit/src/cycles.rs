//! Queue of debt cycles waiting to be closed.
//!
//! At most one cycle closing runs at a time. Trust lines that failed a closing are remembered as closed edges and
//! every queued cycle crossing one is skipped, until the queue drains and the blacklist is reset.

use crate::ids::{NodeId, TransactionId};
use crate::paths::Path;
use log::*;
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Default)]
pub struct CyclesManager {
    queue: VecDeque<Path>,
    running: Option<TransactionId>,
    closed_edges: BTreeSet<(NodeId, NodeId)>,
}

impl CyclesManager {
    pub fn new() -> Self {
        CyclesManager::default()
    }

    /// Queues cycles found by discovery. Non-cycles and duplicates are dropped. Returns how many were queued.
    pub fn add_cycles(&mut self, cycles: impl IntoIterator<Item = Path>) -> usize {
        let mut added = 0;
        for cycle in cycles {
            if !cycle.is_cycle() || self.queue.contains(&cycle) {
                trace!("Not queueing {cycle}");
                continue;
            }
            self.queue.push_back(cycle);
            added += 1;
        }
        debug!("{added} cycles queued, {} waiting", self.queue.len());
        added
    }

    /// The next cycle worth trying, unless a closing is already running.
    pub fn next_cycle(&mut self) -> Option<Path> {
        if self.running.is_some() {
            return None;
        }
        while let Some(cycle) = self.queue.pop_front() {
            if self.crosses_closed_edge(&cycle) {
                debug!("Skipping cycle {cycle}, it crosses a closed edge");
                continue;
            }
            return Some(cycle);
        }
        None
    }

    fn crosses_closed_edge(&self, cycle: &Path) -> bool {
        cycle.nodes().windows(2).any(|w| self.closed_edges.contains(&(w[0], w[1])))
    }

    pub fn start(&mut self, transaction_id: TransactionId) {
        self.running = Some(transaction_id);
    }

    pub fn running(&self) -> Option<TransactionId> {
        self.running
    }

    pub fn on_finished(&mut self, transaction_id: &TransactionId) {
        if self.running.as_ref() == Some(transaction_id) {
            self.running = None;
        }
        if self.queue.is_empty() && !self.closed_edges.is_empty() {
            debug!("Cycle queue drained, forgetting {} closed edges", self.closed_edges.len());
            self.closed_edges.clear();
        }
    }

    pub fn close_edge(&mut self, from: NodeId, to: NodeId) {
        self.closed_edges.insert((from, to));
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cycle(names: &[&str]) -> Path {
        Path::new(names.iter().map(|n| NodeId::from_name(n)).collect()).unwrap()
    }

    #[test]
    fn one_closing_at_a_time() {
        let mut cycles = CyclesManager::new();
        assert_eq!(cycles.add_cycles([cycle(&["a", "b", "c", "a"]), cycle(&["a", "c", "d", "a"])]), 2);
        let first = cycles.next_cycle().unwrap();
        let id = TransactionId::from_counter(1);
        cycles.start(id);
        assert!(cycles.next_cycle().is_none());
        cycles.on_finished(&id);
        let second = cycles.next_cycle().unwrap();
        assert_ne!(first, second);
        assert!(cycles.next_cycle().is_none());
    }

    #[test]
    fn duplicates_and_open_paths_are_dropped() {
        let mut cycles = CyclesManager::new();
        let c = cycle(&["a", "b", "c", "a"]);
        assert_eq!(cycles.add_cycles([c.clone(), c, cycle(&["a", "b", "c"])]), 1);
        assert_eq!(cycles.queued(), 1);
    }

    #[test]
    fn closed_edges_are_skipped_until_the_queue_drains() {
        let mut cycles = CyclesManager::new();
        let a = NodeId::from_name("a");
        let b = NodeId::from_name("b");
        cycles.add_cycles([cycle(&["a", "b", "c", "a"]), cycle(&["a", "c", "d", "a"])]);
        cycles.close_edge(a, b);
        assert_eq!(cycles.next_cycle(), Some(cycle(&["a", "c", "d", "a"])));
        let id = TransactionId::from_counter(1);
        cycles.start(id);
        cycles.on_finished(&id);
        cycles.add_cycles([cycle(&["a", "b", "c", "a"])]);
        assert!(cycles.next_cycle().is_some());
    }
}
