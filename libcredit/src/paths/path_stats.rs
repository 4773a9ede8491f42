use crate::amount::TrustLineAmount;
use crate::ids::NodeId;
use crate::paths::Path;
use serde::{Deserialize, Serialize};

/// Negotiation state of one node on a path, as seen by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathNodeState {
    NotSent,
    ReservationRequestSent,
    /// The node reserved incoming capacity from its previous neighbour.
    NeighbourReservationApproved,
    /// The node also reserved toward its next neighbour (or is the receiver and accepted).
    ReservationApproved,
    ReservationRejected,
}

/// The coordinator's cursor over one candidate path.
///
/// `flow` is the amount still able to travel the whole path. It starts at the amount the coordinator asks for and
/// only ever shrinks as hops report less capacity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathStats {
    path: Path,
    states: Vec<PathNodeState>,
    flow: TrustLineAmount,
    cursor: usize,
    valid: bool,
    confirmed: bool,
}

impl PathStats {
    pub fn new(path: Path) -> Self {
        let states = vec![PathNodeState::NotSent; path.len()];
        PathStats { path, states, flow: TrustLineAmount::ZERO, cursor: 1, valid: true, confirmed: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flow(&self) -> TrustLineAmount {
        self.flow
    }

    /// Sets the opening flow. Only possible before any hop has been contacted.
    pub fn start(&mut self, amount: TrustLineAmount) -> bool {
        if self.states.iter().any(|s| *s != PathNodeState::NotSent) {
            return false;
        }
        self.flow = amount;
        true
    }

    /// Reduces the flow to `min(flow, amount)` and returns the resulting flow.
    pub fn shortage(&mut self, amount: TrustLineAmount) -> TrustLineAmount {
        if amount < self.flow {
            self.flow = amount;
        }
        self.flow
    }

    /// Position of the node currently being negotiated.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current_node(&self) -> Option<NodeId> {
        self.path.node(self.cursor)
    }

    /// The neighbour the current node has to reserve toward next.
    pub fn next_node(&self) -> Option<NodeId> {
        self.path.node(self.cursor + 1)
    }

    pub fn first_hop(&self) -> NodeId {
        self.path.nodes()[1]
    }

    pub fn advance(&mut self) {
        if self.cursor + 1 < self.path.len() {
            self.cursor += 1;
        }
    }

    pub fn node_state(&self, position: usize) -> Option<PathNodeState> {
        self.states.get(position).copied()
    }

    pub fn set_node_state(&mut self, position: usize, state: PathNodeState) {
        if let Some(s) = self.states.get_mut(position) {
            *s = state;
        }
    }

    pub fn set_current_state(&mut self, state: PathNodeState) {
        self.set_node_state(self.cursor, state);
    }

    /// True once the last node of the path (receiver, or coordinator for a cycle) has accepted.
    pub fn is_reservation_complete(&self) -> bool {
        self.states.iter().skip(1).all(|s| *s == PathNodeState::ReservationApproved)
    }

    /// True when the current node is the last one before the tail.
    pub fn is_last_intermediate(&self) -> bool {
        self.cursor + 2 == self.path.len()
    }

    /// Nodes (besides the coordinator) that may hold a reservation for this path.
    pub fn contacted_nodes(&self) -> Vec<NodeId> {
        let tail = self.path.len() - 1;
        self.states
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(i, s)| **s != PathNodeState::NotSent && !(self.path.is_cycle() && *i == tail))
            .filter_map(|(i, _)| self.path.node(i))
            .collect()
    }

    /// Nodes that take part in the votes for this path: every node except the coordinator.
    pub fn participants(&self) -> Vec<NodeId> {
        if self.path.is_cycle() {
            self.path.intermediates().to_vec()
        } else {
            self.path.nodes()[1..].to_vec()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
        self.set_current_state(PathNodeState::ReservationRejected);
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn confirm(&mut self) {
        self.confirmed = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stats(names: &[&str]) -> PathStats {
        PathStats::new(Path::new(names.iter().map(|n| NodeId::from_name(n)).collect()).unwrap())
    }

    #[test]
    fn flow_only_decreases() {
        let mut s = stats(&["a", "b", "c"]);
        assert!(s.start(TrustLineAmount::new(100)));
        assert_eq!(s.shortage(TrustLineAmount::new(120)).value(), 100);
        assert_eq!(s.shortage(TrustLineAmount::new(40)).value(), 40);
        assert_eq!(s.shortage(TrustLineAmount::new(60)).value(), 40);
        s.set_current_state(PathNodeState::ReservationRequestSent);
        assert!(!s.start(TrustLineAmount::new(500)));
        assert_eq!(s.flow().value(), 40);
    }

    #[test]
    fn cursor_walks_the_path() {
        let mut s = stats(&["a", "b", "c", "d"]);
        assert_eq!(s.current_node(), Some(NodeId::from_name("b")));
        assert_eq!(s.next_node(), Some(NodeId::from_name("c")));
        assert!(!s.is_last_intermediate());
        s.set_current_state(PathNodeState::ReservationApproved);
        s.advance();
        assert!(s.is_last_intermediate());
        s.set_current_state(PathNodeState::ReservationApproved);
        s.advance();
        assert!(!s.is_reservation_complete());
        s.set_current_state(PathNodeState::ReservationApproved);
        s.advance();
        assert_eq!(s.cursor(), 3);
        assert!(s.is_reservation_complete());
        assert_eq!(s.contacted_nodes().len(), 3);
        assert_eq!(s.participants().len(), 3);
    }

    #[test]
    fn cycle_participants_exclude_coordinator() {
        let mut s = stats(&["a", "b", "c", "a"]);
        assert_eq!(s.participants(), vec![NodeId::from_name("b"), NodeId::from_name("c")]);
        for _ in 0..3 {
            s.set_current_state(PathNodeState::ReservationApproved);
            s.advance();
        }
        assert!(s.is_reservation_complete());
        assert_eq!(s.contacted_nodes(), vec![NodeId::from_name("b"), NodeId::from_name("c")]);
    }
}
