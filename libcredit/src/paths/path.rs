use crate::error::ProtocolError;
use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// Smallest closed path: coordinator, one other node, coordinator.
pub const MIN_CYCLE_LENGTH: usize = 3;

/// An ordered, immutable list of nodes a payment travels along. The head is the coordinator; the tail is the
/// receiver, or the coordinator again for a cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    nodes: Vec<NodeId>,
}

impl Path {
    pub fn new(nodes: Vec<NodeId>) -> Result<Self, ProtocolError> {
        if nodes.len() < 2 {
            return Err(ProtocolError::value(format!("a path needs at least two nodes, got {}", nodes.len())));
        }
        Ok(Path { nodes })
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn source(&self) -> NodeId {
        self.nodes[0]
    }

    pub fn destination(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn node(&self, position: usize) -> Option<NodeId> {
        self.nodes.get(position).copied()
    }

    /// Every node strictly between the head and the tail.
    pub fn intermediates(&self) -> &[NodeId] {
        &self.nodes[1..self.nodes.len() - 1]
    }

    pub fn is_cycle(&self) -> bool {
        self.source() == self.destination()
    }

    pub fn position_of(&self, node: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }

    fn has_repeated_intermediates(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.intermediates().iter().any(|n| !seen.insert(*n) || *n == self.source() || *n == self.destination())
    }

    /// Checks a candidate payment path from `me` to `receiver`.
    pub fn validate_payment(&self, me: &NodeId, receiver: &NodeId, max_length: usize) -> Result<(), ProtocolError> {
        if self.source() != *me {
            return Err(ProtocolError::value(format!("path {self} does not start at this node")));
        }
        if self.destination() != *receiver {
            return Err(ProtocolError::value(format!("path {self} does not end at the receiver")));
        }
        if self.is_cycle() {
            return Err(ProtocolError::value("a payment path cannot be closed"));
        }
        if self.len() > max_length {
            return Err(ProtocolError::value(format!("path {self} is longer than {max_length} nodes")));
        }
        if self.has_repeated_intermediates() {
            return Err(ProtocolError::value(format!("path {self} visits a node twice")));
        }
        Ok(())
    }

    /// Checks a candidate cycle starting and ending at `me`.
    pub fn validate_cycle(&self, me: &NodeId, max_length: usize) -> Result<(), ProtocolError> {
        if !self.is_cycle() || self.source() != *me {
            return Err(ProtocolError::value(format!("path {self} is not a cycle through this node")));
        }
        if self.len() < MIN_CYCLE_LENGTH || self.len() > max_length {
            return Err(ProtocolError::value(format!(
                "cycle {self} must have between {MIN_CYCLE_LENGTH} and {max_length} nodes"
            )));
        }
        if self.has_repeated_intermediates() {
            return Err(ProtocolError::value(format!("cycle {self} visits a node twice")));
        }
        Ok(())
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = self.nodes.iter().map(|n| n.short()).collect::<Vec<_>>();
        write!(f, "[{}]", names.join(" -> "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn path(names: &[&str]) -> Path {
        Path::new(names.iter().map(|n| NodeId::from_name(n)).collect()).unwrap()
    }

    fn id(name: &str) -> NodeId {
        NodeId::from_name(name)
    }

    #[test]
    fn payment_paths() {
        let p = path(&["a", "b", "c"]);
        assert!(p.validate_payment(&id("a"), &id("c"), 7).is_ok());
        assert_eq!(p.intermediates(), &[id("b")]);
        assert!(p.validate_payment(&id("b"), &id("c"), 7).is_err());
        assert!(p.validate_payment(&id("a"), &id("b"), 7).is_err());
        assert!(p.validate_payment(&id("a"), &id("c"), 2).is_err());
        assert!(path(&["a", "b", "d", "b", "c"]).validate_payment(&id("a"), &id("c"), 7).is_err());
        assert!(path(&["a", "c", "b", "c"]).validate_payment(&id("a"), &id("c"), 7).is_err());
        assert!(Path::new(vec![id("a")]).is_err());
    }

    #[test]
    fn cycles() {
        assert!(path(&["a", "b", "c", "a"]).validate_cycle(&id("a"), 7).is_ok());
        assert!(path(&["a", "b", "a"]).validate_cycle(&id("a"), 7).is_ok());
        assert!(path(&["a", "b", "c"]).validate_cycle(&id("a"), 7).is_err());
        assert!(path(&["a", "a"]).validate_cycle(&id("a"), 7).is_err());
        assert!(path(&["a", "b", "c", "b", "a"]).validate_cycle(&id("a"), 7).is_err());
        assert!(path(&["a", "b", "c", "d", "e", "f", "g", "a"]).validate_cycle(&id("a"), 7).is_err());
        assert!(path(&["b", "c", "b"]).validate_cycle(&id("a"), 7).is_err());
    }
}
