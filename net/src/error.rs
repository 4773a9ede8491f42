use libcredit::{NodeId, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Node {0} is not part of the network")]
    UnknownNode(NodeId),
    #[error("Node {0} is already part of the network")]
    DuplicateNode(NodeId),
    #[error("The actor of node {0} has stopped")]
    NodeStopped(NodeId),
    #[error("Protocol error. {0}")]
    Protocol(#[from] ProtocolError),
}
