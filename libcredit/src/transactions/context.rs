use crate::config::ProtocolConfig;
use crate::ids::{NodeId, TransactionId};
use crate::messages::{Envelope, Message, OutgoingMessage};
use crate::storage::{IOTransaction, StorageHandler};
use crate::trust_lines::TrustLinesManager;
use log::*;
use serde::{Deserialize, Serialize};

/// A request for candidate paths, answered later with a [`Resource::Paths`](crate::transactions::Resource::Paths).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsRequest {
    pub transaction_id: TransactionId,
    pub receiver: NodeId,
}

/// Everything transactions hand over to the outside world during a step.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<OutgoingMessage>,
    paths_requests: Vec<PathsRequest>,
    closed_edges: Vec<(NodeId, NodeId)>,
}

impl Outbox {
    pub fn new() -> Self {
        Outbox::default()
    }

    pub fn push_message(&mut self, recipient: NodeId, envelope: Envelope) {
        self.messages.push(OutgoingMessage { recipient, envelope });
    }

    pub fn request_paths(&mut self, transaction_id: TransactionId, receiver: NodeId) {
        self.paths_requests.push(PathsRequest { transaction_id, receiver });
    }

    /// A cycle closing gave up on the trust line `from -> to`.
    pub fn close_edge(&mut self, from: NodeId, to: NodeId) {
        self.closed_edges.push((from, to));
    }

    /// Position to come back to with [`discard_messages_since`](Self::discard_messages_since).
    pub fn mark(&self) -> usize {
        self.messages.len()
    }

    /// Drops the messages queued after `mark`. Used when a step could not be made durable.
    pub fn discard_messages_since(&mut self, mark: usize) -> usize {
        let discarded = self.messages.len().saturating_sub(mark);
        self.messages.truncate(mark);
        discarded
    }

    pub fn take_messages(&mut self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut self.messages)
    }

    pub fn take_paths_requests(&mut self) -> Vec<PathsRequest> {
        std::mem::take(&mut self.paths_requests)
    }

    pub fn take_closed_edges(&mut self) -> Vec<(NodeId, NodeId)> {
        std::mem::take(&mut self.closed_edges)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.paths_requests.is_empty() && self.closed_edges.is_empty()
    }
}

/// The node state a transaction may touch while it runs.
pub struct NodeContext<'a> {
    pub node_id: NodeId,
    pub config: &'a ProtocolConfig,
    pub trust_lines: &'a mut TrustLinesManager,
    pub storage: &'a mut dyn StorageHandler,
    pub outbox: &'a mut Outbox,
}

impl NodeContext<'_> {
    pub fn send(&mut self, recipient: NodeId, transaction_id: TransactionId, message: Message) {
        let envelope = Envelope::new(self.node_id, transaction_id, message);
        trace!("{} -> {}: {envelope}", self.node_id.short(), recipient.short());
        self.outbox.push_message(recipient, envelope);
    }

    pub fn begin_io(&mut self) -> IOTransaction<'_> {
        IOTransaction::begin(&mut *self.storage)
    }
}

/// Read access to the set of transactions the scheduler is currently running.
pub trait LiveTransactions {
    fn is_alive(&self, transaction_id: &TransactionId) -> bool;
}

/// No other transaction is alive.
pub struct NoLiveTransactions;

impl LiveTransactions for NoLiveTransactions {
    fn is_alive(&self, _: &TransactionId) -> bool {
        false
    }
}
