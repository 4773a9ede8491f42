use crate::actor::{NodeCommand, Peers};
use crate::NetworkError;
use libcredit::paths::Path;
use libcredit::storage::PaymentRecord;
use libcredit::transactions::CommandResult;
use libcredit::trust_lines::TrustLine;
use libcredit::{Node, NodeId, ProtocolError, TrustLineAmount, TrustLineBalance};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// A cheap, cloneable way to talk to one node of a [`LocalNetwork`](crate::LocalNetwork).
///
/// Commands go through the node's actor and resolve once the transaction they started has finished. Status queries
/// take the node's lock directly and never wait for the actor.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    pub(crate) node: Arc<Mutex<Node>>,
    pub(crate) sender: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeHandle {
    pub(crate) fn new(node: Node, sender: mpsc::UnboundedSender<NodeCommand>) -> Self {
        NodeHandle { id: node.id(), node: Arc::new(Mutex::new(node)), sender }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    fn send(&self, command: NodeCommand) -> Result<(), NetworkError> {
        self.sender.send(command).map_err(|_| NetworkError::NodeStopped(self.id))
    }

    /// Pays `amount` to `receiver` and waits for the outcome.
    pub async fn pay(&self, receiver: NodeId, amount: TrustLineAmount) -> Result<CommandResult, NetworkError> {
        let (reply, result) = oneshot::channel();
        self.send(NodeCommand::Pay { receiver, amount, reply })?;
        result.await.map_err(|_| NetworkError::NodeStopped(self.id))?
    }

    /// Closes `cycle` right away and waits for the outcome.
    pub async fn close_cycle(&self, cycle: Path) -> Result<CommandResult, NetworkError> {
        let (reply, result) = oneshot::channel();
        self.send(NodeCommand::CloseCycle { cycle, reply })?;
        result.await.map_err(|_| NetworkError::NodeStopped(self.id))?
    }

    /// Queues cycles for closing one after another. Their results arrive as network events.
    pub async fn queue_cycles(&self, cycles: Vec<Path>) -> Result<usize, NetworkError> {
        let (reply, queued) = oneshot::channel();
        self.send(NodeCommand::QueueCycles { cycles, reply })?;
        queued.await.map_err(|_| NetworkError::NodeStopped(self.id))
    }

    pub(crate) fn shutdown(&self) {
        self.sender.send(NodeCommand::Shutdown).ok();
    }

    //------------------------------------          Status          ------------------------------------------------//

    pub async fn balance(&self, contractor: &NodeId) -> Result<TrustLineBalance, NetworkError> {
        let node = self.node.lock().await;
        let line = node.trust_lines().trust_line(contractor).map_err(ProtocolError::from)?;
        Ok(line.balance())
    }

    pub async fn trust_lines(&self) -> Vec<TrustLine> {
        self.node.lock().await.trust_lines().trust_lines().cloned().collect()
    }

    pub async fn history(&self) -> Result<Vec<PaymentRecord>, NetworkError> {
        Ok(self.node.lock().await.history()?)
    }

    /// Whether the node has no transaction running and nothing reserved.
    pub async fn is_settled(&self) -> bool {
        let node = self.node.lock().await;
        let lines = node.trust_lines();
        node.scheduler().transactions_count() == 0
            && lines.trust_lines().all(|line| !lines.reservations().has_reservations(&line.contractor()))
    }
}

/// Every handle of the network, shared with the actors.
pub(crate) fn peers(handles: impl IntoIterator<Item = NodeHandle>) -> Peers {
    Arc::new(handles.into_iter().map(|handle| (handle.id(), handle)).collect())
}
