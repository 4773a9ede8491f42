use crate::handle::NodeHandle;
use crate::local_network::NetworkEvent;
use crate::topology::Topology;
use crate::NetworkError;
use libcredit::messages::{Envelope, OutgoingMessage};
use libcredit::paths::Path;
use libcredit::transactions::{CommandResult, MessageResult, PathsRequest};
use libcredit::trust_lines::TrustLinesManager;
use libcredit::{Node, NodeId, TransactionId, TrustLineAmount};
use log::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, Instant};

pub(crate) type CommandReply = oneshot::Sender<Result<CommandResult, NetworkError>>;
pub(crate) type Peers = Arc<BTreeMap<NodeId, NodeHandle>>;

pub(crate) enum NodeCommand {
    Deliver(Envelope),
    Pay { receiver: NodeId, amount: TrustLineAmount, reply: CommandReply },
    CloseCycle { cycle: Path, reply: CommandReply },
    QueueCycles { cycles: Vec<Path>, reply: oneshot::Sender<usize> },
    Shutdown,
}

/// The node's clock. Follows the tokio clock so paused test runtimes drive protocol timeouts too.
pub(crate) fn now() -> std::time::Instant {
    Instant::now().into_std()
}

/// Builds a graph with an edge from every node to each contractor `has_edge` accepts.
///
/// Nodes are locked one at a time and never while the caller holds a lock of its own.
pub(crate) async fn snapshot<F>(peers: &Peers, has_edge: F) -> Topology
where
    F: Fn(&TrustLinesManager, &NodeId) -> bool,
{
    let mut topology = Topology::new();
    for (id, peer) in peers.iter() {
        let node = peer.node.lock().await;
        let lines = node.trust_lines();
        for contractor in lines.trust_lines().map(|line| line.contractor()) {
            if has_edge(lines, &contractor) {
                topology.add_edge(*id, contractor);
            }
        }
    }
    topology
}

pub(crate) fn can_pay(lines: &TrustLinesManager, contractor: &NodeId) -> bool {
    lines.available_outgoing(contractor).is_ok_and(|amount| !amount.is_zero())
}

pub(crate) fn is_owed(lines: &TrustLinesManager, contractor: &NodeId) -> bool {
    lines.available_outgoing_cycle(contractor).is_ok_and(|amount| !amount.is_zero())
}

/// Drives one [`Node`]: feeds it commands and envelopes, fires its timer and ships whatever it produced.
pub(crate) struct NodeActor {
    id: NodeId,
    node: Arc<Mutex<Node>>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    peers: Peers,
    events: mpsc::UnboundedSender<NetworkEvent>,
    pending: BTreeMap<TransactionId, CommandReply>,
    max_paths: usize,
}

impl NodeActor {
    pub fn new(
        handle: &NodeHandle,
        commands: mpsc::UnboundedReceiver<NodeCommand>,
        peers: Peers,
        events: mpsc::UnboundedSender<NetworkEvent>,
        max_paths: usize,
    ) -> Self {
        NodeActor {
            id: handle.id(),
            node: Arc::clone(&handle.node),
            commands,
            peers,
            events,
            pending: BTreeMap::new(),
            max_paths,
        }
    }

    pub async fn run(mut self) {
        debug!("{}: actor started", self.id.short());
        // Whatever a restore left behind goes out before the first command.
        self.flush().await;
        loop {
            let wake_at = self.node.lock().await.next_awakening();
            let timer = async move {
                match wake_at {
                    Some(at) => sleep_until(Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                () = timer => self.node.lock().await.on_timer(now()),
            }
            self.flush().await;
        }
        for (id, reply) in std::mem::take(&mut self.pending) {
            trace!("{}: dropping the caller of {}", self.id.short(), id.short());
            reply.send(Err(NetworkError::NodeStopped(self.id))).ok();
        }
        debug!("{}: actor stopped", self.id.short());
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Deliver(envelope) => self.node.lock().await.handle_message(envelope, now()),
            NodeCommand::Pay { receiver, amount, reply } => {
                let started = self.node.lock().await.pay(receiver, amount, now());
                self.track(started, reply);
            }
            NodeCommand::CloseCycle { cycle, reply } => {
                let started = self.node.lock().await.close_cycle(cycle, now());
                self.track(started, reply);
            }
            NodeCommand::QueueCycles { cycles, reply } => {
                let queued = self.node.lock().await.queue_cycles(cycles, now());
                reply.send(queued).ok();
            }
            NodeCommand::Shutdown => {}
        }
    }

    fn track(&mut self, started: Result<TransactionId, libcredit::ProtocolError>, reply: CommandReply) {
        match started {
            Ok(id) => {
                self.pending.insert(id, reply);
            }
            Err(e) => {
                warn!("{}: command refused. {e}", self.id.short());
                reply.send(Err(e.into())).ok();
            }
        }
    }

    /// Ships everything the node produced until it has nothing more to say. Attaching paths makes the node talk
    /// again.
    async fn flush(&mut self) {
        loop {
            let (outgoing, requests, commands, messages) = {
                let mut node = self.node.lock().await;
                (
                    node.drain_outbox(),
                    node.drain_path_requests(),
                    node.drain_command_results(),
                    node.drain_message_results(),
                )
            };
            if outgoing.is_empty() && requests.is_empty() && commands.is_empty() && messages.is_empty() {
                break;
            }
            outgoing.into_iter().for_each(|message| self.route(message));
            commands.into_iter().for_each(|result| self.report_command(result));
            messages.into_iter().for_each(|result| self.report_message(result));
            for request in requests {
                self.answer_paths_request(request).await;
            }
        }
    }

    fn route(&self, message: OutgoingMessage) {
        let OutgoingMessage { recipient, envelope } = message;
        trace!("{}: sending {envelope} to {}", self.id.short(), recipient.short());
        match self.peers.get(&recipient) {
            Some(peer) => {
                if peer.sender.send(NodeCommand::Deliver(envelope)).is_err() {
                    warn!("{}: {} has stopped, message lost", self.id.short(), recipient.short());
                }
            }
            None => warn!("{}: no route to {}, message lost", self.id.short(), recipient.short()),
        }
    }

    fn report_command(&mut self, result: CommandResult) {
        info!("{}: {:?} {} finished: {}", self.id.short(), result.kind, result.transaction_id.short(), result.code);
        if let Some(reply) = self.pending.remove(&result.transaction_id) {
            reply.send(Ok(result.clone())).ok();
        }
        self.events.send(NetworkEvent::CommandFinished { node: self.id, result }).ok();
    }

    fn report_message(&self, result: MessageResult) {
        let (me, transaction) = (self.id.short(), result.transaction_id.short());
        debug!("{me}: {:?} of {transaction} ended {:?}", result.role, result.outcome);
        self.events.send(NetworkEvent::MessageFinished { node: self.id, result }).ok();
    }

    async fn answer_paths_request(&self, request: PathsRequest) {
        let max_length = self.node.lock().await.config().max_path_length;
        let topology = snapshot(&self.peers, can_pay).await;
        let paths = topology.paths(self.id, request.receiver, max_length, self.max_paths);
        let (me, receiver) = (self.id.short(), request.receiver.short());
        debug!("{me}: {} paths to {receiver} for {}", paths.len(), request.transaction_id.short());
        let mut node = self.node.lock().await;
        if let Err(e) = node.attach_paths(request.transaction_id, paths, now()) {
            warn!("{}: paths for {} came too late. {e}", self.id.short(), request.transaction_id.short());
        }
    }
}
