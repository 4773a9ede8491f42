use crate::actor::{self, NodeActor, Peers};
use crate::handle::{self, NodeHandle};
use crate::NetworkError;
use libcredit::keystore::DummyKeystore;
use libcredit::storage::MemoryStore;
use libcredit::transactions::{CommandResult, MessageResult};
use libcredit::trust_lines::TrustLine;
use libcredit::{Node, NodeId, ProtocolConfig, TrustLineAmount, TrustLineBalance};
use log::*;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Paths handed to a coordinator per request.
pub const DEFAULT_MAX_PATHS: usize = 5;

/// Terminal results, published by every node as they happen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    CommandFinished { node: NodeId, result: CommandResult },
    MessageFinished { node: NodeId, result: MessageResult },
}

/// Describes the nodes of a [`LocalNetwork`] and the trust lines between them.
pub struct LocalNetworkBuilder {
    config: ProtocolConfig,
    lines: BTreeMap<NodeId, BTreeMap<NodeId, TrustLine>>,
    max_paths: usize,
}

impl LocalNetworkBuilder {
    pub fn new(config: ProtocolConfig) -> Self {
        LocalNetworkBuilder { config, lines: BTreeMap::new(), max_paths: DEFAULT_MAX_PATHS }
    }

    pub fn max_paths(mut self, max_paths: usize) -> Self {
        self.max_paths = max_paths.max(1);
        self
    }

    pub fn node(mut self, id: NodeId) -> Result<Self, NetworkError> {
        if self.lines.contains_key(&id) {
            return Err(NetworkError::DuplicateNode(id));
        }
        self.lines.insert(id, BTreeMap::new());
        Ok(self)
    }

    /// `from` may send up to `forward` to `to`, and `to` up to `backward` back.
    pub fn link(self, from: NodeId, to: NodeId, forward: u64, backward: u64) -> Result<Self, NetworkError> {
        self.link_with_debt(from, to, forward, backward, 0)
    }

    /// Like [`link`](Self::link), with `from` already owing `debt` to `to`. A negative debt means `to` owes `from`.
    pub fn link_with_debt(
        mut self,
        from: NodeId,
        to: NodeId,
        forward: u64,
        backward: u64,
        debt: i64,
    ) -> Result<Self, NetworkError> {
        for id in [from, to] {
            if !self.lines.contains_key(&id) {
                return Err(NetworkError::UnknownNode(id));
            }
        }
        let (forward, backward) = (TrustLineAmount::new(forward), TrustLineAmount::new(backward));
        let from_line = TrustLine::active(to, backward, forward, TrustLineBalance::new(-debt));
        let to_line = TrustLine::active(from, forward, backward, TrustLineBalance::new(debt));
        if let Some(lines) = self.lines.get_mut(&from) {
            if lines.insert(to, from_line).is_some() {
                warn!("Trust line {} - {} was already defined, replacing it", from.short(), to.short());
            }
        }
        if let Some(lines) = self.lines.get_mut(&to) {
            lines.insert(from, to_line);
        }
        Ok(self)
    }

    /// Creates every node and spawns its actor. Must be called from within a tokio runtime.
    pub fn start(self) -> Result<(LocalNetwork, mpsc::UnboundedReceiver<NetworkEvent>), NetworkError> {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let mut actors = Vec::with_capacity(self.lines.len());
        for (id, lines) in self.lines {
            let storage = Box::new(MemoryStore::with_trust_lines(lines.into_values()));
            let keystore = Box::new(DummyKeystore::new(id));
            let mut node = Node::new(self.config.clone(), storage, keystore)?;
            node.restore(actor::now())?;
            let (sender, receiver) = mpsc::unbounded_channel();
            actors.push((NodeHandle::new(node, sender), receiver));
        }
        let max_paths = self.max_paths;
        let peers = handle::peers(actors.iter().map(|(handle, _)| handle.clone()));
        let tasks = actors
            .into_iter()
            .map(|(handle, commands)| {
                let actor = NodeActor::new(&handle, commands, Peers::clone(&peers), event_sender.clone(), max_paths);
                tokio::spawn(actor.run())
            })
            .collect();
        info!("Local network started with {} nodes", peers.len());
        let network = LocalNetwork { peers, tasks, max_path_length: self.config.max_path_length, max_paths };
        Ok((network, event_receiver))
    }
}

/// A running set of nodes, each inside its own actor task.
pub struct LocalNetwork {
    peers: Peers,
    tasks: Vec<JoinHandle<()>>,
    max_path_length: usize,
    max_paths: usize,
}

impl LocalNetwork {
    pub fn node(&self, id: &NodeId) -> Result<&NodeHandle, NetworkError> {
        self.peers.get(id).ok_or(NetworkError::UnknownNode(*id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.peers.values()
    }

    pub async fn pay(&self, from: &NodeId, to: NodeId, amount: u64) -> Result<CommandResult, NetworkError> {
        self.node(from)?.pay(to, TrustLineAmount::new(amount)).await
    }

    /// Finds the debt cycles running through `node` and queues them there. Returns how many were queued.
    pub async fn close_cycles(&self, node: &NodeId) -> Result<usize, NetworkError> {
        let handle = self.node(node)?;
        let debts = actor::snapshot(&self.peers, actor::is_owed).await;
        let cycles = debts.cycles(*node, self.max_path_length, self.max_paths);
        debug!("{}: {} debt cycles found", node.short(), cycles.len());
        if cycles.is_empty() {
            return Ok(0);
        }
        handle.queue_cycles(cycles).await
    }

    /// Whether no node has a transaction running or anything reserved.
    pub async fn is_settled(&self) -> bool {
        for handle in self.peers.values() {
            if !handle.is_settled().await {
                return false;
            }
        }
        true
    }

    /// Stops every actor and waits for them to finish. Callers still waiting on a command get
    /// [`NetworkError::NodeStopped`].
    pub async fn shutdown(mut self) {
        self.peers.values().for_each(NodeHandle::shutdown);
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                error!("A node actor failed. {e}");
            }
        }
        info!("Local network stopped");
    }
}

impl Drop for LocalNetwork {
    fn drop(&mut self) {
        self.tasks.iter().for_each(JoinHandle::abort);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use libcredit::paths::Path;
    use libcredit::transactions::{Outcome, ResultCode};
    use std::time::Duration;

    fn id(name: &str) -> NodeId {
        NodeId::from_name(name)
    }

    fn builder(names: &[&str]) -> LocalNetworkBuilder {
        env_logger::try_init().ok();
        names
            .iter()
            .try_fold(LocalNetworkBuilder::new(ProtocolConfig::default()), |b, name| b.node(id(name)))
            .expect("distinct names")
    }

    async fn balance(network: &LocalNetwork, owner: &str, contractor: &str) -> i64 {
        network.node(&id(owner)).unwrap().balance(&id(contractor)).await.unwrap().value()
    }

    #[tokio::test(start_paused = true)]
    async fn payment_goes_through_an_intermediate() {
        let (network, mut events) = builder(&["a", "b", "c"])
            .link(id("a"), id("b"), 100, 0)
            .and_then(|b| b.link(id("b"), id("c"), 100, 0))
            .unwrap()
            .start()
            .unwrap();
        let result = network.pay(&id("a"), id("c"), 60).await.unwrap();
        assert_eq!(result.code, ResultCode::Ok);
        assert_eq!(result.amount, TrustLineAmount::new(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(balance(&network, "a", "b").await, -60);
        assert_eq!(balance(&network, "b", "a").await, 60);
        assert_eq!(balance(&network, "b", "c").await, -60);
        assert_eq!(balance(&network, "c", "b").await, 60);
        assert!(network.is_settled().await);
        let mut committed = 0;
        while let Ok(event) = events.try_recv() {
            if let NetworkEvent::MessageFinished { result, .. } = event {
                assert_eq!(result.outcome, Outcome::Committed);
                committed += 1;
            }
        }
        assert_eq!(committed, 2);
        assert_eq!(network.node(&id("c")).unwrap().history().await.unwrap().len(), 1);
        network.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_receiver_has_no_paths() {
        let (network, _events) = builder(&["a", "b", "c"]).link(id("a"), id("b"), 100, 0).unwrap().start().unwrap();
        let result = network.pay(&id("a"), id("c"), 10).await.unwrap();
        assert_eq!(result.code, ResultCode::NoPaths);
        assert!(network.is_settled().await);
        network.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn payments_larger_than_every_route_fail() {
        let (network, _events) = builder(&["a", "b"]).link(id("a"), id("b"), 50, 0).unwrap().start().unwrap();
        let result = network.pay(&id("a"), id("b"), 80).await.unwrap();
        assert_ne!(result.code, ResultCode::Ok);
        assert_eq!(balance(&network, "a", "b").await, 0);
        network.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commands_are_refused_up_front() {
        let (network, _events) = builder(&["a", "b"]).link(id("a"), id("b"), 50, 0).unwrap().start().unwrap();
        let refused = network.pay(&id("a"), id("a"), 10).await;
        assert!(matches!(refused, Err(NetworkError::Protocol(_))));
        let unknown = network.pay(&id("x"), id("a"), 10).await;
        assert!(matches!(unknown, Err(NetworkError::UnknownNode(_))));
        network.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_debt_cycles_are_closed() {
        let (network, mut events) = builder(&["a", "b", "c"])
            .link_with_debt(id("b"), id("a"), 100, 100, 30)
            .and_then(|b| b.link_with_debt(id("c"), id("b"), 100, 100, 20))
            .and_then(|b| b.link_with_debt(id("a"), id("c"), 100, 100, 40))
            .unwrap()
            .start()
            .unwrap();
        assert_eq!(network.close_cycles(&id("a")).await.unwrap(), 1);
        let result = loop {
            match events.recv().await {
                Some(NetworkEvent::CommandFinished { result, .. }) => break result,
                Some(_) => continue,
                None => panic!("network stopped"),
            }
        };
        assert_eq!(result.code, ResultCode::Ok);
        assert_eq!(result.amount, TrustLineAmount::new(20));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(balance(&network, "a", "b").await, 10);
        assert_eq!(balance(&network, "b", "c").await, 0);
        assert_eq!(balance(&network, "c", "a").await, 20);
        assert_eq!(network.close_cycles(&id("a")).await.unwrap(), 0);
        network.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cycle_closing_waits_for_its_result() {
        let (network, _events) = builder(&["a", "b", "c"])
            .link_with_debt(id("b"), id("a"), 100, 100, 5)
            .and_then(|b| b.link_with_debt(id("c"), id("b"), 100, 100, 5))
            .and_then(|b| b.link_with_debt(id("a"), id("c"), 100, 100, 5))
            .unwrap()
            .start()
            .unwrap();
        let cycle = Path::new(vec![id("a"), id("b"), id("c"), id("a")]).unwrap();
        let result = network.node(&id("a")).unwrap().close_cycle(cycle).await.unwrap();
        assert_eq!(result.code, ResultCode::Ok);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(network.is_settled().await);
        for (owner, contractor) in [("a", "b"), ("b", "c"), ("c", "a")] {
            assert_eq!(balance(&network, owner, contractor).await, 0);
        }
        network.shutdown().await;
    }

    #[test]
    fn links_need_known_nodes() {
        let builder = LocalNetworkBuilder::new(ProtocolConfig::default()).node(id("a")).unwrap();
        let result = builder.link(id("a"), id("b"), 1, 1);
        assert!(matches!(result, Err(NetworkError::UnknownNode(n)) if n == id("b")));
        let duplicate = LocalNetworkBuilder::new(ProtocolConfig::default()).node(id("a")).unwrap().node(id("a"));
        assert!(matches!(duplicate, Err(NetworkError::DuplicateNode(_))));
    }
}
