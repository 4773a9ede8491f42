//! One participant of the credit network.
//!
//! [`Node`] owns everything a node has: its trust lines, the running transactions, the storage handle, the audit
//! keystore and the queue of debt cycles to close. It never does I/O on its own. Callers feed it envelopes, paths and
//! clock ticks, then drain what it produced: outgoing envelopes, path requests and terminal results.

use crate::amount::TrustLineAmount;
use crate::config::ProtocolConfig;
use crate::cycles::CyclesManager;
use crate::error::ProtocolError;
use crate::ids::{NodeId, TransactionId};
use crate::keystore::Keystore;
use crate::messages::{
    Envelope, Message, MessageType, OutgoingMessage, RejectReason, ReservationResponse, VotesStatus,
};
use crate::paths::Path;
use crate::scheduler::TransactionsScheduler;
use crate::storage::{IOTransaction, PaymentRecord, StorageHandler};
use crate::transactions::{
    CommandResult, MessageResult, NodeContext, Outbox, PathsRequest, PaymentTransaction, Resource,
};
use crate::trust_lines::{TrustLine, TrustLineState, TrustLinesManager};
use log::*;
use std::time::Instant;

pub struct Node {
    id: NodeId,
    config: ProtocolConfig,
    trust_lines: TrustLinesManager,
    scheduler: TransactionsScheduler,
    storage: Box<dyn StorageHandler>,
    keystore: Box<dyn Keystore>,
    cycles: CyclesManager,
    outbox: Outbox,
    command_results: Vec<CommandResult>,
    message_results: Vec<MessageResult>,
}

impl Node {
    /// Creates a node with the trust lines found in `storage`. Interrupted transactions are not resumed until
    /// [`restore`](Self::restore) is called.
    pub fn new(
        config: ProtocolConfig,
        storage: Box<dyn StorageHandler>,
        keystore: Box<dyn Keystore>,
    ) -> Result<Self, ProtocolError> {
        let id = keystore.node_id();
        let lines = storage.load_trust_lines()?;
        debug!("{}: starting with {} trust lines", id.short(), lines.len());
        Ok(Node {
            id,
            config,
            trust_lines: TrustLinesManager::from_lines(lines),
            scheduler: TransactionsScheduler::new(),
            storage,
            keystore,
            cycles: CyclesManager::new(),
            outbox: Outbox::new(),
            command_results: Vec::new(),
            message_results: Vec::new(),
        })
    }

    /// Resumes the transactions a previous run left in storage. Each gets its reservations back and goes through
    /// recovery before anything else happens to it. Returns the number of resumed transactions.
    pub fn restore(&mut self, now: Instant) -> Result<usize, ProtocolError> {
        let stored = self.storage.load_transactions()?;
        let mut resumed = 0;
        for mut transaction in stored {
            let id = transaction.id();
            if self.scheduler.is_transaction_in_process(&id) {
                continue;
            }
            if let Err(e) = transaction.restore_reservations(&mut self.trust_lines) {
                error!("{}: cannot restore reservations, dropping it. {e}", id.short());
                self.trust_lines.release_transaction(&id);
                continue;
            }
            transaction.prepare_recovery();
            info!("{}: resuming as {:?} after a restart", id.short(), transaction.role_kind());
            self.scheduler.resume_transaction(transaction, now)?;
            resumed += 1;
        }
        self.on_timer(now);
        Ok(resumed)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn trust_lines(&self) -> &TrustLinesManager {
        &self.trust_lines
    }

    pub fn scheduler(&self) -> &TransactionsScheduler {
        &self.scheduler
    }

    pub fn cycles(&self) -> &CyclesManager {
        &self.cycles
    }

    pub fn storage(&self) -> &dyn StorageHandler {
        self.storage.as_ref()
    }

    /// Hands the storage back, dropping everything that only lived in memory.
    pub fn into_storage(self) -> Box<dyn StorageHandler> {
        self.storage
    }

    //------------------------------------         Commands         ------------------------------------------------//

    /// Starts a payment of `amount` to `receiver`. The outcome arrives later as a [`CommandResult`].
    pub fn pay(
        &mut self,
        receiver: NodeId,
        amount: TrustLineAmount,
        now: Instant,
    ) -> Result<TransactionId, ProtocolError> {
        self.pay_with_id(TransactionId::random(), receiver, amount, now)
    }

    pub fn pay_with_id(
        &mut self,
        id: TransactionId,
        receiver: NodeId,
        amount: TrustLineAmount,
        now: Instant,
    ) -> Result<TransactionId, ProtocolError> {
        if amount.is_zero() {
            return Err(ProtocolError::value("cannot pay nothing"));
        }
        if receiver == self.id {
            return Err(ProtocolError::value("cannot pay to self"));
        }
        self.scheduler.schedule_transaction(PaymentTransaction::payment(id, self.id, receiver, amount), now)?;
        self.on_timer(now);
        Ok(id)
    }

    /// Starts closing `cycle` right away, regardless of the cycle queue.
    pub fn close_cycle(&mut self, cycle: Path, now: Instant) -> Result<TransactionId, ProtocolError> {
        cycle.validate_cycle(&self.id, self.config.max_path_length)?;
        let id = TransactionId::random();
        self.scheduler.schedule_transaction(PaymentTransaction::cycle_closing(id, self.id, cycle), now)?;
        self.on_timer(now);
        Ok(id)
    }

    /// Queues cycles for closing, one at a time. Returns how many were queued.
    pub fn queue_cycles(&mut self, cycles: impl IntoIterator<Item = Path>, now: Instant) -> usize {
        let me = self.id;
        let max_length = self.config.max_path_length;
        let valid = cycles.into_iter().filter(|c| c.validate_cycle(&me, max_length).is_ok());
        let queued = self.cycles.add_cycles(valid);
        self.on_timer(now);
        queued
    }

    /// Delivers candidate paths for a payment that asked for them.
    pub fn attach_paths(
        &mut self,
        transaction_id: TransactionId,
        paths: Vec<Path>,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        self.scheduler.try_attach_resource(Resource::Paths { transaction_id, paths }, now)?;
        self.on_timer(now);
        Ok(())
    }

    pub fn kill_transaction(&mut self, transaction_id: &TransactionId, now: Instant) -> Result<(), ProtocolError> {
        let mut ctx = NodeContext {
            node_id: self.id,
            config: &self.config,
            trust_lines: &mut self.trust_lines,
            storage: self.storage.as_mut(),
            outbox: &mut self.outbox,
        };
        self.scheduler.kill_transaction(transaction_id, &mut ctx)?;
        self.on_timer(now);
        Ok(())
    }

    //------------------------------------         Messages         ------------------------------------------------//

    /// Routes an incoming envelope to its transaction, starts a new one, or answers it directly.
    pub fn handle_message(&mut self, envelope: Envelope, now: Instant) {
        trace!("{}: received {envelope}", self.id.short());
        let foreign_request = matches!(
            &envelope.message,
            Message::IntermediateNodeReservationRequest(request) if request.coordinator != self.id
        );
        match envelope.message_type() {
            MessageType::VotesStatusRequest => self.answer_votes_status(&envelope),
            MessageType::TtlProlongationRequest => {
                let alive = self.is_coordinating(&envelope.transaction_id);
                self.send(envelope.sender, envelope.transaction_id, Message::TtlProlongationResponse { alive });
            }
            _ if self.scheduler.is_transaction_in_process(&envelope.transaction_id) => {
                self.attach_message(envelope, now)
            }
            MessageType::ReceiverInitPaymentRequest => {
                self.start_transaction(PaymentTransaction::receiver(self.id, envelope), now)
            }
            MessageType::IntermediateNodeReservationRequest if foreign_request => {
                self.start_transaction(PaymentTransaction::intermediate(self.id, envelope), now)
            }
            _ => debug!("{}: dropping {envelope}, no transaction for it", self.id.short()),
        }
        self.on_timer(now);
    }

    fn attach_message(&mut self, envelope: Envelope, now: Instant) {
        let reply = match &envelope.message {
            Message::IntermediateNodeReservationRequest(request) => Some((envelope.sender, request.path_id)),
            _ => None,
        };
        let transaction_id = envelope.transaction_id;
        if let Err(e) = self.scheduler.try_attach_message(envelope, now) {
            debug!("{}: {e}", self.id.short());
            if let Some((sender, path_id)) = reply {
                let response = ReservationResponse::rejected(path_id, RejectReason::ProtocolViolation);
                self.send(sender, transaction_id, Message::IntermediateNodeReservationResponse(response));
            }
        }
    }

    fn start_transaction(&mut self, transaction: Result<PaymentTransaction, ProtocolError>, now: Instant) {
        let result = transaction.and_then(|t| self.scheduler.schedule_transaction(t, now));
        if let Err(e) = result {
            warn!("{}: could not start a transaction. {e}", self.id.short());
        }
    }

    fn is_coordinating(&self, transaction_id: &TransactionId) -> bool {
        self.scheduler.transaction(transaction_id).is_some_and(|t| t.coordinator() == self.id)
    }

    /// Tells a participant how one of this node's transactions ended, or that it is still running.
    fn answer_votes_status(&mut self, envelope: &Envelope) {
        let id = envelope.transaction_id;
        let status = if self.is_coordinating(&id) {
            VotesStatus::InProgress
        } else {
            match self.storage.load_votes(&id) {
                Ok(Some(votes)) if votes.coordinator() == self.id => VotesStatus::Known(votes),
                Ok(_) => VotesStatus::Unknown,
                Err(e) => {
                    warn!("{}: cannot read the votes of {}. {e}", self.id.short(), id.short());
                    VotesStatus::InProgress
                }
            }
        };
        debug!("{}: votes status of {} for {}: {status:?}", self.id.short(), id.short(), envelope.sender.short());
        self.send(envelope.sender, id, Message::VotesStatusResponse(status));
    }

    fn send(&mut self, recipient: NodeId, transaction_id: TransactionId, message: Message) {
        self.outbox.push_message(recipient, Envelope::new(self.id, transaction_id, message));
    }

    //------------------------------------          Timers          ------------------------------------------------//

    /// Runs every transaction that is due, then starts the next queued cycle closing if none is running.
    pub fn on_timer(&mut self, now: Instant) {
        loop {
            let mut ctx = NodeContext {
                node_id: self.id,
                config: &self.config,
                trust_lines: &mut self.trust_lines,
                storage: self.storage.as_mut(),
                outbox: &mut self.outbox,
            };
            self.scheduler.handle_awakening(&mut ctx, now);
            self.collect_results();
            if !self.launch_next_cycle(now) {
                break;
            }
        }
    }

    fn collect_results(&mut self) {
        self.command_results.extend(self.scheduler.take_command_results());
        self.message_results.extend(self.scheduler.take_message_results());
        for (from, to) in self.outbox.take_closed_edges() {
            self.cycles.close_edge(from, to);
        }
        for id in self.scheduler.take_finished_cycle_closers() {
            self.cycles.on_finished(&id);
        }
    }

    fn launch_next_cycle(&mut self, now: Instant) -> bool {
        while let Some(cycle) = self.cycles.next_cycle() {
            let id = TransactionId::random();
            let transaction = PaymentTransaction::cycle_closing(id, self.id, cycle);
            match self.scheduler.schedule_transaction(transaction, now) {
                Ok(()) => {
                    self.cycles.start(id);
                    return true;
                }
                Err(e) => warn!("{}: could not start a cycle closing. {e}", self.id.short()),
            }
        }
        false
    }

    pub fn next_awakening(&self) -> Option<Instant> {
        self.scheduler.next_awakening()
    }

    //------------------------------------          Output          ------------------------------------------------//

    pub fn drain_outbox(&mut self) -> Vec<OutgoingMessage> {
        self.outbox.take_messages()
    }

    pub fn drain_path_requests(&mut self) -> Vec<PathsRequest> {
        self.outbox.take_paths_requests()
    }

    pub fn drain_command_results(&mut self) -> Vec<CommandResult> {
        std::mem::take(&mut self.command_results)
    }

    pub fn drain_message_results(&mut self) -> Vec<MessageResult> {
        std::mem::take(&mut self.message_results)
    }

    pub fn history(&self) -> Result<Vec<PaymentRecord>, ProtocolError> {
        Ok(self.storage.payment_history()?)
    }

    //------------------------------------       Trust lines        ------------------------------------------------//

    /// Proposes a trust line to `contractor`. It carries no payments until accepted.
    pub fn open_trust_line(
        &mut self,
        contractor: NodeId,
        incoming: TrustLineAmount,
        outgoing: TrustLineAmount,
    ) -> Result<TrustLine, ProtocolError> {
        if contractor == self.id {
            return Err(ProtocolError::value("cannot open a trust line with self"));
        }
        self.update_trust_line(&contractor, |lines, _| {
            lines.open(contractor, incoming, outgoing)?;
            Ok(())
        })
    }

    /// Completes the key exchange and the first audit of a proposed trust line, which becomes active.
    pub fn accept_trust_line(&mut self, contractor: &NodeId) -> Result<TrustLine, ProtocolError> {
        self.update_trust_line(contractor, |lines, keystore| {
            lines.move_to(contractor, TrustLineState::KeysPending)?;
            lines.move_to(contractor, TrustLineState::AuditPending)?;
            audit(lines, keystore, contractor)
        })
    }

    pub fn set_outgoing_trust(
        &mut self,
        contractor: &NodeId,
        amount: TrustLineAmount,
    ) -> Result<TrustLine, ProtocolError> {
        self.update_trust_line(contractor, |lines, keystore| {
            lines.set_outgoing_trust(contractor, amount)?;
            audit(lines, keystore, contractor)
        })
    }

    pub fn set_incoming_trust(
        &mut self,
        contractor: &NodeId,
        amount: TrustLineAmount,
    ) -> Result<TrustLine, ProtocolError> {
        self.update_trust_line(contractor, |lines, keystore| {
            lines.set_incoming_trust(contractor, amount)?;
            audit(lines, keystore, contractor)
        })
    }

    /// Stops trusting `contractor`. Their existing debt stays on the line.
    pub fn close_incoming_trust_line(&mut self, contractor: &NodeId) -> Result<TrustLine, ProtocolError> {
        self.set_incoming_trust(contractor, TrustLineAmount::ZERO)
    }

    /// Archives a settled trust line.
    pub fn archive_trust_line(&mut self, contractor: &NodeId) -> Result<TrustLine, ProtocolError> {
        self.update_trust_line(contractor, |lines, _| {
            lines.archive(contractor)?;
            Ok(())
        })
    }

    /// Checks the signature of the last audit recorded on the trust line with `contractor`.
    pub fn verify_audit(&self, contractor: &NodeId) -> Result<(), ProtocolError> {
        let line = self.trust_lines.trust_line(contractor)?;
        if line.audit_number() == 0 {
            return Err(ProtocolError::not_found(format!("trust line with {contractor} was never audited")));
        }
        self.keystore.verify(&self.id, &line.audited_payload(), line.audit_signature())?;
        Ok(())
    }

    /// Applies a lifecycle change and persists the resulting line. If either step fails the line is put back as it
    /// was.
    fn update_trust_line<F>(&mut self, contractor: &NodeId, change: F) -> Result<TrustLine, ProtocolError>
    where
        F: FnOnce(&mut TrustLinesManager, &dyn Keystore) -> Result<(), ProtocolError>,
    {
        let before = self.trust_lines.trust_line(contractor).ok().cloned();
        let result = change(&mut self.trust_lines, self.keystore.as_ref()).and_then(|()| {
            let line = self.trust_lines.trust_line(contractor)?.clone();
            let mut io = IOTransaction::begin(self.storage.as_mut());
            io.save_trust_line(&line);
            io.commit()?;
            Ok(line)
        });
        match &result {
            Ok(line) => info!("{}: trust line with {} is {}", self.id.short(), contractor.short(), line.state()),
            Err(e) => {
                warn!("{}: trust line change with {} failed. {e}", self.id.short(), contractor.short());
                match before {
                    Some(line) => self.trust_lines.put_line(line),
                    None => {
                        self.trust_lines.remove_line(contractor);
                    }
                }
            }
        }
        result
    }
}

fn audit(lines: &mut TrustLinesManager, keystore: &dyn Keystore, contractor: &NodeId) -> Result<(), ProtocolError> {
    let payload = lines.trust_line(contractor)?.audit_payload();
    let signature = keystore.sign(&payload)?;
    lines.record_audit(contractor, signature)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::keystore::DummyKeystore;
    use crate::storage::MemoryStore;

    fn node(name: &str) -> Node {
        let keystore = DummyKeystore::new(NodeId::from_name(name));
        Node::new(ProtocolConfig::default(), Box::new(MemoryStore::new()), Box::new(keystore)).unwrap()
    }

    #[test]
    fn trust_line_lifecycle() {
        let mut alice = node("alice");
        let bob = NodeId::from_name("bob");
        let line = alice.open_trust_line(bob, TrustLineAmount::new(50), TrustLineAmount::new(100)).unwrap();
        assert_eq!(line.state(), TrustLineState::Init);
        assert!(!alice.trust_lines().is_neighbor(&bob));

        let line = alice.accept_trust_line(&bob).unwrap();
        assert_eq!(line.state(), TrustLineState::Active);
        assert_eq!(line.audit_number(), 1);
        alice.verify_audit(&bob).unwrap();

        let line = alice.set_outgoing_trust(&bob, TrustLineAmount::new(200)).unwrap();
        assert_eq!(line.state(), TrustLineState::Active);
        assert_eq!(line.audit_number(), 2);
        assert_eq!(alice.trust_lines().available_outgoing(&bob).unwrap(), TrustLineAmount::new(200));
        alice.verify_audit(&bob).unwrap();

        alice.close_incoming_trust_line(&bob).unwrap();
        assert!(alice.trust_lines().available_incoming(&bob).unwrap().is_zero());
        let line = alice.archive_trust_line(&bob).unwrap();
        assert_eq!(line.state(), TrustLineState::Archived);
        assert_eq!(alice.storage().load_trust_lines().unwrap()[0].state(), TrustLineState::Archived);
    }

    #[test]
    fn failed_persistence_unwinds_trust_line_changes() {
        let bob = NodeId::from_name("bob");
        let mut store = MemoryStore::new();
        store.set_unavailable(true);
        let keystore = DummyKeystore::new(NodeId::from_name("alice"));
        let mut alice = Node::new(ProtocolConfig::default(), Box::new(store), Box::new(keystore)).unwrap();
        assert!(alice.open_trust_line(bob, TrustLineAmount::new(1), TrustLineAmount::new(1)).is_err());
        assert!(alice.trust_lines().trust_line(&bob).is_err());
    }

    #[test]
    fn payments_are_validated_up_front() {
        let mut alice = node("alice");
        let now = Instant::now();
        let me = alice.id();
        assert!(alice.pay(me, TrustLineAmount::new(5), now).is_err());
        assert!(alice.pay(NodeId::from_name("bob"), TrustLineAmount::ZERO, now).is_err());
        assert_eq!(alice.scheduler().transactions_count(), 0);
    }

    #[test]
    fn unknown_votes_status_requests_get_unknown() {
        let mut alice = node("alice");
        let bob = NodeId::from_name("bob");
        let id = TransactionId::from_counter(42);
        alice.handle_message(Envelope::new(bob, id, Message::VotesStatusRequest), Instant::now());
        let out = alice.drain_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].recipient, bob);
        assert_eq!(out[0].envelope.message, Message::VotesStatusResponse(VotesStatus::Unknown));
    }
}
