//! Runs payment transactions step by step.
//!
//! Every live transaction has exactly one wake-up policy at a time. The scheduler runs a transaction when its
//! awakening time comes, or right away when a message or resource it waits for is attached. Terminal results are
//! collected for the node to hand out; failed steps are unwound and reported as a terminal failure.

use crate::amount::TrustLineAmount;
use crate::error::ProtocolError;
use crate::ids::TransactionId;
use crate::messages::Envelope;
use crate::transactions::{
    CommandResult, LiveTransactions, MessageResult, NodeContext, Outcome, PaymentTransaction, Resource,
    TransactionResult, TransactionState,
};
use log::*;
use std::collections::BTreeMap;
use std::time::Instant;

/// Upper bound on steps run by a single [`TransactionsScheduler::handle_awakening`] call.
const MAX_STEPS_PER_AWAKENING: usize = 10_000;

struct ScheduledTransaction {
    transaction: PaymentTransaction,
    state: TransactionState,
    awakening: Option<Instant>,
    /// Timeout of the wait that was interrupted by the last attached message or resource.
    deadline: Option<Instant>,
}

/// The transactions still running while another one takes a step.
struct Registry<'a>(&'a BTreeMap<TransactionId, ScheduledTransaction>);

impl LiveTransactions for Registry<'_> {
    fn is_alive(&self, transaction_id: &TransactionId) -> bool {
        self.0.contains_key(transaction_id)
    }
}

#[derive(Default)]
pub struct TransactionsScheduler {
    transactions: BTreeMap<TransactionId, ScheduledTransaction>,
    command_results: Vec<CommandResult>,
    message_results: Vec<MessageResult>,
    finished_cycle_closers: Vec<TransactionId>,
}

impl TransactionsScheduler {
    pub fn new() -> Self {
        TransactionsScheduler::default()
    }

    /// Adds a transaction that runs at the next awakening.
    pub fn schedule_transaction(&mut self, transaction: PaymentTransaction, now: Instant) -> Result<(), ProtocolError> {
        let id = transaction.id();
        if self.transactions.contains_key(&id) {
            return Err(ProtocolError::conflict(format!("transaction {id} is already running")));
        }
        debug!("{}: scheduled as {:?}", id.short(), transaction.role_kind());
        let state = TransactionState::as_fast_as_possible();
        let awakening = state.awakening(now);
        self.transactions.insert(id, ScheduledTransaction { transaction, state, awakening, deadline: None });
        Ok(())
    }

    /// Hands a message to the transaction it belongs to, if that transaction is waiting for it.
    ///
    /// Messages that only the coordinator may send are refused when they come from anyone else.
    pub fn try_attach_message(&mut self, envelope: Envelope, now: Instant) -> Result<(), ProtocolError> {
        let message_type = envelope.message_type();
        let scheduled = self
            .transactions
            .get_mut(&envelope.transaction_id)
            .filter(|s| s.state.accepts_message(message_type))
            .ok_or_else(|| ProtocolError::not_found(format!("no transaction is waiting for {envelope}")))?;
        if message_type.requires_coordinator_sender() && envelope.sender != scheduled.transaction.coordinator() {
            return Err(ProtocolError::not_found(format!("{envelope} does not come from the coordinator")));
        }
        scheduled.transaction.push_message(envelope);
        scheduled.state = TransactionState::as_fast_as_possible();
        scheduled.deadline = scheduled.awakening;
        scheduled.awakening = Some(now);
        Ok(())
    }

    pub fn try_attach_resource(&mut self, resource: Resource, now: Instant) -> Result<(), ProtocolError> {
        let id = resource.transaction_id();
        let scheduled = self
            .transactions
            .get_mut(&id)
            .filter(|s| s.state.accepts_resource(resource.resource_type()))
            .ok_or_else(|| ProtocolError::not_found(format!("no transaction {id} is waiting for a resource")))?;
        scheduled.transaction.push_resource(resource);
        scheduled.state = TransactionState::as_fast_as_possible();
        scheduled.deadline = scheduled.awakening;
        scheduled.awakening = Some(now);
        Ok(())
    }

    /// Runs every transaction whose awakening has come, until none is due. Returns the number of steps run.
    pub fn handle_awakening(&mut self, ctx: &mut NodeContext<'_>, now: Instant) -> usize {
        let mut steps = 0;
        while let Some(id) = self.due_transaction(now) {
            if steps >= MAX_STEPS_PER_AWAKENING {
                error!("{}: still due after {steps} steps, deferring the rest", id.short());
                break;
            }
            self.launch_transaction(&id, ctx, now);
            steps += 1;
        }
        steps
    }

    fn due_transaction(&self, now: Instant) -> Option<TransactionId> {
        self.transactions
            .iter()
            .filter_map(|(id, s)| s.awakening.filter(|at| *at <= now).map(|at| (at, *id)))
            .min()
            .map(|(_, id)| id)
    }

    /// Runs one step of a transaction and reschedules it according to the state it returns.
    pub fn launch_transaction(&mut self, id: &TransactionId, ctx: &mut NodeContext<'_>, now: Instant) {
        let Some(mut scheduled) = self.transactions.remove(id) else {
            warn!("{}: asked to launch a transaction that is not running", id.short());
            return;
        };
        let mark = ctx.outbox.mark();
        let result = scheduled.transaction.run(ctx, &Registry(&self.transactions));
        let state = match result {
            Ok(TransactionResult::State(state)) => state,
            Ok(TransactionResult::Command(result)) => {
                debug!("{}: finished with {}", id.short(), result.code);
                self.command_results.push(result);
                self.forget(scheduled.transaction, ctx);
                return;
            }
            Ok(TransactionResult::Message(result)) => {
                debug!("{}: finished, {:?}", id.short(), result.outcome);
                self.message_results.push(result);
                self.forget(scheduled.transaction, ctx);
                return;
            }
            Err(e) => {
                self.abort(scheduled.transaction, ctx, &e);
                return;
            }
        };
        if state.needs_persist() {
            if let Err(e) = Self::persist(&mut scheduled.transaction, ctx) {
                let discarded = ctx.outbox.discard_messages_since(mark);
                error!("{}: could not persist the step, {discarded} messages withheld. {e}", id.short());
                self.abort(scheduled.transaction, ctx, &e);
                return;
            }
        }
        if !state.must_be_rescheduled() {
            debug!("{}: exited", id.short());
            self.forget(scheduled.transaction, ctx);
            return;
        }
        scheduled.awakening = match scheduled.deadline.take() {
            Some(deadline) if state.keeps_deadline() => Some(deadline),
            _ => state.awakening(now),
        };
        scheduled.state = state;
        self.transactions.insert(*id, scheduled);
    }

    fn persist(transaction: &mut PaymentTransaction, ctx: &mut NodeContext<'_>) -> Result<(), ProtocolError> {
        let mut io = ctx.begin_io();
        io.save_transaction(transaction);
        io.commit()?;
        transaction.mark_persisted();
        trace!("{}: persisted at step {}", transaction.id().short(), transaction.step());
        Ok(())
    }

    fn abort(&mut self, mut transaction: PaymentTransaction, ctx: &mut NodeContext<'_>, error: &ProtocolError) {
        match transaction.abort(ctx, error) {
            Some(result) => self.command_results.push(result),
            None => self.message_results.push(MessageResult {
                transaction_id: transaction.id(),
                role: transaction.role_kind(),
                outcome: Outcome::RolledBack,
                amount: TrustLineAmount::ZERO,
            }),
        }
        self.forget(transaction, ctx);
    }

    /// Drops a finished transaction along with anything it might have left behind.
    fn forget(&mut self, transaction: PaymentTransaction, ctx: &mut NodeContext<'_>) {
        let id = transaction.id();
        let leftovers = ctx.trust_lines.release_transaction(&id);
        if leftovers > 0 {
            warn!("{}: released {leftovers} reservations left behind", id.short());
        }
        if transaction.is_persisted() {
            let mut io = ctx.begin_io();
            io.delete_transaction(id);
            if let Err(e) = io.commit() {
                warn!("{}: could not delete the stored snapshot. {e}", id.short());
            }
        }
        if transaction.is_cycle_closer() {
            self.finished_cycle_closers.push(id);
        }
    }

    /// Stops a transaction from the outside, unwinding it like a failed step.
    pub fn kill_transaction(&mut self, id: &TransactionId, ctx: &mut NodeContext<'_>) -> Result<(), ProtocolError> {
        let scheduled =
            self.transactions.remove(id).ok_or_else(|| ProtocolError::not_found(format!("no transaction {id}")))?;
        info!("{}: killed", id.short());
        self.abort(scheduled.transaction, ctx, &ProtocolError::runtime("killed"));
        Ok(())
    }

    /// Puts a transaction restored from storage back in the schedule, ready to run.
    pub(crate) fn resume_transaction(
        &mut self,
        transaction: PaymentTransaction,
        now: Instant,
    ) -> Result<(), ProtocolError> {
        self.schedule_transaction(transaction, now)
    }

    pub fn next_awakening(&self) -> Option<Instant> {
        self.transactions.values().filter_map(|s| s.awakening).min()
    }

    pub fn is_transaction_in_process(&self, id: &TransactionId) -> bool {
        self.transactions.contains_key(id)
    }

    pub fn transaction(&self, id: &TransactionId) -> Option<&PaymentTransaction> {
        self.transactions.get(id).map(|s| &s.transaction)
    }

    pub fn transaction_state(&self, id: &TransactionId) -> Option<&TransactionState> {
        self.transactions.get(id).map(|s| &s.state)
    }

    pub fn transactions_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn take_command_results(&mut self) -> Vec<CommandResult> {
        std::mem::take(&mut self.command_results)
    }

    pub fn take_message_results(&mut self) -> Vec<MessageResult> {
        std::mem::take(&mut self.message_results)
    }

    pub fn take_finished_cycle_closers(&mut self) -> Vec<TransactionId> {
        std::mem::take(&mut self.finished_cycle_closers)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::amount::TrustLineBalance;
    use crate::config::ProtocolConfig;
    use crate::ids::NodeId;
    use crate::messages::{Message, MessageType, ResponseState};
    use crate::storage::MemoryStore;
    use crate::transactions::{Outbox, ResultCode};
    use crate::trust_lines::{TrustLine, TrustLinesManager};
    use std::time::Duration;

    struct Fixture {
        me: NodeId,
        config: ProtocolConfig,
        trust_lines: TrustLinesManager,
        storage: MemoryStore,
        outbox: Outbox,
    }

    impl Fixture {
        fn new() -> Self {
            let me = NodeId::from_name("alice");
            let bob = NodeId::from_name("bob");
            let outgoing = TrustLineAmount::from(100);
            let line = TrustLine::active(bob, TrustLineAmount::ZERO, outgoing, TrustLineBalance::ZERO);
            Fixture {
                me,
                config: ProtocolConfig::default(),
                trust_lines: TrustLinesManager::from_lines([line]),
                storage: MemoryStore::new(),
                outbox: Outbox::new(),
            }
        }

        fn ctx(&mut self) -> NodeContext<'_> {
            NodeContext {
                node_id: self.me,
                config: &self.config,
                trust_lines: &mut self.trust_lines,
                storage: &mut self.storage,
                outbox: &mut self.outbox,
            }
        }
    }

    fn payment(me: NodeId, counter: u64) -> PaymentTransaction {
        let receiver = NodeId::from_name("carol");
        PaymentTransaction::payment(TransactionId::from_counter(counter), me, receiver, TrustLineAmount::from(10))
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let me = NodeId::from_name("alice");
        let now = Instant::now();
        let mut scheduler = TransactionsScheduler::new();
        scheduler.schedule_transaction(payment(me, 1), now).unwrap();
        let err = scheduler.schedule_transaction(payment(me, 1), now).unwrap_err();
        assert!(matches!(err, ProtocolError::Conflict(_)));
        assert_eq!(scheduler.transactions_count(), 1);
    }

    #[test]
    fn payment_waits_for_paths_then_times_out() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        let mut scheduler = TransactionsScheduler::new();
        let id = TransactionId::from_counter(7);
        scheduler.schedule_transaction(payment(fx.me, 7), now).unwrap();
        assert_eq!(scheduler.handle_awakening(&mut fx.ctx(), now), 1);
        assert!(scheduler.is_transaction_in_process(&id));
        assert_eq!(fx.outbox.take_paths_requests().len(), 1);
        let wake = scheduler.next_awakening().unwrap();
        assert_eq!(wake, now + fx.config.resource_timeout());

        // Nothing due yet.
        assert_eq!(scheduler.handle_awakening(&mut fx.ctx(), now + Duration::from_millis(1)), 0);
        scheduler.handle_awakening(&mut fx.ctx(), wake);
        assert!(!scheduler.is_transaction_in_process(&id));
        let results = scheduler.take_command_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].code, ResultCode::NoPaths);
    }

    #[test]
    fn unexpected_messages_are_not_attached() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        let mut scheduler = TransactionsScheduler::new();
        let id = TransactionId::from_counter(3);
        scheduler.schedule_transaction(payment(fx.me, 3), now).unwrap();
        scheduler.handle_awakening(&mut fx.ctx(), now);
        let stray = Envelope::new(
            NodeId::from_name("carol"),
            id,
            Message::ReceiverInitPaymentResponse { state: ResponseState::Accepted },
        );
        assert_eq!(stray.message_type(), MessageType::ReceiverInitPaymentResponse);
        assert!(matches!(scheduler.try_attach_message(stray, now), Err(ProtocolError::NotFound(_))));
        let other = TransactionId::from_counter(4);
        let unknown = Envelope::new(NodeId::from_name("carol"), other, Message::VotesStatusRequest);
        assert!(scheduler.try_attach_message(unknown, now).is_err());
    }

    #[test]
    fn stray_messages_do_not_extend_a_wait() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        let mut scheduler = TransactionsScheduler::new();
        let id = TransactionId::from_counter(5);
        scheduler.schedule_transaction(payment(fx.me, 5), now).unwrap();
        scheduler.handle_awakening(&mut fx.ctx(), now);
        let route = ["alice", "bob", "carol"].iter().map(|n| NodeId::from_name(n)).collect();
        let paths = vec![crate::paths::Path::new(route).unwrap()];
        scheduler.try_attach_resource(Resource::Paths { transaction_id: id, paths }, now).unwrap();
        scheduler.handle_awakening(&mut fx.ctx(), now);
        let deadline = now + fx.config.max_network_delay(2);
        assert_eq!(scheduler.next_awakening(), Some(deadline));

        // Only carol may answer, so bob's responses are dropped without pushing the timeout back.
        for elapsed in [1000, 2000, 2900] {
            let at = now + Duration::from_millis(elapsed);
            let stray = Envelope::new(
                NodeId::from_name("bob"),
                id,
                Message::ReceiverInitPaymentResponse { state: ResponseState::Accepted },
            );
            scheduler.try_attach_message(stray, at).unwrap();
            assert_eq!(scheduler.handle_awakening(&mut fx.ctx(), at), 1);
            assert_eq!(scheduler.next_awakening(), Some(deadline));
        }
        scheduler.handle_awakening(&mut fx.ctx(), deadline);
        assert!(!scheduler.is_transaction_in_process(&id));
        assert_eq!(scheduler.take_command_results()[0].code, ResultCode::NoResponse);
    }

    #[test]
    fn killed_coordinator_reports_a_failure() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        let mut scheduler = TransactionsScheduler::new();
        let id = TransactionId::from_counter(9);
        scheduler.schedule_transaction(payment(fx.me, 9), now).unwrap();
        scheduler.kill_transaction(&id, &mut fx.ctx()).unwrap();
        assert_eq!(scheduler.transactions_count(), 0);
        let results = scheduler.take_command_results();
        assert_eq!(results[0].code, ResultCode::ProtocolError);
        assert!(scheduler.kill_transaction(&id, &mut fx.ctx()).is_err());
    }
}
