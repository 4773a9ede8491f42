use crate::ids::{NodeId, TransactionId};
use crate::messages::ParticipantsVotesMessage;
use crate::storage::{PaymentRecord, StorageError, StorageHandler, StorageOp};
use crate::transactions::PaymentTransaction;
use crate::trust_lines::TrustLine;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory [`StorageHandler`]. Used by tests and by the simulator.
#[derive(Default)]
pub struct MemoryStore {
    transactions: BTreeMap<TransactionId, PaymentTransaction>,
    votes: BTreeMap<TransactionId, ParticipantsVotesMessage>,
    trust_lines: BTreeMap<NodeId, TrustLine>,
    history: Vec<PaymentRecord>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Pre-populates the store, as if the lines had been saved by an earlier run.
    pub fn with_trust_lines(lines: impl IntoIterator<Item = TrustLine>) -> Self {
        let trust_lines = lines.into_iter().map(|tl| (tl.contractor(), tl)).collect();
        MemoryStore { trust_lines, ..MemoryStore::default() }
    }

    /// While unavailable, every batch fails and nothing is written.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// A handle that switches the store off and on after it has been handed to a node.
    pub fn availability_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.unavailable)
    }

    pub fn saved_transactions(&self) -> usize {
        self.transactions.len()
    }
}

impl StorageHandler for MemoryStore {
    fn apply(&mut self, ops: Vec<StorageOp>) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".into()));
        }
        for op in ops {
            match op {
                StorageOp::SaveTransaction(tx) => {
                    self.transactions.insert(tx.id(), *tx);
                }
                StorageOp::DeleteTransaction(id) => {
                    self.transactions.remove(&id);
                }
                StorageOp::SaveVotes(id, votes) => {
                    self.votes.insert(id, votes);
                }
                StorageOp::SavePaymentRecord(record) => self.history.push(record),
                StorageOp::SaveTrustLine(line) => {
                    self.trust_lines.insert(line.contractor(), line);
                }
            }
        }
        Ok(())
    }

    fn load_transactions(&self) -> Result<Vec<PaymentTransaction>, StorageError> {
        Ok(self.transactions.values().cloned().collect())
    }

    fn load_votes(&self, transaction_id: &TransactionId) -> Result<Option<ParticipantsVotesMessage>, StorageError> {
        Ok(self.votes.get(transaction_id).cloned())
    }

    fn load_trust_lines(&self) -> Result<Vec<TrustLine>, StorageError> {
        Ok(self.trust_lines.values().cloned().collect())
    }

    fn payment_history(&self) -> Result<Vec<PaymentRecord>, StorageError> {
        Ok(self.history.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::amount::{TrustLineAmount, TrustLineBalance};
    use crate::storage::IOTransaction;

    fn line(name: &str) -> TrustLine {
        let (incoming, outgoing) = (TrustLineAmount::new(1), TrustLineAmount::new(2));
        TrustLine::active(NodeId::from_name(name), incoming, outgoing, TrustLineBalance::ZERO)
    }

    #[test]
    fn batches_are_all_or_nothing() {
        let mut store = MemoryStore::new();
        store.set_unavailable(true);
        let mut io = IOTransaction::begin(&mut store);
        io.save_trust_line(&line("bob"));
        assert!(matches!(io.commit(), Err(StorageError::Unavailable(_))));
        assert!(store.load_trust_lines().unwrap().is_empty());

        store.set_unavailable(false);
        let mut io = IOTransaction::begin(&mut store);
        io.save_trust_line(&line("bob"));
        io.save_trust_line(&line("carol"));
        io.commit().unwrap();
        assert_eq!(store.load_trust_lines().unwrap().len(), 2);
    }

    #[test]
    fn rollback_discards() {
        let mut store = MemoryStore::new();
        let mut io = IOTransaction::begin(&mut store);
        io.save_trust_line(&line("bob"));
        io.rollback();
        assert!(store.load_trust_lines().unwrap().is_empty());
    }
}
