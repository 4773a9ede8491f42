//! Persistence contract of the payment engine.
//!
//! The engine never talks to a storage engine directly. It collects writes in an [`IOTransaction`] and hands them to
//! a [`StorageHandler`] in one batch on commit; a failed commit leaves the store as it was, and the caller unwinds its
//! in-memory changes to match.

mod file_store;
mod memory_store;
mod records;

pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use records::{PaymentDirection, PaymentRecord};

use crate::ids::TransactionId;
use crate::messages::ParticipantsVotesMessage;
use crate::transactions::PaymentTransaction;
use crate::trust_lines::TrustLine;
use log::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error serializing record. {0}")]
    Serialization(#[from] ron::Error),
    #[error("Error reading record. {0}")]
    Deserialization(#[from] ron::error::SpannedError),
    #[error("The storage backend is unavailable. {0}")]
    Unavailable(String),
}

/// One write inside an [`IOTransaction`].
#[derive(Clone, Debug)]
pub enum StorageOp {
    SaveTransaction(Box<PaymentTransaction>),
    DeleteTransaction(TransactionId),
    SaveVotes(TransactionId, ParticipantsVotesMessage),
    SavePaymentRecord(PaymentRecord),
    SaveTrustLine(TrustLine),
}

pub trait StorageHandler: Send {
    /// Applies a batch of writes. Either all of them become durable or none.
    fn apply(&mut self, ops: Vec<StorageOp>) -> Result<(), StorageError>;
    /// Serialized transactions left behind by a previous run.
    fn load_transactions(&self) -> Result<Vec<PaymentTransaction>, StorageError>;
    fn load_votes(&self, transaction_id: &TransactionId) -> Result<Option<ParticipantsVotesMessage>, StorageError>;
    fn load_trust_lines(&self) -> Result<Vec<TrustLine>, StorageError>;
    /// Payment history, oldest first.
    fn payment_history(&self) -> Result<Vec<PaymentRecord>, StorageError>;
}

/// A batch of writes with commit/rollback semantics. Dropping it without committing discards the writes.
pub struct IOTransaction<'a> {
    storage: &'a mut dyn StorageHandler,
    ops: Vec<StorageOp>,
}

impl<'a> IOTransaction<'a> {
    pub fn begin(storage: &'a mut dyn StorageHandler) -> Self {
        IOTransaction { storage, ops: Vec::new() }
    }

    pub fn save_transaction(&mut self, transaction: &PaymentTransaction) {
        self.ops.push(StorageOp::SaveTransaction(Box::new(transaction.clone())));
    }

    pub fn delete_transaction(&mut self, transaction_id: TransactionId) {
        self.ops.push(StorageOp::DeleteTransaction(transaction_id));
    }

    pub fn save_votes(&mut self, transaction_id: TransactionId, votes: &ParticipantsVotesMessage) {
        self.ops.push(StorageOp::SaveVotes(transaction_id, votes.clone()));
    }

    pub fn save_payment_record(&mut self, record: PaymentRecord) {
        self.ops.push(StorageOp::SavePaymentRecord(record));
    }

    pub fn save_trust_line(&mut self, line: &TrustLine) {
        self.ops.push(StorageOp::SaveTrustLine(line.clone()));
    }

    pub fn commit(self) -> Result<(), StorageError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        trace!("Committing {} storage operations", self.ops.len());
        self.storage.apply(self.ops)
    }

    pub fn rollback(self) {
        debug!("Rolling back {} storage operations", self.ops.len());
    }
}
