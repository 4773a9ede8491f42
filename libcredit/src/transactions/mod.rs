//! Payment transactions.
//!
//! A payment is a set of cooperating transactions sharing one [`TransactionId`], one per involved node. The node that
//! starts it runs the coordinator role; every node on a path runs an intermediate role and the payee runs the
//! receiver role. A transaction is a resumable state machine: the scheduler calls [`PaymentTransaction::run`] and the
//! returned [`TransactionResult`] says when to call it again.

mod context;
mod coordinator;
mod intermediate;
mod payment;
mod receiver;
mod result;
mod votes;

pub use context::{LiveTransactions, NoLiveTransactions, NodeContext, Outbox, PathsRequest};
pub use coordinator::{CoordinatorRole, CoordinatorStage};
pub use intermediate::{IntermediateRole, IntermediateStage};
pub use payment::{PaymentTransaction, Role};
pub use receiver::{ReceiverRole, ReceiverStage};
pub use result::{
    CommandResult, MessageResult, Outcome, ResultCode, RoleKind, TransactionResult, TransactionState, WakeupPolicy,
};

use crate::ids::TransactionId;
use crate::paths::Path;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Paths,
}

/// Data produced outside the protocol that a transaction waits for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resource {
    Paths { transaction_id: TransactionId, paths: Vec<Path> },
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Paths { .. } => ResourceType::Paths,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Resource::Paths { transaction_id, .. } => *transaction_id,
        }
    }
}
