use crate::amount::TrustLineAmount;
use crate::ids::{NodeId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentDirection {
    Incoming,
    Outgoing,
    CycleClosing,
}

impl Display for PaymentDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentDirection::Incoming => write!(f, "incoming"),
            PaymentDirection::Outgoing => write!(f, "outgoing"),
            PaymentDirection::CycleClosing => write!(f, "cycle closing"),
        }
    }
}

/// A committed payment, as kept in the node's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub transaction_id: TransactionId,
    pub direction: PaymentDirection,
    /// The receiver of an outgoing payment or the coordinator of an incoming one. The coordinator itself for cycles.
    pub counterparty: NodeId,
    pub amount: TrustLineAmount,
    pub timestamp: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn new(
        transaction_id: TransactionId,
        direction: PaymentDirection,
        counterparty: NodeId,
        amount: TrustLineAmount,
    ) -> Self {
        PaymentRecord { transaction_id, direction, counterparty, amount, timestamp: Utc::now() }
    }
}
