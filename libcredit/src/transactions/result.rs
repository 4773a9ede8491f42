use crate::amount::TrustLineAmount;
use crate::error::ProtocolError;
use crate::ids::TransactionId;
use crate::messages::{MessageType, PaymentKind};
use crate::transactions::ResourceType;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

/// How and when the scheduler should run a transaction again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WakeupPolicy {
    AsFastAsPossible,
    AfterDelay(Duration),
    /// Run again as soon as one of `types` arrives, or when `timeout` expires with an empty inbox.
    WaitForMessageTypes { types: Vec<MessageType>, timeout: Duration },
    WaitForResources { types: Vec<ResourceType>, timeout: Duration },
    Terminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionState {
    policy: WakeupPolicy,
    persist: bool,
    keep_deadline: bool,
}

impl TransactionState {
    pub fn as_fast_as_possible() -> Self {
        TransactionState { policy: WakeupPolicy::AsFastAsPossible, persist: false, keep_deadline: false }
    }

    pub fn awake_after(delay: Duration) -> Self {
        TransactionState { policy: WakeupPolicy::AfterDelay(delay), persist: false, keep_deadline: false }
    }

    pub fn wait_for_messages(types: &[MessageType], timeout: Duration) -> Self {
        TransactionState {
            policy: WakeupPolicy::WaitForMessageTypes { types: types.to_vec(), timeout },
            persist: false,
            keep_deadline: false,
        }
    }

    pub fn wait_for_resources(types: &[ResourceType], timeout: Duration) -> Self {
        TransactionState {
            policy: WakeupPolicy::WaitForResources { types: types.to_vec(), timeout },
            persist: false,
            keep_deadline: false,
        }
    }

    pub fn exit() -> Self {
        TransactionState { policy: WakeupPolicy::Terminal, persist: false, keep_deadline: false }
    }

    /// The transaction must be written to storage before it runs again.
    pub fn persisted(mut self) -> Self {
        self.persist = true;
        self
    }

    /// Resume the previous wait without pushing its timeout back. Used when a message was not the one awaited.
    pub fn keeping_deadline(mut self) -> Self {
        self.keep_deadline = true;
        self
    }

    pub fn policy(&self) -> &WakeupPolicy {
        &self.policy
    }

    pub fn needs_persist(&self) -> bool {
        self.persist
    }

    pub fn keeps_deadline(&self) -> bool {
        self.keep_deadline
    }

    pub fn must_be_rescheduled(&self) -> bool {
        self.policy != WakeupPolicy::Terminal
    }

    pub fn accepts_message(&self, message_type: MessageType) -> bool {
        match &self.policy {
            WakeupPolicy::WaitForMessageTypes { types, .. } => types.contains(&message_type),
            _ => false,
        }
    }

    pub fn accepts_resource(&self, resource_type: ResourceType) -> bool {
        match &self.policy {
            WakeupPolicy::WaitForResources { types, .. } => types.contains(&resource_type),
            _ => false,
        }
    }

    /// The moment the scheduler runs the transaction if nothing else wakes it first.
    pub fn awakening(&self, now: Instant) -> Option<Instant> {
        match &self.policy {
            WakeupPolicy::AsFastAsPossible => Some(now),
            WakeupPolicy::AfterDelay(delay) => Some(now + *delay),
            WakeupPolicy::WaitForMessageTypes { timeout, .. } => Some(now + *timeout),
            WakeupPolicy::WaitForResources { timeout, .. } => Some(now + *timeout),
            WakeupPolicy::Terminal => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    InvalidCommand,
    NoPaths,
    ReceiverRejected,
    NoResponse,
    InsufficientFunds,
    NoCycleAmount,
    Rejected,
    ProtocolError,
    StorageError,
}

impl ResultCode {
    pub fn from_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Value(_) => ResultCode::InvalidCommand,
            ProtocolError::Conflict(_) => ResultCode::Rejected,
            ProtocolError::NotFound(_) => ResultCode::NoPaths,
            ProtocolError::Io(_) => ResultCode::StorageError,
            ProtocolError::Runtime(_) => ResultCode::ProtocolError,
        }
    }
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultCode::Ok => "OK",
            ResultCode::InvalidCommand => "invalid command",
            ResultCode::NoPaths => "no usable path to the receiver",
            ResultCode::ReceiverRejected => "the receiver rejected the payment",
            ResultCode::NoResponse => "no response",
            ResultCode::InsufficientFunds => "insufficient funds",
            ResultCode::NoCycleAmount => "nothing to close on this cycle",
            ResultCode::Rejected => "rejected by a participant",
            ResultCode::ProtocolError => "protocol error",
            ResultCode::StorageError => "storage error",
        };
        write!(f, "{s}")
    }
}

/// The terminal result of a locally started payment or cycle closing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub transaction_id: TransactionId,
    pub kind: PaymentKind,
    pub code: ResultCode,
    /// Amount moved. Zero unless `code` is `Ok`.
    pub amount: TrustLineAmount,
}

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Coordinator,
    Intermediate,
    Receiver,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// The terminal result of a transaction started by a remote node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResult {
    pub transaction_id: TransactionId,
    pub role: RoleKind,
    pub outcome: Outcome,
    pub amount: TrustLineAmount,
}

/// What a transaction step tells the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionResult {
    Command(CommandResult),
    Message(MessageResult),
    State(TransactionState),
}

impl From<TransactionState> for TransactionResult {
    fn from(state: TransactionState) -> Self {
        TransactionResult::State(state)
    }
}
