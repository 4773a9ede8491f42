//! Logical shape of the payment protocol messages.
//!
//! Every message travels inside an [`Envelope`] carrying the sender and the transaction it belongs to. The bit-level
//! encoding is the transport's business; here the types only need to be serde-friendly.

mod votes;

pub use votes::{ParticipantsVotesMessage, Vote, VotesError};

use crate::amount::TrustLineAmount;
use crate::ids::{NodeId, PathId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    ReceiverInitPaymentRequest,
    ReceiverInitPaymentResponse,
    IntermediateNodeReservationRequest,
    IntermediateNodeReservationResponse,
    CoordinatorReservationRequest,
    CoordinatorReservationResponse,
    FinalPathConfiguration,
    FinalAmountsConfigurationResponse,
    ParticipantsVotes,
    VotesStatusRequest,
    VotesStatusResponse,
    TtlProlongationRequest,
    TtlProlongationResponse,
}

impl MessageType {
    /// Messages only the coordinator of a transaction may send to its participants. Anything else claiming one of
    /// these types is skipped by the scheduler.
    pub fn requires_coordinator_sender(&self) -> bool {
        matches!(
            self,
            MessageType::CoordinatorReservationRequest
                | MessageType::FinalPathConfiguration
                | MessageType::TtlProlongationResponse
                | MessageType::VotesStatusResponse
        )
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Coarse rejection codes. Remote peers never see more than this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientCapacity,
    NoTrustLine,
    ProtocolViolation,
    Overshoot,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseState {
    Accepted,
    Rejected(RejectReason),
}

impl ResponseState {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ResponseState::Accepted)
    }
}

/// Whether a reservation belongs to an ordinary payment or to a cycle closing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    Payment,
    Cycle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub path_id: PathId,
    pub amount: TrustLineAmount,
    pub coordinator: NodeId,
    pub kind: PaymentKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationResponse {
    pub path_id: PathId,
    pub state: ResponseState,
    pub amount: TrustLineAmount,
}

impl ReservationResponse {
    pub fn accepted(path_id: PathId, amount: TrustLineAmount) -> Self {
        ReservationResponse { path_id, state: ResponseState::Accepted, amount }
    }

    pub fn rejected(path_id: PathId, reason: RejectReason) -> Self {
        ReservationResponse { path_id, state: ResponseState::Rejected(reason), amount: TrustLineAmount::ZERO }
    }
}

/// What a coordinator knows about the outcome of one of its transactions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotesStatus {
    /// Still running; ask again later.
    InProgress,
    /// Finished; the final votes message decides.
    Known(ParticipantsVotesMessage),
    /// Never reached the votes stage, or long forgotten. Nobody committed.
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    ReceiverInitPaymentRequest { amount: TrustLineAmount },
    ReceiverInitPaymentResponse { state: ResponseState },
    /// Sent by the previous neighbour on a path.
    IntermediateNodeReservationRequest(ReservationRequest),
    IntermediateNodeReservationResponse(ReservationResponse),
    /// Sent by the coordinator: reserve toward `next_node` on this path.
    CoordinatorReservationRequest { path_id: PathId, amount: TrustLineAmount, next_node: NodeId },
    CoordinatorReservationResponse(ReservationResponse),
    /// The definitive amount of a path. Zero drops the path.
    FinalPathConfiguration { path_id: PathId, amount: TrustLineAmount },
    FinalAmountsConfigurationResponse { path_id: PathId, state: ResponseState },
    ParticipantsVotes(ParticipantsVotesMessage),
    VotesStatusRequest,
    VotesStatusResponse(VotesStatus),
    TtlProlongationRequest,
    TtlProlongationResponse { alive: bool },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ReceiverInitPaymentRequest { .. } => MessageType::ReceiverInitPaymentRequest,
            Message::ReceiverInitPaymentResponse { .. } => MessageType::ReceiverInitPaymentResponse,
            Message::IntermediateNodeReservationRequest(_) => MessageType::IntermediateNodeReservationRequest,
            Message::IntermediateNodeReservationResponse(_) => MessageType::IntermediateNodeReservationResponse,
            Message::CoordinatorReservationRequest { .. } => MessageType::CoordinatorReservationRequest,
            Message::CoordinatorReservationResponse(_) => MessageType::CoordinatorReservationResponse,
            Message::FinalPathConfiguration { .. } => MessageType::FinalPathConfiguration,
            Message::FinalAmountsConfigurationResponse { .. } => MessageType::FinalAmountsConfigurationResponse,
            Message::ParticipantsVotes(_) => MessageType::ParticipantsVotes,
            Message::VotesStatusRequest => MessageType::VotesStatusRequest,
            Message::VotesStatusResponse(_) => MessageType::VotesStatusResponse,
            Message::TtlProlongationRequest => MessageType::TtlProlongationRequest,
            Message::TtlProlongationResponse { .. } => MessageType::TtlProlongationResponse,
        }
    }
}

/// A message plus the routing information every payment protocol message carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: NodeId,
    pub transaction_id: TransactionId,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: NodeId, transaction_id: TransactionId, message: Message) -> Self {
        Envelope { sender, transaction_id, message }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}

impl Display for Envelope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} from {} for {}", self.message_type(), self.sender.short(), self.transaction_id.short())
    }
}

/// An envelope waiting to be handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub recipient: NodeId,
    pub envelope: Envelope,
}
