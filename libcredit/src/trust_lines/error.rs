use crate::ids::NodeId;
use crate::trust_lines::reservations::{ReservationDirection, ReservationId};
use crate::trust_lines::TrustLineState;
use crate::amount::TrustLineAmount;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum TrustLineError {
    #[error("There is no trust line with {0}")]
    NoTrustLine(NodeId),
    #[error("A trust line or reservation already exists: {0}")]
    AlreadyExists(String),
    #[error("The trust line with {contractor} is {state}, which does not allow this operation")]
    InvalidState { contractor: NodeId, state: TrustLineState },
    #[error("Not enough {direction} capacity toward {contractor}: requested {requested}, available {available}")]
    InsufficientCapacity {
        contractor: NodeId,
        direction: ReservationDirection,
        requested: TrustLineAmount,
        available: TrustLineAmount,
    },
    #[error("A reservation can only shrink: {current} -> {requested}")]
    ShortageGrows { current: TrustLineAmount, requested: TrustLineAmount },
    #[error("Reservation {0} does not exist")]
    ReservationNotFound(ReservationId),
    #[error("The trust line with {0} still carries a balance or reservations")]
    NotSettled(NodeId),
    #[error("Balance overflow on the trust line with {0}")]
    Overflow(NodeId),
}
