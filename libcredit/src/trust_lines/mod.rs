//! Trust lines and the amount-reservation ledger.
//!
//! Every capacity check in this module re-derives the free amount from the trust amounts, the balance and the
//! sum of outstanding reservations at call time. Balances only move in [`TrustLinesManager::commit`].

mod error;
mod manager;
mod reservations;
mod trust_line;

pub use error::TrustLineError;
pub use manager::{CapacityKind, TrustLinesManager};
pub use reservations::{AmountReservation, AmountReservationsHandler, ReservationDirection, ReservationId};
pub use trust_line::{TrustLine, TrustLineState};
