use crate::amount::TrustLineAmount;
use crate::ids::{NodeId, PathId, TransactionId};
use crate::trust_lines::TrustLineError;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

pub type ReservationId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationDirection {
    /// Capacity held for a payment arriving from the contractor.
    Incoming,
    /// Capacity held for a payment this node sends to the contractor.
    Outgoing,
}

impl ReservationDirection {
    pub fn opposite(&self) -> ReservationDirection {
        match self {
            ReservationDirection::Incoming => ReservationDirection::Outgoing,
            ReservationDirection::Outgoing => ReservationDirection::Incoming,
        }
    }
}

impl Display for ReservationDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationDirection::Incoming => write!(f, "incoming"),
            ReservationDirection::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// A tentative hold on trust-line capacity, scoped to one transaction and one path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountReservation {
    id: ReservationId,
    transaction_id: TransactionId,
    path_id: PathId,
    amount: TrustLineAmount,
    direction: ReservationDirection,
}

impl AmountReservation {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn path_id(&self) -> PathId {
        self.path_id
    }

    pub fn amount(&self) -> TrustLineAmount {
        self.amount
    }

    pub fn direction(&self) -> ReservationDirection {
        self.direction
    }
}

/// Per-contractor bookkeeping of outstanding reservations.
///
/// The handler does not know about trust amounts; capacity checks live in
/// [`TrustLinesManager`](crate::trust_lines::TrustLinesManager), which always re-derives the free amount from the
/// sums kept here.
#[derive(Debug, Default)]
pub struct AmountReservationsHandler {
    reservations: BTreeMap<NodeId, Vec<AmountReservation>>,
    next_id: ReservationId,
}

impl AmountReservationsHandler {
    pub fn reserve(
        &mut self,
        contractor: NodeId,
        transaction_id: TransactionId,
        path_id: PathId,
        amount: TrustLineAmount,
        direction: ReservationDirection,
    ) -> AmountReservation {
        self.next_id += 1;
        let reservation = AmountReservation { id: self.next_id, transaction_id, path_id, amount, direction };
        trace!(
            "Reserved {amount} {direction} toward {} for {} (path {path_id})",
            contractor.short(),
            transaction_id.short()
        );
        self.reservations.entry(contractor).or_default().push(reservation.clone());
        reservation
    }

    /// Puts back a reservation loaded from a transaction snapshot. Keeps its id.
    pub fn restore(&mut self, contractor: NodeId, reservation: AmountReservation) -> Result<(), TrustLineError> {
        let existing = self.reservations.entry(contractor).or_default();
        if existing.iter().any(|r| r.id == reservation.id) {
            return Err(TrustLineError::AlreadyExists(format!("reservation {}", reservation.id)));
        }
        self.next_id = self.next_id.max(reservation.id);
        existing.push(reservation);
        Ok(())
    }

    pub fn update(
        &mut self,
        contractor: &NodeId,
        id: ReservationId,
        amount: TrustLineAmount,
    ) -> Result<AmountReservation, TrustLineError> {
        let reservation = self
            .reservations
            .get_mut(contractor)
            .and_then(|list| list.iter_mut().find(|r| r.id == id))
            .ok_or(TrustLineError::ReservationNotFound(id))?;
        reservation.amount = amount;
        Ok(reservation.clone())
    }

    /// Removes a reservation. Freeing the same reservation twice fails with `ReservationNotFound`.
    pub fn free(&mut self, contractor: &NodeId, id: ReservationId) -> Result<AmountReservation, TrustLineError> {
        let list = self.reservations.get_mut(contractor).ok_or(TrustLineError::ReservationNotFound(id))?;
        let pos = list.iter().position(|r| r.id == id).ok_or(TrustLineError::ReservationNotFound(id))?;
        let removed = list.remove(pos);
        if list.is_empty() {
            self.reservations.remove(contractor);
        }
        Ok(removed)
    }

    pub fn total_reserved(&self, contractor: &NodeId, direction: ReservationDirection) -> TrustLineAmount {
        self.reservations
            .get(contractor)
            .map(|list| list.iter().filter(|r| r.direction == direction).map(|r| r.amount).sum())
            .unwrap_or_default()
    }

    pub fn reservations(&self, contractor: &NodeId) -> &[AmountReservation] {
        self.reservations.get(contractor).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_reservations(&self, contractor: &NodeId) -> bool {
        self.reservations.get(contractor).is_some_and(|list| !list.is_empty())
    }

    /// Every other transaction holding capacity toward `contractor` in `direction`.
    pub fn other_transactions(
        &self,
        contractor: &NodeId,
        direction: ReservationDirection,
        except: &TransactionId,
    ) -> BTreeSet<TransactionId> {
        self.reservations(contractor)
            .iter()
            .filter(|r| r.direction == direction && r.transaction_id != *except)
            .map(|r| r.transaction_id)
            .collect()
    }

    pub fn transaction_reservations(&self, transaction_id: &TransactionId) -> Vec<(NodeId, AmountReservation)> {
        self.reservations
            .iter()
            .flat_map(|(contractor, list)| {
                list.iter().filter(|r| r.transaction_id == *transaction_id).map(|r| (*contractor, r.clone()))
            })
            .collect()
    }

    /// Removes and returns every reservation held by `transaction_id`.
    pub fn take_transaction(&mut self, transaction_id: &TransactionId) -> Vec<(NodeId, AmountReservation)> {
        let mut taken = Vec::new();
        for (contractor, list) in self.reservations.iter_mut() {
            let (theirs, rest): (Vec<_>, Vec<_>) = list.drain(..).partition(|r| r.transaction_id == *transaction_id);
            *list = rest;
            taken.extend(theirs.into_iter().map(|r| (*contractor, r)));
        }
        self.reservations.retain(|_, list| !list.is_empty());
        taken
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ids() -> (NodeId, TransactionId, TransactionId) {
        (NodeId::from_name("bob"), TransactionId::from_counter(1), TransactionId::from_counter(2))
    }

    #[test]
    fn totals_per_direction() {
        let (bob, t1, t2) = ids();
        let mut handler = AmountReservationsHandler::default();
        handler.reserve(bob, t1, 0, TrustLineAmount::new(10), ReservationDirection::Outgoing);
        handler.reserve(bob, t2, 0, TrustLineAmount::new(5), ReservationDirection::Outgoing);
        handler.reserve(bob, t2, 1, TrustLineAmount::new(7), ReservationDirection::Incoming);
        assert_eq!(handler.total_reserved(&bob, ReservationDirection::Outgoing).value(), 15);
        assert_eq!(handler.total_reserved(&bob, ReservationDirection::Incoming).value(), 7);
        let others = handler.other_transactions(&bob, ReservationDirection::Outgoing, &t1);
        assert_eq!(others.into_iter().collect::<Vec<_>>(), vec![t2]);
    }

    #[test]
    fn free_twice_is_rejected() {
        let (bob, t1, _) = ids();
        let mut handler = AmountReservationsHandler::default();
        let r = handler.reserve(bob, t1, 0, TrustLineAmount::new(10), ReservationDirection::Outgoing);
        assert!(handler.free(&bob, r.id()).is_ok());
        assert!(matches!(handler.free(&bob, r.id()), Err(TrustLineError::ReservationNotFound(_))));
        assert!(handler.total_reserved(&bob, ReservationDirection::Outgoing).is_zero());
        assert!(!handler.has_reservations(&bob));
    }

    #[test]
    fn take_transaction_leaves_others() {
        let (bob, t1, t2) = ids();
        let carol = NodeId::from_name("carol");
        let mut handler = AmountReservationsHandler::default();
        handler.reserve(bob, t1, 0, TrustLineAmount::new(1), ReservationDirection::Outgoing);
        handler.reserve(carol, t1, 0, TrustLineAmount::new(1), ReservationDirection::Incoming);
        handler.reserve(carol, t2, 0, TrustLineAmount::new(3), ReservationDirection::Incoming);
        let taken = handler.take_transaction(&t1);
        assert_eq!(taken.len(), 2);
        assert!(!handler.has_reservations(&bob));
        assert_eq!(handler.total_reserved(&carol, ReservationDirection::Incoming).value(), 3);
    }

    #[test]
    fn restored_ids_are_not_reused() {
        let (bob, t1, t2) = ids();
        let mut source = AmountReservationsHandler::default();
        let r = source.reserve(bob, t1, 0, TrustLineAmount::new(4), ReservationDirection::Incoming);
        let mut handler = AmountReservationsHandler::default();
        handler.restore(bob, r.clone()).unwrap();
        assert!(handler.restore(bob, r.clone()).is_err());
        let fresh = handler.reserve(bob, t2, 0, TrustLineAmount::new(1), ReservationDirection::Incoming);
        assert!(fresh.id() > r.id());
    }
}
