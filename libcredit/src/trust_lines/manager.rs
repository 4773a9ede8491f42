use crate::amount::{BalanceDelta, TrustLineAmount};
use crate::ids::{NodeId, PathId, TransactionId};
use crate::trust_lines::reservations::{AmountReservation, AmountReservationsHandler, ReservationDirection};
use crate::trust_lines::{TrustLine, TrustLineError, TrustLineState};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which pool of capacity a reservation draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityKind {
    /// Ordinary payments: bounded by trust amounts and balance.
    Regular,
    /// Cycle closing: bounded by existing debt only.
    Cycle,
}

/// Owns every trust line of the node and the reservations held against them.
///
/// This is the only place balances and reservations change. Transactions go through it during their own step, which
/// serializes every mutation of a given trust line.
#[derive(Debug, Default)]
pub struct TrustLinesManager {
    lines: BTreeMap<NodeId, TrustLine>,
    reservations: AmountReservationsHandler,
}

impl TrustLinesManager {
    pub fn new() -> Self {
        TrustLinesManager::default()
    }

    pub fn from_lines(lines: impl IntoIterator<Item = TrustLine>) -> Self {
        let lines = lines.into_iter().map(|tl| (tl.contractor(), tl)).collect();
        TrustLinesManager { lines, reservations: AmountReservationsHandler::default() }
    }

    pub fn trust_line(&self, contractor: &NodeId) -> Result<&TrustLine, TrustLineError> {
        self.lines.get(contractor).ok_or(TrustLineError::NoTrustLine(*contractor))
    }

    fn trust_line_mut(&mut self, contractor: &NodeId) -> Result<&mut TrustLine, TrustLineError> {
        self.lines.get_mut(contractor).ok_or(TrustLineError::NoTrustLine(*contractor))
    }

    pub fn trust_lines(&self) -> impl Iterator<Item = &TrustLine> {
        self.lines.values()
    }

    pub fn is_neighbor(&self, node: &NodeId) -> bool {
        self.lines.get(node).is_some_and(TrustLine::is_operational)
    }

    pub fn reservations(&self) -> &AmountReservationsHandler {
        &self.reservations
    }

    /// Puts back a line exactly as it was. Used to unwind a lifecycle change that could not be persisted.
    pub(crate) fn put_line(&mut self, line: TrustLine) {
        self.lines.insert(line.contractor(), line);
    }

    pub(crate) fn remove_line(&mut self, contractor: &NodeId) -> Option<TrustLine> {
        self.lines.remove(contractor)
    }

    //------------------------------------        Lifecycle         ------------------------------------------------//

    /// Proposes a new trust line. Re-opening an archived line starts it over.
    pub fn open(
        &mut self,
        contractor: NodeId,
        incoming: TrustLineAmount,
        outgoing: TrustLineAmount,
    ) -> Result<&TrustLine, TrustLineError> {
        if let Some(existing) = self.lines.get(&contractor) {
            if existing.state() != TrustLineState::Archived {
                return Err(TrustLineError::AlreadyExists(format!("trust line with {contractor}")));
            }
        }
        debug!("Opening trust line with {} (in: {incoming}, out: {outgoing})", contractor.short());
        self.lines.insert(contractor, TrustLine::new(contractor, incoming, outgoing));
        self.trust_line(&contractor)
    }

    pub fn move_to(&mut self, contractor: &NodeId, state: TrustLineState) -> Result<&TrustLine, TrustLineError> {
        if state == TrustLineState::Archived {
            return self.archive(contractor);
        }
        let line = self.trust_line_mut(contractor)?;
        line.move_to(state)?;
        Ok(line)
    }

    pub fn record_audit(&mut self, contractor: &NodeId, signature: Vec<u8>) -> Result<&TrustLine, TrustLineError> {
        let line = self.trust_line_mut(contractor)?;
        line.record_audit(signature)?;
        Ok(line)
    }

    pub fn set_incoming_trust(
        &mut self,
        contractor: &NodeId,
        amount: TrustLineAmount,
    ) -> Result<&TrustLine, TrustLineError> {
        let line = self.trust_line_mut(contractor)?;
        line.set_incoming_trust_amount(amount)?;
        Ok(line)
    }

    pub fn set_outgoing_trust(
        &mut self,
        contractor: &NodeId,
        amount: TrustLineAmount,
    ) -> Result<&TrustLine, TrustLineError> {
        let line = self.trust_line_mut(contractor)?;
        line.set_outgoing_trust_amount(amount)?;
        Ok(line)
    }

    /// Archives a settled trust line. Fails while a balance or a reservation is outstanding.
    pub fn archive(&mut self, contractor: &NodeId) -> Result<&TrustLine, TrustLineError> {
        if self.reservations.has_reservations(contractor) {
            return Err(TrustLineError::NotSettled(*contractor));
        }
        let line = self.trust_line_mut(contractor)?;
        if line.balance().value() != 0 {
            return Err(TrustLineError::NotSettled(*contractor));
        }
        line.move_to(TrustLineState::Archived)?;
        Ok(line)
    }

    //------------------------------------     Available amounts    ------------------------------------------------//

    pub fn available(
        &self,
        contractor: &NodeId,
        direction: ReservationDirection,
        kind: CapacityKind,
    ) -> Result<TrustLineAmount, TrustLineError> {
        let line = self.trust_line(contractor)?;
        if !line.is_operational() {
            return Ok(TrustLineAmount::ZERO);
        }
        let reserved = self.reservations.total_reserved(contractor, direction);
        let available = match (direction, kind) {
            (ReservationDirection::Outgoing, CapacityKind::Regular) => line.available_outgoing_amount(reserved),
            (ReservationDirection::Incoming, CapacityKind::Regular) => line.available_incoming_amount(reserved),
            (ReservationDirection::Outgoing, CapacityKind::Cycle) => line.available_outgoing_cycle_amount(reserved),
            (ReservationDirection::Incoming, CapacityKind::Cycle) => line.available_incoming_cycle_amount(reserved),
        };
        Ok(available)
    }

    pub fn available_outgoing(&self, contractor: &NodeId) -> Result<TrustLineAmount, TrustLineError> {
        self.available(contractor, ReservationDirection::Outgoing, CapacityKind::Regular)
    }

    pub fn available_incoming(&self, contractor: &NodeId) -> Result<TrustLineAmount, TrustLineError> {
        self.available(contractor, ReservationDirection::Incoming, CapacityKind::Regular)
    }

    pub fn available_outgoing_cycle(&self, contractor: &NodeId) -> Result<TrustLineAmount, TrustLineError> {
        self.available(contractor, ReservationDirection::Outgoing, CapacityKind::Cycle)
    }

    pub fn available_incoming_cycle(&self, contractor: &NodeId) -> Result<TrustLineAmount, TrustLineError> {
        self.available(contractor, ReservationDirection::Incoming, CapacityKind::Cycle)
    }

    /// Sum of free incoming capacity over every operational trust line.
    pub fn total_incoming_available(&self) -> TrustLineAmount {
        self.lines.keys().filter_map(|c| self.available_incoming(c).ok()).sum()
    }

    pub fn reserved(&self, contractor: &NodeId, direction: ReservationDirection) -> TrustLineAmount {
        self.reservations.total_reserved(contractor, direction)
    }

    /// Transactions other than `except` that hold capacity toward `contractor`.
    pub fn blocking_transactions(
        &self,
        contractor: &NodeId,
        direction: ReservationDirection,
        except: &TransactionId,
    ) -> BTreeSet<TransactionId> {
        self.reservations.other_transactions(contractor, direction, except)
    }

    //------------------------------------       Reservations       ------------------------------------------------//

    pub fn reserve(
        &mut self,
        contractor: NodeId,
        transaction_id: TransactionId,
        path_id: PathId,
        amount: TrustLineAmount,
        direction: ReservationDirection,
        kind: CapacityKind,
    ) -> Result<AmountReservation, TrustLineError> {
        let line = self.trust_line(&contractor)?;
        if !line.is_operational() {
            return Err(TrustLineError::InvalidState { contractor, state: line.state() });
        }
        let available = self.available(&contractor, direction, kind)?;
        if amount.is_zero() || amount > available {
            return Err(TrustLineError::InsufficientCapacity { contractor, direction, requested: amount, available });
        }
        Ok(self.reservations.reserve(contractor, transaction_id, path_id, amount, direction))
    }

    pub fn reserve_outgoing(
        &mut self,
        contractor: NodeId,
        transaction_id: TransactionId,
        path_id: PathId,
        amount: TrustLineAmount,
    ) -> Result<AmountReservation, TrustLineError> {
        self.reserve(contractor, transaction_id, path_id, amount, ReservationDirection::Outgoing, CapacityKind::Regular)
    }

    pub fn reserve_incoming(
        &mut self,
        contractor: NodeId,
        transaction_id: TransactionId,
        path_id: PathId,
        amount: TrustLineAmount,
    ) -> Result<AmountReservation, TrustLineError> {
        self.reserve(contractor, transaction_id, path_id, amount, ReservationDirection::Incoming, CapacityKind::Regular)
    }

    /// Shrinks a reservation to `amount`. A reservation never grows.
    pub fn shortage(
        &mut self,
        contractor: &NodeId,
        reservation: &AmountReservation,
        amount: TrustLineAmount,
    ) -> Result<AmountReservation, TrustLineError> {
        if amount > reservation.amount() {
            return Err(TrustLineError::ShortageGrows { current: reservation.amount(), requested: amount });
        }
        self.reservations.update(contractor, reservation.id(), amount)
    }

    /// Returns the reserved capacity. Releasing an already released reservation is an error and changes nothing.
    pub fn release(&mut self, contractor: &NodeId, reservation: &AmountReservation) -> Result<(), TrustLineError> {
        let freed = self.reservations.free(contractor, reservation.id())?;
        trace!("Released {} {} toward {}", freed.amount(), freed.direction(), contractor.short());
        Ok(())
    }

    pub fn restore_reservation(
        &mut self,
        contractor: NodeId,
        reservation: AmountReservation,
    ) -> Result<(), TrustLineError> {
        self.trust_line(&contractor)?;
        self.reservations.restore(contractor, reservation)
    }

    /// Releases whatever `transaction_id` still holds. Returns the number of reservations dropped.
    pub fn release_transaction(&mut self, transaction_id: &TransactionId) -> usize {
        let dropped = self.reservations.take_transaction(transaction_id);
        if !dropped.is_empty() {
            debug!("Dropped {} dangling reservations of {}", dropped.len(), transaction_id.short());
        }
        dropped.len()
    }

    pub fn transaction_reservations(&self, transaction_id: &TransactionId) -> Vec<(NodeId, AmountReservation)> {
        self.reservations.transaction_reservations(transaction_id)
    }

    //------------------------------------          Commit          ------------------------------------------------//

    fn net_deltas(&self, transaction_id: &TransactionId) -> Result<BTreeMap<NodeId, BalanceDelta>, TrustLineError> {
        let mut deltas: BTreeMap<NodeId, BalanceDelta> = BTreeMap::new();
        for (contractor, reservation) in self.reservations.transaction_reservations(transaction_id) {
            let delta = match reservation.direction() {
                ReservationDirection::Incoming => BalanceDelta::incoming(reservation.amount()),
                ReservationDirection::Outgoing => BalanceDelta::outgoing(reservation.amount()),
            }
            .ok_or(TrustLineError::Overflow(contractor))?;
            let entry = deltas.entry(contractor).or_default();
            *entry = entry.checked_add(delta).ok_or(TrustLineError::Overflow(contractor))?;
        }
        Ok(deltas)
    }

    /// The trust lines as they will look after [`commit`](Self::commit), without touching any state.
    pub fn preview_commit(&self, transaction_id: &TransactionId) -> Result<Vec<TrustLine>, TrustLineError> {
        let deltas = self.net_deltas(transaction_id)?;
        deltas
            .into_iter()
            .map(|(contractor, delta)| {
                let mut line = self.trust_line(&contractor)?.clone();
                line.apply(delta)?;
                Ok(line)
            })
            .collect()
    }

    /// Folds every reservation of `transaction_id` into the balances and drops them.
    pub fn commit(&mut self, transaction_id: &TransactionId) -> Result<Vec<(NodeId, BalanceDelta)>, TrustLineError> {
        let updated = self.preview_commit(transaction_id)?;
        let deltas = self.net_deltas(transaction_id)?;
        for line in updated {
            self.lines.insert(line.contractor(), line);
        }
        self.reservations.take_transaction(transaction_id);
        info!("Committed {} on {} trust lines", transaction_id.short(), deltas.len());
        Ok(deltas.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::amount::TrustLineBalance;

    fn bob() -> NodeId {
        NodeId::from_name("bob")
    }

    fn manager(incoming: u64, outgoing: u64, balance: i64) -> TrustLinesManager {
        TrustLinesManager::from_lines([TrustLine::active(
            bob(),
            TrustLineAmount::new(incoming),
            TrustLineAmount::new(outgoing),
            TrustLineBalance::new(balance),
        )])
    }

    #[test]
    fn reservations_never_exceed_capacity() {
        let mut tl = manager(100, 100, 0);
        let t1 = TransactionId::from_counter(1);
        let t2 = TransactionId::from_counter(2);
        tl.reserve_outgoing(bob(), t1, 0, TrustLineAmount::new(70)).unwrap();
        assert_eq!(tl.available_outgoing(&bob()).unwrap().value(), 30);
        let err = tl.reserve_outgoing(bob(), t2, 0, TrustLineAmount::new(31)).unwrap_err();
        assert!(matches!(err, TrustLineError::InsufficientCapacity { .. }));
        tl.reserve_outgoing(bob(), t2, 0, TrustLineAmount::new(30)).unwrap();
        assert!(tl.available_outgoing(&bob()).unwrap().is_zero());
        // Incoming capacity is independent
        assert_eq!(tl.available_incoming(&bob()).unwrap().value(), 100);
    }

    #[test]
    fn sums_stay_within_available_under_churn() {
        let mut tl = manager(50, 80, -20);
        let limit = tl.trust_line(&bob()).unwrap().available_outgoing_amount(TrustLineAmount::ZERO);
        let mut held = Vec::new();
        for i in 0..40u64 {
            let tx = TransactionId::from_counter(i);
            if let Ok(r) = tl.reserve_outgoing(bob(), tx, 0, TrustLineAmount::new(i % 7 + 1)) {
                held.push(r);
            }
            if i % 3 == 0 {
                if let Some(r) = held.pop() {
                    tl.release(&bob(), &r).unwrap();
                }
            }
            assert!(tl.reserved(&bob(), ReservationDirection::Outgoing) <= limit);
        }
    }

    #[test]
    fn shortage_only_shrinks() {
        let mut tl = manager(100, 100, 0);
        let t1 = TransactionId::from_counter(1);
        let r = tl.reserve_outgoing(bob(), t1, 0, TrustLineAmount::new(60)).unwrap();
        let r = tl.shortage(&bob(), &r, TrustLineAmount::new(40)).unwrap();
        assert_eq!(r.amount().value(), 40);
        assert!(tl.shortage(&bob(), &r, TrustLineAmount::new(41)).is_err());
        assert_eq!(tl.available_outgoing(&bob()).unwrap().value(), 60);
    }

    #[test]
    fn double_release_does_not_double_credit() {
        let mut tl = manager(100, 100, 0);
        let t1 = TransactionId::from_counter(1);
        let r = tl.reserve_outgoing(bob(), t1, 0, TrustLineAmount::new(60)).unwrap();
        tl.release(&bob(), &r).unwrap();
        assert!(tl.release(&bob(), &r).is_err());
        assert_eq!(tl.available_outgoing(&bob()).unwrap().value(), 100);
    }

    #[test]
    fn commit_folds_reservations_into_balance() {
        let mut tl = manager(100, 100, 0);
        let t1 = TransactionId::from_counter(1);
        tl.reserve_outgoing(bob(), t1, 0, TrustLineAmount::new(60)).unwrap();
        tl.reserve_outgoing(bob(), t1, 1, TrustLineAmount::new(15)).unwrap();
        let preview = tl.preview_commit(&t1).unwrap();
        assert_eq!(preview[0].balance().value(), -75);
        // Preview leaves the state alone
        assert_eq!(tl.trust_line(&bob()).unwrap().balance().value(), 0);
        let deltas = tl.commit(&t1).unwrap();
        assert_eq!(deltas, vec![(bob(), BalanceDelta::outgoing(TrustLineAmount::new(75)).unwrap())]);
        assert_eq!(tl.trust_line(&bob()).unwrap().balance().value(), -75);
        assert!(tl.reserved(&bob(), ReservationDirection::Outgoing).is_zero());
        assert_eq!(tl.available_outgoing(&bob()).unwrap().value(), 25);
        assert_eq!(tl.available_incoming(&bob()).unwrap().value(), 175);
    }

    #[test]
    fn archive_requires_settled_line() {
        let mut tl = manager(100, 100, -5);
        assert!(matches!(tl.archive(&bob()), Err(TrustLineError::NotSettled(_))));
        let mut tl = manager(100, 100, 0);
        let r = tl.reserve_incoming(bob(), TransactionId::from_counter(1), 0, TrustLineAmount::new(1)).unwrap();
        assert!(tl.archive(&bob()).is_err());
        tl.release(&bob(), &r).unwrap();
        assert_eq!(tl.archive(&bob()).unwrap().state(), TrustLineState::Archived);
        assert!(tl.reserve_incoming(bob(), TransactionId::from_counter(2), 0, TrustLineAmount::new(1)).is_err());
    }

    #[test]
    fn unknown_contractor() {
        let tl = TrustLinesManager::new();
        assert!(matches!(tl.available_outgoing(&bob()), Err(TrustLineError::NoTrustLine(_))));
    }
}
