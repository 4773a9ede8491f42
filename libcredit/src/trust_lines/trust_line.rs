use crate::amount::{BalanceDelta, TrustLineAmount, TrustLineBalance};
use crate::ids::NodeId;
use crate::trust_lines::TrustLineError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Lifecycle of a trust line. Only `Active` and `Modify` lines carry payments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLineState {
    /// Proposed locally, nothing exchanged yet.
    Init,
    /// Waiting for the contractor's public keys.
    KeysPending,
    /// Keys exchanged, waiting for the first signed audit.
    AuditPending,
    /// Audited and open for payments.
    Active,
    /// Trust amounts changed since the last audit. Still open for payments.
    Modify,
    /// Closed. Kept for history only.
    Archived,
}

impl TrustLineState {
    pub fn is_operational(&self) -> bool {
        matches!(self, TrustLineState::Active | TrustLineState::Modify)
    }

    pub fn can_move_to(&self, next: TrustLineState) -> bool {
        use TrustLineState::*;
        matches!(
            (self, next),
            (Init, KeysPending)
                | (KeysPending, AuditPending)
                | (AuditPending, Active)
                | (Active, Modify)
                | (Modify, Active)
                | (Init, Archived)
                | (KeysPending, Archived)
                | (AuditPending, Archived)
                | (Active, Archived)
        )
    }
}

impl Display for TrustLineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustLineState::Init => write!(f, "Init"),
            TrustLineState::KeysPending => write!(f, "KeysPending"),
            TrustLineState::AuditPending => write!(f, "AuditPending"),
            TrustLineState::Active => write!(f, "Active"),
            TrustLineState::Modify => write!(f, "Modify"),
            TrustLineState::Archived => write!(f, "Archived"),
        }
    }
}

/// The ledger record between this node and one contractor.
///
/// `outgoing_trust_amount` is the most this node may owe the contractor, `incoming_trust_amount` the most the
/// contractor may owe this node. The balance is negative while this node is in debt; an outgoing payment lowers it.
/// Available amounts are never stored: they are derived from the trust amounts, the balance and the currently
/// reserved sum passed in by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustLine {
    contractor: NodeId,
    incoming_trust_amount: TrustLineAmount,
    outgoing_trust_amount: TrustLineAmount,
    balance: TrustLineBalance,
    state: TrustLineState,
    audit_number: u64,
    #[serde(serialize_with = "crate::helpers::to_hex", deserialize_with = "crate::helpers::from_hex")]
    audit_signature: Vec<u8>,
}

impl TrustLine {
    pub fn new(contractor: NodeId, incoming: TrustLineAmount, outgoing: TrustLineAmount) -> Self {
        TrustLine {
            contractor,
            incoming_trust_amount: incoming,
            outgoing_trust_amount: outgoing,
            balance: TrustLineBalance::ZERO,
            state: TrustLineState::Init,
            audit_number: 0,
            audit_signature: Vec::new(),
        }
    }

    /// An already audited line carrying `balance`, as it would be restored from storage.
    pub fn active(
        contractor: NodeId,
        incoming: TrustLineAmount,
        outgoing: TrustLineAmount,
        balance: TrustLineBalance,
    ) -> Self {
        TrustLine { balance, state: TrustLineState::Active, ..TrustLine::new(contractor, incoming, outgoing) }
    }

    pub fn contractor(&self) -> NodeId {
        self.contractor
    }

    pub fn incoming_trust_amount(&self) -> TrustLineAmount {
        self.incoming_trust_amount
    }

    pub fn outgoing_trust_amount(&self) -> TrustLineAmount {
        self.outgoing_trust_amount
    }

    pub fn balance(&self) -> TrustLineBalance {
        self.balance
    }

    pub fn state(&self) -> TrustLineState {
        self.state
    }

    pub fn audit_number(&self) -> u64 {
        self.audit_number
    }

    pub fn audit_signature(&self) -> &[u8] {
        &self.audit_signature
    }

    pub fn is_operational(&self) -> bool {
        self.state.is_operational()
    }

    pub(crate) fn move_to(&mut self, next: TrustLineState) -> Result<(), TrustLineError> {
        if !self.state.can_move_to(next) {
            return Err(TrustLineError::InvalidState { contractor: self.contractor, state: self.state });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn set_incoming_trust_amount(&mut self, amount: TrustLineAmount) -> Result<(), TrustLineError> {
        self.begin_modification()?;
        self.incoming_trust_amount = amount;
        Ok(())
    }

    pub(crate) fn set_outgoing_trust_amount(&mut self, amount: TrustLineAmount) -> Result<(), TrustLineError> {
        self.begin_modification()?;
        self.outgoing_trust_amount = amount;
        Ok(())
    }

    fn begin_modification(&mut self) -> Result<(), TrustLineError> {
        match self.state {
            TrustLineState::Active => self.move_to(TrustLineState::Modify),
            TrustLineState::Modify | TrustLineState::Init => Ok(()),
            state => Err(TrustLineError::InvalidState { contractor: self.contractor, state }),
        }
    }

    /// Bytes the next audit signature has to cover.
    pub fn audit_payload(&self) -> Vec<u8> {
        self.payload(self.audit_number + 1)
    }

    /// Bytes covered by the signature of the last recorded audit.
    pub fn audited_payload(&self) -> Vec<u8> {
        self.payload(self.audit_number)
    }

    fn payload(&self, audit_number: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(40);
        payload.extend_from_slice(self.contractor.as_bytes());
        payload.extend_from_slice(&audit_number.to_le_bytes());
        payload.extend_from_slice(&self.incoming_trust_amount.value().to_le_bytes());
        payload.extend_from_slice(&self.outgoing_trust_amount.value().to_le_bytes());
        payload
    }

    pub(crate) fn record_audit(&mut self, signature: Vec<u8>) -> Result<(), TrustLineError> {
        match self.state {
            TrustLineState::AuditPending | TrustLineState::Modify => self.move_to(TrustLineState::Active)?,
            TrustLineState::Active => {}
            state => return Err(TrustLineError::InvalidState { contractor: self.contractor, state }),
        }
        self.audit_number += 1;
        self.audit_signature = signature;
        Ok(())
    }

    pub(crate) fn apply(&mut self, delta: BalanceDelta) -> Result<(), TrustLineError> {
        self.balance = self.balance.checked_apply(delta).ok_or(TrustLineError::Overflow(self.contractor))?;
        Ok(())
    }

    /// Capacity for outgoing payments before reservations are taken into account.
    fn outgoing_base(&self) -> u64 {
        let base = i128::from(self.outgoing_trust_amount.value()) + i128::from(self.balance.value());
        clamp_to_amount(base)
    }

    fn incoming_base(&self) -> u64 {
        let base = i128::from(self.incoming_trust_amount.value()) - i128::from(self.balance.value());
        clamp_to_amount(base)
    }

    pub fn available_outgoing_amount(&self, reserved: TrustLineAmount) -> TrustLineAmount {
        TrustLineAmount::new(self.outgoing_base()).saturating_sub(reserved)
    }

    pub fn available_incoming_amount(&self, reserved: TrustLineAmount) -> TrustLineAmount {
        TrustLineAmount::new(self.incoming_base()).saturating_sub(reserved)
    }

    /// Outgoing capacity usable to net out debt: only exists while the contractor owes this node.
    pub fn available_outgoing_cycle_amount(&self, reserved: TrustLineAmount) -> TrustLineAmount {
        if !self.balance.is_positive() {
            return TrustLineAmount::ZERO;
        }
        let base = self.balance.abs_amount().value().min(self.outgoing_base());
        TrustLineAmount::new(base).saturating_sub(reserved)
    }

    /// Incoming capacity usable to net out debt: only exists while this node owes the contractor.
    pub fn available_incoming_cycle_amount(&self, reserved: TrustLineAmount) -> TrustLineAmount {
        if !self.balance.is_negative() {
            return TrustLineAmount::ZERO;
        }
        let base = self.balance.abs_amount().value().min(self.incoming_base());
        TrustLineAmount::new(base).saturating_sub(reserved)
    }
}

fn clamp_to_amount(value: i128) -> u64 {
    if value <= 0 {
        0
    } else {
        u64::try_from(value).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn line(incoming: u64, outgoing: u64, balance: i64) -> TrustLine {
        TrustLine::active(
            NodeId::from_name("bob"),
            TrustLineAmount::new(incoming),
            TrustLineAmount::new(outgoing),
            TrustLineBalance::new(balance),
        )
    }

    #[test]
    fn available_amounts_follow_the_balance() {
        let tl = line(100, 200, 0);
        assert_eq!(tl.available_outgoing_amount(TrustLineAmount::ZERO).value(), 200);
        assert_eq!(tl.available_incoming_amount(TrustLineAmount::ZERO).value(), 100);
        // This node already owes 150
        let tl = line(100, 200, -150);
        assert_eq!(tl.available_outgoing_amount(TrustLineAmount::ZERO).value(), 50);
        assert_eq!(tl.available_incoming_amount(TrustLineAmount::ZERO).value(), 250);
        assert_eq!(tl.available_outgoing_amount(TrustLineAmount::new(80)).value(), 0);
    }

    #[test]
    fn over_limit_balance_gives_zero() {
        let tl = line(10, 10, -50);
        assert_eq!(tl.available_outgoing_amount(TrustLineAmount::ZERO), TrustLineAmount::ZERO);
    }

    #[test]
    fn cycle_amounts_need_debt() {
        let tl = line(100, 100, 40);
        assert_eq!(tl.available_outgoing_cycle_amount(TrustLineAmount::ZERO).value(), 40);
        assert_eq!(tl.available_incoming_cycle_amount(TrustLineAmount::ZERO).value(), 0);
        assert_eq!(tl.available_outgoing_cycle_amount(TrustLineAmount::new(15)).value(), 25);
        let tl = line(100, 100, -30);
        assert_eq!(tl.available_outgoing_cycle_amount(TrustLineAmount::ZERO).value(), 0);
        assert_eq!(tl.available_incoming_cycle_amount(TrustLineAmount::ZERO).value(), 30);
        let tl = line(100, 100, 0);
        assert!(tl.available_outgoing_cycle_amount(TrustLineAmount::ZERO).is_zero());
        assert!(tl.available_incoming_cycle_amount(TrustLineAmount::ZERO).is_zero());
    }

    #[test]
    fn lifecycle_transitions() {
        let mut tl = TrustLine::new(NodeId::from_name("carol"), TrustLineAmount::new(5), TrustLineAmount::ZERO);
        assert!(!tl.is_operational());
        assert!(tl.move_to(TrustLineState::Active).is_err());
        tl.move_to(TrustLineState::KeysPending).unwrap();
        tl.move_to(TrustLineState::AuditPending).unwrap();
        tl.record_audit(vec![1, 2, 3]).unwrap();
        assert_eq!(tl.state(), TrustLineState::Active);
        assert_eq!(tl.audit_number(), 1);
        tl.set_outgoing_trust_amount(TrustLineAmount::new(9)).unwrap();
        assert_eq!(tl.state(), TrustLineState::Modify);
        assert!(tl.is_operational());
        tl.record_audit(vec![4]).unwrap();
        assert_eq!(tl.state(), TrustLineState::Active);
        tl.move_to(TrustLineState::Archived).unwrap();
        assert!(tl.set_incoming_trust_amount(TrustLineAmount::ZERO).is_err());
    }
}
