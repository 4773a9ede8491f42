use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg};

/// An unsigned quantity of credit: a trust limit, a reservation or a payment amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrustLineAmount(u64);

impl TrustLineAmount {
    pub const ZERO: TrustLineAmount = TrustLineAmount(0);

    pub fn new(amount: u64) -> Self {
        TrustLineAmount(amount)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, rhs: TrustLineAmount) -> Option<TrustLineAmount> {
        self.0.checked_add(rhs.0).map(TrustLineAmount)
    }

    pub fn checked_sub(&self, rhs: TrustLineAmount) -> Option<TrustLineAmount> {
        self.0.checked_sub(rhs.0).map(TrustLineAmount)
    }

    /// Subtracts `rhs`, flooring the result at zero.
    pub fn saturating_sub(&self, rhs: TrustLineAmount) -> TrustLineAmount {
        TrustLineAmount(self.0.saturating_sub(rhs.0))
    }
}

impl From<u64> for TrustLineAmount {
    fn from(value: u64) -> Self {
        TrustLineAmount(value)
    }
}

impl Add for TrustLineAmount {
    type Output = TrustLineAmount;

    fn add(self, rhs: Self) -> Self::Output {
        TrustLineAmount(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for TrustLineAmount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sum for TrustLineAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(TrustLineAmount::ZERO, |acc, a| acc + a)
    }
}

impl<'a> Sum<&'a TrustLineAmount> for TrustLineAmount {
    fn sum<I: Iterator<Item = &'a TrustLineAmount>>(iter: I) -> Self {
        iter.fold(TrustLineAmount::ZERO, |acc, a| acc + *a)
    }
}

impl Display for TrustLineAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//------------------------------------           Balance          ------------------------------------------------//

/// The signed balance of a trust line, seen from this node. Negative values mean this node owes the contractor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrustLineBalance(i64);

impl TrustLineBalance {
    pub const ZERO: TrustLineBalance = TrustLineBalance(0);

    pub fn new(balance: i64) -> Self {
        TrustLineBalance(balance)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// The magnitude of the balance as an amount.
    pub fn abs_amount(&self) -> TrustLineAmount {
        TrustLineAmount(self.0.unsigned_abs())
    }

    /// Applies a signed delta, returning `None` on overflow.
    pub fn checked_apply(&self, delta: BalanceDelta) -> Option<TrustLineBalance> {
        self.0.checked_add(delta.0).map(TrustLineBalance)
    }
}

impl Display for TrustLineBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A signed change in balance produced when reservations are committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta(i64);

impl BalanceDelta {
    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn incoming(amount: TrustLineAmount) -> Option<Self> {
        i64::try_from(amount.value()).ok().map(BalanceDelta)
    }

    pub fn outgoing(amount: TrustLineAmount) -> Option<Self> {
        i64::try_from(amount.value()).ok().map(|v| BalanceDelta(-v))
    }

    pub fn checked_add(&self, rhs: BalanceDelta) -> Option<BalanceDelta> {
        self.0.checked_add(rhs.0).map(BalanceDelta)
    }
}

impl Neg for BalanceDelta {
    type Output = BalanceDelta;

    fn neg(self) -> Self::Output {
        BalanceDelta(-self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn saturating_arithmetic() {
        let a = TrustLineAmount::new(10);
        assert_eq!(a.saturating_sub(TrustLineAmount::new(25)), TrustLineAmount::ZERO);
        assert_eq!(a.checked_sub(TrustLineAmount::new(25)), None);
        assert_eq!(a + TrustLineAmount::new(u64::MAX), TrustLineAmount::new(u64::MAX));
        let total: TrustLineAmount = [1u64, 2, 3].into_iter().map(TrustLineAmount::new).sum();
        assert_eq!(total.value(), 6);
    }

    #[test]
    fn deltas_move_balances() {
        let b = TrustLineBalance::new(-20);
        let paid = BalanceDelta::outgoing(TrustLineAmount::new(30)).unwrap();
        assert_eq!(b.checked_apply(paid), Some(TrustLineBalance::new(-50)));
        let received = BalanceDelta::incoming(TrustLineAmount::new(70)).unwrap();
        assert_eq!(b.checked_apply(received), Some(TrustLineBalance::new(50)));
        assert_eq!(TrustLineBalance::new(-50).abs_amount(), TrustLineAmount::new(50));
        assert!(BalanceDelta::incoming(TrustLineAmount::new(u64::MAX)).is_none());
        assert!(TrustLineBalance::new(i64::MIN).checked_apply(paid).is_none());
    }
}
