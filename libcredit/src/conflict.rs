//! Capacity conflicts between transactions.
//!
//! Two transactions conflict when one of them finds no free capacity on a trust line because the other holds
//! reservations there. Exactly one of them is allowed to wait for the other: the one whose identifier is larger. The
//! smaller identifier always wins, so two transactions blocking each other can never both wait.

use crate::ids::TransactionId;
use crate::transactions::LiveTransactions;
use log::*;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Poll again later. The given transaction holds the capacity and wins the tie-break.
    WaitFor(TransactionId),
    /// Nobody worth waiting for. Give up on the contested capacity.
    GiveUp,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// The transaction that keeps the contested capacity.
    pub fn winner(a: &TransactionId, b: &TransactionId) -> TransactionId {
        if a <= b {
            *a
        } else {
            *b
        }
    }

    pub fn resolve(
        me: &TransactionId,
        blockers: &BTreeSet<TransactionId>,
        live: &dyn LiveTransactions,
    ) -> ConflictDecision {
        let winner = blockers.iter().filter(|b| *b != me && Self::winner(me, b) == **b).find(|b| live.is_alive(b));
        match winner {
            Some(winner) => ConflictDecision::WaitFor(*winner),
            None => {
                if !blockers.is_empty() {
                    trace!("{}: blocked only by {} losing transactions", me.short(), blockers.len());
                }
                ConflictDecision::GiveUp
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transactions::NoLiveTransactions;

    struct Alive(BTreeSet<TransactionId>);

    impl LiveTransactions for Alive {
        fn is_alive(&self, transaction_id: &TransactionId) -> bool {
            self.0.contains(transaction_id)
        }
    }

    fn ids() -> (TransactionId, TransactionId) {
        let a = TransactionId::from_counter(1);
        let b = TransactionId::from_counter(2);
        assert!(a < b);
        (a, b)
    }

    #[test]
    fn smaller_identifier_wins() {
        let (a, b) = ids();
        assert_eq!(ConflictResolver::winner(&a, &b), a);
        assert_eq!(ConflictResolver::winner(&b, &a), a);
    }

    #[test]
    fn loser_waits_for_a_live_winner() {
        let (a, b) = ids();
        let live = Alive([a, b].into_iter().collect());
        let blockers = [a].into_iter().collect();
        assert_eq!(ConflictResolver::resolve(&b, &blockers, &live), ConflictDecision::WaitFor(a));
    }

    #[test]
    fn winner_never_waits() {
        let (a, b) = ids();
        let live = Alive([a, b].into_iter().collect());
        let blockers = [b].into_iter().collect();
        assert_eq!(ConflictResolver::resolve(&a, &blockers, &live), ConflictDecision::GiveUp);
    }

    #[test]
    fn finished_winner_is_not_waited_for() {
        let (a, b) = ids();
        let blockers = [a].into_iter().collect();
        assert_eq!(ConflictResolver::resolve(&b, &blockers, &NoLiveTransactions), ConflictDecision::GiveUp);
    }
}
