//! Concurrent payments competing for the same trust line.

use super::network::{id, NetworkBuilder, TestNetwork};
use crate::amount::TrustLineAmount;
use crate::ids::TransactionId;
use crate::messages::{Message, MessageType};
use crate::transactions::{Outcome, ResultCode, Role, WakeupPolicy};

fn contested_network() -> TestNetwork {
    let mut net = NetworkBuilder::new(&["a", "b", "c"]).link("a", "b", 100, 0).link("b", "c", 150, 0).build();
    net.routes("a", &[&["a", "b", "c"]]);
    net
}

fn waiting_for(net: &TestNetwork, transaction_id: &TransactionId) -> Option<TransactionId> {
    match net.node("a").scheduler().transaction(transaction_id)?.role() {
        Role::Coordinator(role) => role.waiting_for(),
        _ => None,
    }
}

#[test]
fn later_payment_waits_for_the_earlier_one() {
    let mut net = contested_network();
    let first = net.start_payment("a", "c", 100);
    let second = net.start_payment("a", "c", 60);
    assert!(first < second);
    net.run();

    // The first payment went through while the second was polling for capacity.
    assert_eq!(net.command_result("a", &first).map(|r| r.code), Some(ResultCode::Ok));
    assert_eq!(waiting_for(&net, &second), Some(first));
    let state = net.node("a").scheduler().transaction_state(&second).unwrap();
    assert!(matches!(state.policy(), WakeupPolicy::AfterDelay(_)));

    // Once the winner is gone the capacity it used is gone too, so the second payment gives up.
    net.run_until_idle();
    let result = net.command_result("a", &second).unwrap();
    assert_eq!(result.code, ResultCode::InsufficientFunds);
    assert_eq!(net.balance("a", "b"), -100);
    assert_eq!(net.balance("c", "b"), 100);
    assert_eq!(net.outcome("c", &second), Some(Outcome::RolledBack));
    net.assert_settled();
    net.assert_balances_mirror();
}

#[test]
fn later_payment_takes_over_when_the_earlier_one_fails() {
    let mut net = contested_network();
    let first = net.start_payment("a", "c", 100);
    // The ballot of the first payment never makes it back from its participants.
    net.drop_messages(move |m| {
        m.envelope.transaction_id == first
            && m.envelope.sender != id("a")
            && matches!(m.envelope.message, Message::ParticipantsVotes(_))
    });
    let second = net.start_payment("a", "c", 60);
    net.run();
    assert!(net.is_running("a", &first));
    assert_eq!(waiting_for(&net, &second), Some(first));

    net.run_until_idle();
    assert_eq!(net.command_result("a", &first).map(|r| r.code), Some(ResultCode::Rejected));
    let result = net.command_result("a", &second).unwrap();
    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(result.amount, TrustLineAmount::new(60));
    assert!(net.elapsed() >= net.node("a").config().votes_timeout(0));
    assert_eq!(net.balance("a", "b"), -60);
    assert_eq!(net.balance("b", "c"), -60);
    assert_eq!(net.outcome("b", &first), Some(Outcome::RolledBack));
    assert_eq!(net.outcome("b", &second), Some(Outcome::Committed));
    net.assert_settled();
    net.assert_balances_mirror();
}

#[test]
fn partial_capacity_is_taken_without_waiting() {
    let mut net = contested_network();
    // Both payments fit on their own, but not together.
    let first = net.start_payment("a", "c", 70);
    let second = net.start_payment("a", "c", 70);
    net.run_until_idle();

    assert_eq!(net.command_result("a", &first).map(|r| r.code), Some(ResultCode::Ok));
    // The second one still got the 30 left over on the first hop, then ran out of paths.
    assert_eq!(net.command_result("a", &second).map(|r| r.code), Some(ResultCode::InsufficientFunds));
    assert_eq!(net.balance("a", "b"), -70);
    assert!(net.delivered(MessageType::ParticipantsVotes) > 0);
    net.assert_settled();
}
