//! Closing debt cycles.

use super::network::{NetworkBuilder, TestNetwork};
use crate::amount::TrustLineAmount;
use crate::messages::{MessageType, PaymentKind};
use crate::storage::PaymentDirection;
use crate::transactions::{Outcome, ResultCode};

/// b owes a, c owes b and a owes c.
fn triangle(b_owes_a: i64, c_owes_b: i64, a_owes_c: i64) -> TestNetwork {
    NetworkBuilder::new(&["a", "b", "c", "d"])
        .link_with_debt("b", "a", 100, 100, b_owes_a)
        .link_with_debt("c", "b", 100, 100, c_owes_b)
        .link_with_debt("a", "c", 100, 100, a_owes_c)
        .link("a", "d", 100, 100)
        .link("d", "b", 100, 100)
        .build()
}

#[test]
fn cycle_nets_out_the_smallest_debt() {
    let mut net = triangle(50, 20, 30);
    let result = net.close_cycle("a", &["a", "b", "c", "a"]).unwrap();

    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(result.kind, PaymentKind::Cycle);
    assert_eq!(result.amount, TrustLineAmount::new(20));
    assert_eq!(net.balance("a", "b"), 30);
    assert_eq!(net.balance("b", "c"), 0);
    assert_eq!(net.balance("c", "a"), 10);
    assert_eq!(net.outcome("b", &result.transaction_id), Some(Outcome::Committed));
    assert_eq!(net.outcome("c", &result.transaction_id), Some(Outcome::Committed));
    net.assert_settled();
    net.assert_balances_mirror();

    let history = net.history("a");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].direction, PaymentDirection::CycleClosing);
    assert_eq!(history[0].amount, TrustLineAmount::new(20));
}

#[test]
fn missing_debt_in_the_middle_blocks_the_cycle() {
    let mut net = triangle(50, 0, 30);
    let result = net.close_cycle("a", &["a", "b", "c", "a"]).unwrap();

    assert_eq!(result.code, ResultCode::Rejected);
    assert!(result.amount.is_zero());
    assert_eq!(net.balance("a", "b"), 50);
    assert_eq!(net.balance("b", "c"), 0);
    assert_eq!(net.balance("c", "a"), 30);
    assert_eq!(net.outcome("b", &result.transaction_id), Some(Outcome::RolledBack));
    assert!(net.history("a").is_empty());
    net.assert_settled();
}

#[test]
fn nothing_owed_to_the_coordinator_ends_before_any_message() {
    let mut net = triangle(50, 20, 0);
    let result = net.close_cycle("a", &["a", "b", "c", "a"]).unwrap();

    assert_eq!(result.code, ResultCode::NoCycleAmount);
    assert_eq!(net.delivered(MessageType::IntermediateNodeReservationRequest), 0);
    assert_eq!(net.balance("a", "b"), 50);
    net.assert_settled();
}

#[test]
fn queued_cycles_run_one_after_another() {
    let mut net = triangle(20, 20, 20);
    let cycles: &[&[&str]] = &[&["a", "b", "c", "a"], &["a", "b", "c", "a"], &["a", "b"], &["a", "d", "b", "c", "a"]];
    assert_eq!(net.queue_cycles("a", cycles), 2);

    // The second closing only starts once the first has netted out every debt it could have used.
    let results = net.command_results("a");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].code, ResultCode::Ok);
    assert_eq!(results[1].code, ResultCode::NoCycleAmount);
    assert_eq!(net.balance("a", "b"), 0);
    assert_eq!(net.balance("b", "c"), 0);
    assert_eq!(net.balance("c", "a"), 0);
    assert!(net.node("a").cycles().running().is_none());
    assert_eq!(net.node("a").cycles().queued(), 0);
    net.assert_settled();
}

#[test]
fn cycles_crossing_a_failed_edge_are_skipped() {
    let mut net = triangle(50, 0, 30);
    net.queue_cycles("a", &[&["a", "b", "c", "a"], &["a", "d", "b", "c", "a"]]);

    let results = net.command_results("a");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, ResultCode::Rejected);
    assert_eq!(net.node("a").cycles().queued(), 0);
    assert!(net.node("a").cycles().running().is_none());
    net.assert_settled();
}
