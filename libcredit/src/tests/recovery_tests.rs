//! Lost messages, crashed nodes and failing storage.

use super::network::{final_votes_to, message_is, NetworkBuilder, TestNetwork};
use crate::amount::TrustLineAmount;
use crate::messages::MessageType;
use crate::transactions::{Outcome, ResultCode};

fn paying_network() -> TestNetwork {
    let mut net = NetworkBuilder::new(&["a", "b", "c"]).link("a", "b", 200, 0).link("b", "c", 150, 0).build();
    net.routes("a", &[&["a", "b", "c"]]);
    net
}

fn assert_paid(net: &TestNetwork, value: i64) {
    assert_eq!(net.balance("a", "b"), -value);
    assert_eq!(net.balance("b", "c"), -value);
    net.assert_balances_mirror();
}

#[test]
fn participant_missing_the_final_votes_asks_the_coordinator() {
    let mut net = paying_network();
    let payment = net.start_payment("a", "c", 100);
    net.drop_messages(final_votes_to(payment, "b"));
    net.run();
    assert_eq!(net.command_result("a", &payment).map(|r| r.code), Some(ResultCode::Ok));
    assert!(net.is_running("b", &payment));

    net.run_until_idle();
    assert_eq!(net.delivered(MessageType::VotesStatusRequest), 1);
    assert_eq!(net.outcome("b", &payment), Some(Outcome::Committed));
    assert_paid(&net, 100);
    net.assert_settled();
}

#[test]
fn restarted_participant_commits_what_the_coordinator_decided() {
    let mut net = paying_network();
    let payment = net.start_payment("a", "c", 100);
    net.hold_messages(final_votes_to(payment, "b"));
    net.run();
    assert_eq!(net.outcome("c", &payment), Some(Outcome::Committed));

    net.crash("b");
    net.discard_held();
    net.clear_hooks();
    assert_eq!(net.restart("b"), 1);
    net.run_until_idle();

    assert_eq!(net.outcome("b", &payment), Some(Outcome::Committed));
    assert_paid(&net, 100);
    net.assert_settled();
}

#[test]
fn coordinator_restarted_during_votes_rejects() {
    let mut net = paying_network();
    let payment = net.start_payment("a", "c", 100);
    net.hold_messages(message_is(MessageType::ParticipantsVotes, Some("c"), Some("a")));
    net.run();
    assert!(net.is_running("b", &payment));
    assert!(net.is_running("c", &payment));

    net.crash("a");
    net.discard_held();
    net.clear_hooks();
    assert_eq!(net.restart("a"), 1);
    net.run_until_idle();

    assert_eq!(net.command_result("a", &payment).map(|r| r.code), Some(ResultCode::Rejected));
    assert_eq!(net.outcome("b", &payment), Some(Outcome::RolledBack));
    assert_eq!(net.outcome("c", &payment), Some(Outcome::RolledBack));
    assert!(net.history("a").is_empty());
    assert_paid(&net, 0);
    net.assert_settled();
}

#[test]
fn failed_commit_is_retried_once_storage_is_back() {
    let mut net = paying_network();
    let payment = net.start_payment("a", "c", 100);
    net.hold_messages(final_votes_to(payment, "c"));
    net.run();
    assert_eq!(net.outcome("b", &payment), Some(Outcome::Committed));

    net.set_storage_available("c", false);
    net.release_held();
    net.run();
    assert!(net.is_running("c", &payment));
    assert_eq!(net.balance("c", "b"), 0);

    net.set_storage_available("c", true);
    net.run_until_idle();
    assert_eq!(net.outcome("c", &payment), Some(Outcome::Committed));
    assert_eq!(net.history("c").len(), 1);
    assert_paid(&net, 100);
    net.assert_settled();
}

#[test]
fn coordinator_that_cannot_persist_its_ballot_aborts() {
    let mut net = paying_network();
    let payment = net.start_payment("a", "c", 100);
    net.hold_messages(message_is(MessageType::FinalAmountsConfigurationResponse, None, Some("a")));
    net.run();

    net.set_storage_available("a", false);
    net.release_held();
    net.run_until_idle();
    net.set_storage_available("a", true);

    let result = net.command_result("a", &payment).unwrap();
    assert_eq!(result.code, ResultCode::StorageError);
    assert_eq!(result.amount, TrustLineAmount::ZERO);
    assert_eq!(net.outcome("b", &payment), Some(Outcome::RolledBack));
    assert_eq!(net.outcome("c", &payment), Some(Outcome::RolledBack));
    assert_paid(&net, 0);
    net.assert_settled();
}

#[test]
fn intermediate_left_without_a_final_configuration_rolls_back() {
    let mut net = paying_network();
    net.drop_messages(message_is(MessageType::FinalPathConfiguration, None, Some("b")));
    let result = net.pay("a", "c", 100);

    assert_eq!(result.code, ResultCode::InsufficientFunds);
    assert!(net.delivered(MessageType::TtlProlongationRequest) >= 1);
    assert_eq!(net.outcome("b", &result.transaction_id), Some(Outcome::RolledBack));
    assert_eq!(net.outcome("c", &result.transaction_id), Some(Outcome::RolledBack));
    assert_paid(&net, 0);
    net.assert_settled();
}
