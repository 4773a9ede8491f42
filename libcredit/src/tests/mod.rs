//! Multi-node scenarios run over an in-memory network.
//!
//! These tests cover:
//! - Single and multi-path payments, with shortages along the way
//! - Rejected reservations and falling back to another path
//! - Debt cycle closing, successful and blocked
//! - Capacity conflicts between concurrent payments
//! - Rejected votes, lost messages and crashed or failing nodes

mod conflict_tests;
mod cycle_tests;
mod recovery_tests;
