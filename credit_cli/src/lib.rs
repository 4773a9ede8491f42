//! Command-line front end of the credit network: local simulations of payment scenarios and management of the
//! settings file they run with.

pub mod config;
pub mod error;
pub mod report;
pub mod scenario;
pub mod settings;
pub mod simulation;
