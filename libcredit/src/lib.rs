pub mod amount;
pub mod config;
pub mod conflict;
pub mod cycles;
pub mod error;
pub mod helpers;
pub mod ids;
pub mod keystore;
pub mod messages;
pub mod node;
pub mod paths;
pub mod scheduler;
pub mod storage;
pub mod transactions;
pub mod trust_lines;

pub use amount::{TrustLineAmount, TrustLineBalance};
pub use config::ProtocolConfig;
pub use error::ProtocolError;
pub use ids::{NodeId, PathId, TransactionId};
pub use node::Node;

#[cfg(test)]
mod tests;
