//! An in-process network of credit nodes on top of tokio.
//!
//! Every [`Node`](libcredit::Node) runs inside its own actor task. Actors route protocol envelopes to each other
//! over channels, answer path requests from a live snapshot of everybody's trust lines and wake their node with a
//! single timer set to its next awakening.

mod actor;
pub mod error;
mod handle;
mod local_network;
pub mod topology;

pub use error::NetworkError;
pub use handle::NodeHandle;
pub use local_network::{LocalNetwork, LocalNetworkBuilder, NetworkEvent, DEFAULT_MAX_PATHS};
pub use topology::Topology;
