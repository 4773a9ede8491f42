//! Signing of trust-line audits.
//!
//! Audits are the only place the payment engine needs signatures. Key management itself lives outside the crate;
//! the node only sees this interface.

#[cfg(feature = "dummy_keystore")]
mod dummy_impl;

#[cfg(feature = "dummy_keystore")]
pub use dummy_impl::DummyKeystore;

use crate::ids::NodeId;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum KeystoreError {
    #[error("No signing key available for {0}")]
    MissingKey(NodeId),
    #[error("Signature by {0} does not verify")]
    InvalidSignature(NodeId),
}

pub trait Keystore: Send {
    /// The node the keystore signs for.
    fn node_id(&self) -> NodeId;
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, KeystoreError>;
    fn verify(&self, signer: &NodeId, payload: &[u8], signature: &[u8]) -> Result<(), KeystoreError>;
}
