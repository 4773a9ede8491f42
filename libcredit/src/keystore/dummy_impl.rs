use crate::ids::NodeId;
use crate::keystore::{Keystore, KeystoreError};
use blake2::{Blake2b512, Digest};

/// Hash-based stand-in for a real keystore. Anyone can forge its signatures; it only lets tests and the simulator
/// exercise the audit flow.
#[derive(Clone, Debug)]
pub struct DummyKeystore {
    node_id: NodeId,
}

impl DummyKeystore {
    pub fn new(node_id: NodeId) -> Self {
        DummyKeystore { node_id }
    }

    fn signature_of(signer: &NodeId, payload: &[u8]) -> Vec<u8> {
        Blake2b512::new()
            .chain_update(b"CreditAudit")
            .chain_update(signer.as_bytes())
            .chain_update(payload)
            .finalize()
            .to_vec()
    }
}

impl Keystore for DummyKeystore {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        Ok(Self::signature_of(&self.node_id, payload))
    }

    fn verify(&self, signer: &NodeId, payload: &[u8], signature: &[u8]) -> Result<(), KeystoreError> {
        if Self::signature_of(signer, payload) == signature {
            Ok(())
        } else {
            Err(KeystoreError::InvalidSignature(*signer))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signatures_bind_signer_and_payload() {
        let alice = DummyKeystore::new(NodeId::from_name("alice"));
        let bob = DummyKeystore::new(NodeId::from_name("bob"));
        let sig = alice.sign(b"audit 1").unwrap();
        assert!(bob.verify(&alice.node_id(), b"audit 1", &sig).is_ok());
        assert!(bob.verify(&alice.node_id(), b"audit 2", &sig).is_err());
        assert!(alice.verify(&bob.node_id(), b"audit 1", &sig).is_err());
    }
}
