use blake2::{Blake2b512, Digest};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Identifies one path of a (possibly multi-path) payment. Unique only within its transaction.
pub type PathId = u16;

#[derive(Debug, Clone, Error)]
#[error("Invalid identifier: {0}")]
pub struct InvalidIdentifier(String);

macro_rules! hex_identifier {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(
            #[serde(
                serialize_with = "crate::helpers::array_to_hex",
                deserialize_with = "crate::helpers::array_from_hex"
            )]
            [u8; 16],
        );

        impl $name {
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                $name(bytes)
            }

            pub fn random() -> Self {
                $name(rand::rng().random())
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            /// The first four bytes as hex, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = InvalidIdentifier;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 16];
                hex::decode_to_slice(s, &mut bytes).map_err(|e| InvalidIdentifier(format!("{s}: {e}")))?;
                Ok($name(bytes))
            }
        }
    };
}

hex_identifier!(NodeId);
hex_identifier!(TransactionId);

impl NodeId {
    /// Derives a stable node id from a human-readable name. Used by the simulator and tests.
    pub fn from_name(name: &str) -> Self {
        let digest = Blake2b512::digest(name.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        NodeId(bytes)
    }
}

impl TransactionId {
    /// Builds an id whose lexicographic order follows `n`. Handy when a test needs a known conflict winner.
    pub fn from_counter(n: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        TransactionId(bytes)
    }
}
