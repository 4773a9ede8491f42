use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every protocol timeout and limit in one place.
///
/// The defaults match the values the deployed network uses; changing them on one node only is safe as long as
/// timeouts stay larger than the real round-trip time between neighbours.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Upper bound on the one-way latency of a single protocol message, in milliseconds.
    pub message_transfer_lag_ms: u64,
    /// Upper bound on the time the path discovery collaborator needs to deliver candidate paths, in milliseconds.
    pub resource_transfer_lag_ms: u64,
    /// Maximum number of nodes in a payment path, coordinator and receiver included.
    pub max_path_length: usize,
    /// Delay between polls while waiting for a conflicting transaction to release capacity, in milliseconds.
    pub conflict_poll_delay_ms: u64,
    /// Delay between votes status probes during recovery, in milliseconds.
    pub recovery_retry_delay_ms: u64,
    /// Number of votes status probes before a participant gives up and rolls back.
    pub max_recovery_attempts: u8,
    /// Number of times an intermediate node extends its wait for the final path configuration.
    pub max_ttl_prolongations: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            message_transfer_lag_ms: 1500,
            resource_transfer_lag_ms: 2000,
            max_path_length: 7,
            conflict_poll_delay_ms: 1000,
            recovery_retry_delay_ms: 30_000,
            max_recovery_attempts: 3,
            max_ttl_prolongations: 3,
        }
    }
}

impl ProtocolConfig {
    /// Round trips across `hops` hops.
    pub fn max_network_delay(&self, hops: u64) -> Duration {
        Duration::from_millis(self.message_transfer_lag_ms.saturating_mul(hops.max(1)))
    }

    /// Time allowed for the path discovery collaborator to answer.
    pub fn resource_timeout(&self) -> Duration {
        Duration::from_millis(self.resource_transfer_lag_ms)
    }

    /// How long a receiver keeps collecting reservations before giving up.
    pub fn receiver_reservations_timeout(&self) -> Duration {
        self.max_network_delay(self.max_path_length as u64 * 3)
    }

    /// How long a node waits for the circulating votes message.
    ///
    /// The ballot visits each of the `participants` once and then returns to the coordinator. Nodes that have not
    /// seen the ballot yet pass zero and get the bound of a single path travelled both ways.
    pub fn votes_timeout(&self, participants: usize) -> Duration {
        let circulation = participants as u64 + 1;
        self.max_network_delay(circulation.max(self.max_path_length as u64 * 2))
    }

    pub fn conflict_poll_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_poll_delay_ms)
    }

    pub fn recovery_retry_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_retry_delay_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn network_delays_scale_with_hops() {
        let config = ProtocolConfig::default();
        assert_eq!(config.max_network_delay(0), Duration::from_millis(1500));
        assert_eq!(config.max_network_delay(3), Duration::from_millis(4500));
        assert_eq!(config.receiver_reservations_timeout(), Duration::from_millis(31_500));
    }

    #[test]
    fn votes_timeout_grows_with_the_ballot() {
        let config = ProtocolConfig::default();
        assert_eq!(config.votes_timeout(0), Duration::from_millis(21_000));
        assert_eq!(config.votes_timeout(6), config.votes_timeout(0));
        // Three paths of six participants each.
        assert_eq!(config.votes_timeout(18), Duration::from_millis(28_500));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: ProtocolConfig = ron::de::from_str("(max_path_length: 5)").unwrap();
        assert_eq!(config.max_path_length, 5);
        assert_eq!(config.message_transfer_lag_ms, 1500);
    }
}
