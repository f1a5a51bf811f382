//! Node configuration and operational tuning.

use std::time::Duration;

use serde::Deserialize;

/// Per-node configuration.
///
/// The `*_timeout` values guard against slow or failed peers; the progress
/// knobs bound how long a transaction may sit below Committed before the
/// progress log escalates it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound for point-to-point RPC waits used by protocol steps.
    pub rpc_timeout: Duration,
    /// End-to-end deadline for one coordination attempt.
    pub propose_timeout: Duration,
    /// Lower bound before a stalled transaction becomes eligible for
    /// recovery, and the floor between repeated attempts on one TxnId.
    pub recovery_min_delay: Duration,
    /// Cadence of the per-store progress monitor.
    pub progress_interval: Duration,
    /// How long a transaction may sit below Committed before the progress
    /// log escalates it.
    pub progress_stall: Duration,
    /// Consecutive Accept rejections tolerated before handing the
    /// transaction to recovery.
    pub accept_reject_limit: u32,
    /// Number of command stores the node partitions its key-slice into.
    pub command_stores: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(500),
            propose_timeout: Duration::from_secs(5),
            recovery_min_delay: Duration::from_millis(200),
            progress_interval: Duration::from_millis(50),
            progress_stall: Duration::from_millis(400),
            accept_reject_limit: 3,
            command_stores: 4,
        }
    }
}

impl Config {
    pub fn apply(mut self, overrides: ConfigOverrides) -> Config {
        if let Some(ms) = overrides.rpc_timeout_ms {
            self.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.propose_timeout_ms {
            self.propose_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.recovery_min_delay_ms {
            self.recovery_min_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.progress_interval_ms {
            self.progress_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.progress_stall_ms {
            self.progress_stall = Duration::from_millis(ms);
        }
        if let Some(n) = overrides.accept_reject_limit {
            self.accept_reject_limit = n;
        }
        if let Some(n) = overrides.command_stores {
            self.command_stores = n.max(1);
        }
        self
    }
}

/// Operator-supplied overrides, all optional. Millisecond fields keep the
/// wire format embedder-friendly.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub rpc_timeout_ms: Option<u64>,
    #[serde(default)]
    pub propose_timeout_ms: Option<u64>,
    #[serde(default)]
    pub recovery_min_delay_ms: Option<u64>,
    #[serde(default)]
    pub progress_interval_ms: Option<u64>,
    #[serde(default)]
    pub progress_stall_ms: Option<u64>,
    #[serde(default)]
    pub accept_reject_limit: Option<u32>,
    #[serde(default)]
    pub command_stores: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fold_into_defaults() {
        let overrides: ConfigOverrides =
            serde_json::from_str(r#"{"rpc_timeout_ms": 50, "command_stores": 0}"#).unwrap();
        let config = Config::default().apply(overrides);
        assert_eq!(config.rpc_timeout, Duration::from_millis(50));
        assert_eq!(config.command_stores, 1);
        assert_eq!(config.accept_reject_limit, 3);
    }
}
