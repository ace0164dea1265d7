use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime options of the southbound core.
///
/// Keys are camelCase. `config` lowercases the keys it reads from files and
/// the environment, so every field also answers to its lowercased name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SouthboundOptions {
    /// Records kept per transaction history.
    #[serde(alias = "historycapacity", default = "SouthboundOptions::default_history_capacity")]
    pub history_capacity: usize,
    /// Evictions between two history warnings.
    #[serde(
        alias = "historylogthreshold",
        default = "SouthboundOptions::default_history_log_threshold"
    )]
    pub history_log_threshold: usize,
    /// Bound on schema fetch and one reconciliation attempt.
    #[serde(
        alias = "reconciletimeout",
        default = "SouthboundOptions::default_reconcile_timeout_ms"
    )]
    pub reconcile_timeout: u64,
    /// Bound on one device transaction round trip.
    #[serde(alias = "transacttimeout", default = "SouthboundOptions::default_transact_timeout_ms")]
    pub transact_timeout: u64,
    #[serde(
        alias = "ownershiptimeout",
        default = "SouthboundOptions::default_ownership_timeout_ms"
    )]
    pub ownership_timeout: u64,
    #[serde(alias = "reconcileretry", default)]
    pub reconcile_retry: RetryPolicy,
}

impl SouthboundOptions {
    fn default_history_capacity() -> usize {
        10_000
    }

    fn default_history_log_threshold() -> usize {
        7_500
    }

    fn default_reconcile_timeout_ms() -> u64 {
        30_000
    }

    fn default_transact_timeout_ms() -> u64 {
        10_000
    }

    fn default_ownership_timeout_ms() -> u64 {
        5_000
    }

    #[inline]
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout)
    }

    #[inline]
    pub fn transact_timeout(&self) -> Duration {
        Duration::from_millis(self.transact_timeout)
    }

    #[inline]
    pub fn ownership_timeout(&self) -> Duration {
        Duration::from_millis(self.ownership_timeout)
    }
}

impl Default for SouthboundOptions {
    fn default() -> Self {
        Self {
            history_capacity: Self::default_history_capacity(),
            history_log_threshold: Self::default_history_log_threshold(),
            reconcile_timeout: Self::default_reconcile_timeout_ms(),
            transact_timeout: Self::default_transact_timeout_ms(),
            ownership_timeout: Self::default_ownership_timeout_ms(),
            reconcile_retry: RetryPolicy::default(),
        }
    }
}
