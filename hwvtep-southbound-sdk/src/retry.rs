use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff used around first-update reconciliation.
///
/// `max_attempts` counts retries after the first attempt; `None` is unlimited.
/// When both `max_attempts` and `max_elapsed_time_ms` are set, whichever is
/// reached first stops retrying. Fields also accept their lowercased names.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(alias = "maxattempts", default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: Option<u32>,

    #[serde(alias = "initialintervalms", default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(alias = "maxintervalms", default = "RetryPolicy::default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Jitter in range [0.0, 1.0]; 0.2 means +/-20%.
    #[serde(alias = "randomizationfactor", default = "RetryPolicy::default_randomization_factor")]
    pub randomization_factor: f64,

    #[serde(default = "RetryPolicy::default_multiplier")]
    pub multiplier: f64,

    #[serde(alias = "maxelapsedtimems", default = "RetryPolicy::default_max_elapsed_time_ms")]
    pub max_elapsed_time_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Self::default_max_interval_ms(),
            randomization_factor: Self::default_randomization_factor(),
            multiplier: Self::default_multiplier(),
            max_elapsed_time_ms: Self::default_max_elapsed_time_ms(),
        }
    }
}

impl RetryPolicy {
    fn default_max_attempts() -> Option<u32> {
        Some(3)
    }

    fn default_initial_interval_ms() -> u64 {
        500
    }

    fn default_max_interval_ms() -> u64 {
        10_000
    }

    fn default_randomization_factor() -> f64 {
        0.2
    }

    fn default_multiplier() -> f64 {
        2.0
    }

    fn default_max_elapsed_time_ms() -> Option<u64> {
        None
    }

    /// Fail on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    /// Fixed short delays, for tests and tight loops.
    pub fn fixed(max_attempts: u32, interval_ms: u64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_interval_ms: interval_ms,
            max_interval_ms: interval_ms,
            randomization_factor: 0.0,
            multiplier: 1.0,
            max_elapsed_time_ms: None,
        }
    }

    /// Whether another retry is allowed after `retries_done` retries.
    #[inline]
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        self.max_attempts.map_or(true, |max| retries_done < max)
    }
}

/// Build an ExponentialBackoff from RetryPolicy.
///
/// `max_elapsed_time` covers the time limit only; callers check
/// [`RetryPolicy::allows_retry`] for the attempt limit.
pub fn build_exponential_backoff(policy: &RetryPolicy) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(policy.initial_interval_ms.max(1)),
        current_interval: Duration::from_millis(policy.initial_interval_ms.max(1)),
        max_interval: Duration::from_millis(policy.max_interval_ms.max(policy.initial_interval_ms)),
        randomization_factor: policy.randomization_factor.clamp(0.0, 1.0),
        multiplier: policy.multiplier.max(1.0),
        max_elapsed_time: policy.max_elapsed_time_ms.map(Duration::from_millis),
        ..ExponentialBackoff::default()
    };
    backoff.reset();
    backoff
}
