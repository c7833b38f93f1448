use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule between retry attempts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// `min(base_ms * 2^attempt, max_ms)`
    Exponential { base_ms: u64, max_ms: u64 },
    /// `step_ms * (attempt + 1)`
    Linear { step_ms: u64 },
}

/// Attempt count and delay schedule for a retry loop
///
/// Defaults assume a shared folder makes a fresh write visible to peers
/// within a few seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay to wait after the failed attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor).min(max_ms)
            }
            Backoff::Linear { step_ms } => step_ms.saturating_mul(u64::from(attempt) + 1),
        };
        Duration::from_millis(ms)
    }

    /// Policy used while waiting for a peer's write to become visible
    pub fn propagation_default() -> Self {
        Self {
            max_attempts: 9,
            backoff: Backoff::Exponential {
                base_ms: 100,
                max_ms: 3000,
            },
        }
    }

    /// One second per attempt, used for transient file absence
    pub fn linear_seconds(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries + 1,
            backoff: Backoff::Linear { step_ms: 1000 },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::propagation_default()
    }
}

/// Tunables of the sync engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Backoff while an expected write has not propagated yet
    pub read_retry: RetryPolicy,
    /// Allowed clock drift when checking whether an expected write arrived
    pub clock_skew_tolerance_ms: u64,
    /// Entries older than this are moved to monthly archives
    pub archive_days_threshold: u32,
    /// Bootstrap snapshots older than this are refreshed
    pub bootstrap_max_age_hours: u64,
    /// A backup lock older than this is considered abandoned
    pub lock_stale_after_secs: u64,
    /// How long to wait for a held backup lock
    pub lock_timeout_secs: u64,
    pub lock_poll_interval_ms: u64,
    /// Retries for a legacy JSON file that is transiently absent
    pub validation_max_retries: u32,
    /// Larger `shots` arrays are treated as corruption
    pub max_legacy_shots: usize,
    /// Backups up to this age are always kept
    pub keep_all_days: i64,
    /// Backups older than this are deleted
    pub retention_days: i64,
}

pub const CLOCK_SKEW_TOLERANCE_MS: u64 = 10_000;

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_retry: RetryPolicy::default(),
            clock_skew_tolerance_ms: CLOCK_SKEW_TOLERANCE_MS,
            archive_days_threshold: 90,
            bootstrap_max_age_hours: 24,
            lock_stale_after_secs: 300,
            lock_timeout_secs: 10,
            lock_poll_interval_ms: 250,
            validation_max_retries: 3,
            max_legacy_shots: 100_000,
            keep_all_days: 7,
            retention_days: 30,
        }
    }
}
