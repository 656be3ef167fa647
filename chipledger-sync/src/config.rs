//! Sync timing configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connectivity as last reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    #[default]
    Good,
    /// Connected but slow or lossy; timers stretch.
    Poor,
    Offline,
}

impl NetworkQuality {
    #[must_use]
    pub const fn is_online(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

/// Configuration for the sync coordinator and orchestrator.
///
/// All durations are in milliseconds so the struct reads naturally from a
/// JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum gap after a sync attempt before an automatic one may start.
    pub cooldown_ms: u64,
    /// First retry delay after a failure; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay.
    pub backoff_max_ms: u64,
    /// Consecutive failures before automatic retries stop.
    pub max_attempts: u32,
    /// Quiet period after the network comes back before syncing.
    pub online_debounce_ms: u64,
    /// Periodic sync interval on a good connection.
    pub periodic_interval_ms: u64,
    /// Periodic sync interval on a poor connection.
    pub periodic_interval_poor_ms: u64,
    /// Bound on one remote exchange on a good connection.
    pub timeout_ms: u64,
    /// Bound on one remote exchange on a poor connection.
    pub timeout_poor_ms: u64,
    /// Quiet period after the last local change before auto-saving.
    pub autosave_debounce_ms: u64,
    /// Longest a pending change may wait for an auto-save.
    pub autosave_interval_ms: u64,
    /// Accepted settlement residual, in minor units.
    pub balance_tolerance: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 30_000,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            max_attempts: 3,
            online_debounce_ms: 2_000,
            periodic_interval_ms: 30_000,
            periodic_interval_poor_ms: 60_000,
            timeout_ms: 15_000,
            timeout_poor_ms: 30_000,
            autosave_debounce_ms: 2_000,
            autosave_interval_ms: 30_000,
            balance_tolerance: 0,
        }
    }
}

impl SyncConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn online_debounce(&self) -> Duration {
        Duration::from_millis(self.online_debounce_ms)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    /// Retry delay after the `attempts`-th consecutive failure.
    ///
    /// `base * 2^(attempts - 1)`, capped at `backoff_max_ms`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn periodic_interval(&self, network: NetworkQuality) -> Duration {
        match network {
            NetworkQuality::Poor => Duration::from_millis(self.periodic_interval_poor_ms),
            _ => Duration::from_millis(self.periodic_interval_ms),
        }
    }

    pub fn timeout(&self, network: NetworkQuality) -> Duration {
        match network {
            NetworkQuality::Poor => Duration::from_millis(self.timeout_poor_ms),
            _ => Duration::from_millis(self.timeout_ms),
        }
    }
}
