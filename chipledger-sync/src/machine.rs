//! Sync state machine.
//!
//! [`SyncMachine`] is an immutable record. Every transition takes the
//! current time explicitly and returns a new record, so the whole retry and
//! cooldown policy can be tested without a runtime or a clock.

use crate::config::SyncConfig;
use chipledger_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Coarse sync state, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    /// Idle, but inside the window after an attempt where automatic syncs are skipped.
    Cooldown,
    Error,
}

/// What asked for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The session list was opened.
    Mount,
    /// Explicit user retry. Bypasses cooldown, backoff, stall and re-auth gating.
    ForceRefresh,
    /// Connectivity came back (after debounce).
    NetworkOnline,
    Periodic,
    /// The app returned to the foreground.
    VisibilityRegained,
    /// Local edits are waiting to be pushed.
    LocalChange,
    /// Scheduled retry after a failure. Gated by backoff rather than cooldown
    /// while that retry is pending.
    Retry,
}

impl SyncTrigger {
    #[must_use]
    pub const fn is_forced(&self) -> bool {
        matches!(self, Self::ForceRefresh)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mount => "mount",
            Self::ForceRefresh => "force_refresh",
            Self::NetworkOnline => "network_online",
            Self::Periodic => "periodic",
            Self::VisibilityRegained => "visibility_regained",
            Self::LocalChange => "local_change",
            Self::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// Why a sync request was a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoUser,
    InFlight,
    CoolingDown { remaining: Duration },
    BackingOff { remaining: Duration },
    /// Automatic retries exhausted; only [`SyncTrigger::ForceRefresh`] proceeds.
    Stalled,
    NeedsReauth,
    Offline,
    /// Nothing changed since the remote last saw the data.
    Unchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUser => f.write_str("no signed-in user"),
            Self::InFlight => f.write_str("sync already in flight"),
            Self::CoolingDown { remaining } => write!(f, "cooling down for {remaining:?}"),
            Self::BackingOff { remaining } => write!(f, "backing off for {remaining:?}"),
            Self::Stalled => f.write_str("stalled after repeated failures"),
            Self::NeedsReauth => f.write_str("sign-in required"),
            Self::Offline => f.write_str("offline"),
            Self::Unchanged => f.write_str("nothing to push"),
        }
    }
}

/// Retry, cooldown and in-flight bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncMachine {
    phase: SyncPhase,
    in_flight: bool,
    last_attempt: Option<Timestamp>,
    last_success: Option<Timestamp>,
    attempts: u32,
    next_retry_at: Option<Timestamp>,
    stalled: bool,
    needs_reauth: bool,
}

impl SyncMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to start a sync.
    ///
    /// Guards are checked in order: user, in-flight, then (for anything but
    /// a forced refresh) re-auth, stall, backoff and cooldown. The cooldown
    /// runs from the last attempt, successful or not; a [`SyncTrigger::Retry`]
    /// with a retry pending answers to the backoff alone.
    pub fn begin(
        &self,
        now: Timestamp,
        trigger: SyncTrigger,
        user_present: bool,
        config: &SyncConfig,
    ) -> Result<Self, SkipReason> {
        if !user_present {
            return Err(SkipReason::NoUser);
        }
        if self.in_flight {
            return Err(SkipReason::InFlight);
        }

        let mut next = *self;
        if trigger.is_forced() {
            next.stalled = false;
            next.needs_reauth = false;
            next.attempts = 0;
            next.next_retry_at = None;
        } else {
            if self.needs_reauth {
                return Err(SkipReason::NeedsReauth);
            }
            if self.stalled {
                return Err(SkipReason::Stalled);
            }
            if let Some(remaining) = self.backoff_remaining(now) {
                return Err(SkipReason::BackingOff { remaining });
            }
            let scheduled_retry = trigger == SyncTrigger::Retry && self.next_retry_at.is_some();
            if !scheduled_retry {
                if let Some(remaining) = self.cooldown_remaining(now, config) {
                    return Err(SkipReason::CoolingDown { remaining });
                }
            }
        }

        next.phase = SyncPhase::Syncing;
        next.in_flight = true;
        next.last_attempt = Some(now);
        Ok(next)
    }

    /// The in-flight sync finished.
    #[must_use]
    pub fn succeed(&self, now: Timestamp) -> Self {
        Self {
            phase: SyncPhase::Idle,
            in_flight: false,
            last_attempt: self.last_attempt,
            last_success: Some(now),
            attempts: 0,
            next_retry_at: None,
            stalled: false,
            needs_reauth: false,
        }
    }

    /// The in-flight sync failed with a retryable error.
    ///
    /// Schedules a retry after the backoff delay, or stalls once
    /// `max_attempts` consecutive failures are reached.
    #[must_use]
    pub fn fail_transient(&self, now: Timestamp, config: &SyncConfig) -> Self {
        let attempts = self.attempts.saturating_add(1);
        let stalled = attempts >= config.max_attempts;
        Self {
            phase: SyncPhase::Error,
            in_flight: false,
            attempts,
            next_retry_at: (!stalled).then(|| now.saturating_add(config.backoff(attempts))),
            stalled,
            ..*self
        }
    }

    /// The in-flight sync was rejected for credentials. No retry is scheduled.
    #[must_use]
    pub fn fail_auth(&self, _now: Timestamp) -> Self {
        Self {
            phase: SyncPhase::Error,
            in_flight: false,
            next_retry_at: None,
            needs_reauth: true,
            ..*self
        }
    }

    /// Time left in the cooldown window that follows every attempt.
    pub fn cooldown_remaining(&self, now: Timestamp, config: &SyncConfig) -> Option<Duration> {
        let until = self.last_attempt?.saturating_add(config.cooldown());
        until.is_after(&now).then(|| until.saturating_since(now))
    }

    /// Time left before the scheduled retry.
    pub fn backoff_remaining(&self, now: Timestamp) -> Option<Duration> {
        let at = self.next_retry_at?;
        at.is_after(&now).then(|| at.saturating_since(now))
    }

    /// Phase to display at `now`; an idle machine inside the cooldown reads as `Cooldown`.
    pub fn phase_at(&self, now: Timestamp, config: &SyncConfig) -> SyncPhase {
        match self.phase {
            SyncPhase::Idle if self.cooldown_remaining(now, config).is_some() => SyncPhase::Cooldown,
            phase => phase,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn last_attempt(&self) -> Option<Timestamp> {
        self.last_attempt
    }

    pub fn last_success(&self) -> Option<Timestamp> {
        self.last_success
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_retry_at(&self) -> Option<Timestamp> {
        self.next_retry_at
    }

    pub fn stalled(&self) -> bool {
        self.stalled
    }

    pub fn needs_reauth(&self) -> bool {
        self.needs_reauth
    }
}
