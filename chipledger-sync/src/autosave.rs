//! Debounced auto-save scheduling.
//!
//! Pure bookkeeping: the orchestrator asks [`AutoSaveScheduler::next_deadline`]
//! when to wake up and [`AutoSaveScheduler::due`] whether to flush. A change
//! is saved once edits pause for the debounce window, or at the latest one
//! safety interval after the previous save, so at most one window of edits
//! is ever unsaved.

use crate::config::SyncConfig;
use chipledger_types::Timestamp;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AutoSaveScheduler {
    debounce: Duration,
    safety_interval: Duration,
    pending_since: Option<Timestamp>,
    last_change: Option<Timestamp>,
    last_save: Option<Timestamp>,
}

impl AutoSaveScheduler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            debounce: config.autosave_debounce(),
            safety_interval: config.autosave_interval(),
            pending_since: None,
            last_change: None,
            last_save: None,
        }
    }

    /// Records a local change.
    pub fn on_change(&mut self, now: Timestamp) {
        self.pending_since.get_or_insert(now);
        self.last_change = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// When the pending change must be flushed, if any.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let pending_since = self.pending_since?;
        let debounced = self.last_change.unwrap_or(pending_since).saturating_add(self.debounce);
        let anchor = self.last_save.unwrap_or(pending_since);
        let safety = anchor.saturating_add(self.safety_interval);
        Some(debounced.min(safety))
    }

    /// True when a pending change should be flushed at `now`.
    pub fn due(&self, now: Timestamp) -> bool {
        self.next_deadline().is_some_and(|deadline| !deadline.is_after(&now))
    }

    /// The app went to the background: flush now if anything is pending.
    pub fn on_hidden(&self) -> bool {
        self.is_pending()
    }

    /// The app is shutting down: flush now if anything is pending.
    pub fn on_teardown(&self) -> bool {
        self.is_pending()
    }

    /// A flush completed.
    pub fn mark_saved(&mut self, now: Timestamp) {
        self.pending_since = None;
        self.last_change = None;
        self.last_save = Some(now);
    }
}
