//! Content fingerprints over the session list.
//!
//! A fingerprint covers only what matters for money and chips: session ids
//! and status, each participant's id, stack, cash-out, status and chips
//! left behind, plus the derived totals. Names, timestamps, and logs are
//! left out, so cosmetic edits do not trigger writes.
//!
//! The encoding is canonical (sessions and participants sorted by id, fixed
//! field order, length-prefixed lists), which makes the fingerprint
//! independent of list order and edit history.

use chipledger_types::{Participant, ParticipantStatus, Session, SessionStatus};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Hex-encoded SHA-256 over the canonical session encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint of `sessions`.
#[must_use]
pub fn fingerprint(sessions: &[Session]) -> Fingerprint {
    let mut ordered: Vec<&Session> = sessions.iter().collect();
    ordered.sort_by_key(|s| s.id);

    let mut hasher = Sha256::new();
    hasher.update((ordered.len() as u64).to_le_bytes());
    for session in ordered {
        hasher.update(session.id.as_uuid().as_bytes());
        hasher.update([session_status_tag(session.status)]);
        hasher.update(session.physical_points_on_table().get().to_le_bytes());
        hasher.update(session.total_contributions().get().to_le_bytes());

        let mut participants: Vec<&Participant> = session.participants.iter().collect();
        participants.sort_by_key(|p| p.id);
        hasher.update((participants.len() as u64).to_le_bytes());
        for p in participants {
            hasher.update(p.id.as_uuid().as_bytes());
            hasher.update(p.stack.get().to_le_bytes());
            hasher.update(p.cash_out.get().to_le_bytes());
            hasher.update([participant_status_tag(p.status)]);
            match p.points_left_on_table {
                Some(points) => {
                    hasher.update([1]);
                    hasher.update(points.get().to_le_bytes());
                }
                None => hasher.update([0]),
            }
        }
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

fn session_status_tag(status: SessionStatus) -> u8 {
    match status {
        SessionStatus::Active => 0,
        SessionStatus::PendingClose => 1,
        SessionStatus::Completed => 2,
    }
}

fn participant_status_tag(status: ParticipantStatus) -> u8 {
    match status {
        ParticipantStatus::Active => 0,
        ParticipantStatus::CashedOutEarly => 1,
    }
}

/// A party that needs to see every change exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consumer {
    /// The local store.
    Local,
    /// The remote store.
    Remote,
}

/// Remembers the last fingerprint each consumer has seen.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    seen: HashMap<Consumer, Fingerprint>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `current` differs from what `consumer` last received.
    #[must_use]
    pub fn has_changed(&self, consumer: Consumer, current: &Fingerprint) -> bool {
        self.seen.get(&consumer) != Some(current)
    }

    /// Records that `consumer` now holds `fingerprint`.
    pub fn mark_persisted(&mut self, consumer: Consumer, fingerprint: Fingerprint) {
        self.seen.insert(consumer, fingerprint);
    }

    pub fn last(&self, consumer: Consumer) -> Option<&Fingerprint> {
        self.seen.get(&consumer)
    }

    /// Forgets everything, so the next check reports a change.
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}
