//! Durable session snapshot with rotating backups.
//!
//! Layout under a key/value backend, for namespace `ns` and user `u`:
//!
//! ```text
//! ns:u:sessions            current snapshot (envelope)
//! ns:u:sessions.backup.0   previous snapshot
//! ns:u:sessions.backup.1   the one before
//! ...
//! ```
//!
//! `save` and `load` never return errors. Failures are logged, the store
//! falls back to its backups, and what happened is described in the
//! returned report.

use crate::envelope::{self, STORE_VERSION, Snapshot};
use crate::error::{StorageError, StorageResult};
use crate::kv::KeyValueStore;
use crate::repair::{RepairNote, normalize_session};
use chipledger_types::{Session, SessionId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of backup slots kept behind the primary snapshot.
pub const BACKUP_SLOTS: usize = 3;

/// Local store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key prefix shared by every key this store writes.
    pub namespace: String,
    /// Number of rotating backups.
    pub backup_slots: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "chipledger".to_string(),
            backup_slots: BACKUP_SLOTS,
        }
    }
}

/// Outcome of [`LocalStore::save`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// The new snapshot reached the primary slot.
    pub written: bool,
    /// Number of sessions in the snapshot.
    pub sessions: usize,
    /// Size of the encoded snapshot.
    pub bytes: usize,
    /// Backups shifted before the write.
    pub rotated: usize,
    /// Fixes applied while normalizing.
    pub repairs: usize,
    /// The write failed and the primary was restored from `backup.0`.
    pub restored_from_backup: bool,
    /// Older backups were dropped to make room.
    pub pruned_backups: bool,
    /// Why the write failed.
    pub error: Option<String>,
}

/// Which slot a load was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// Current-version primary snapshot.
    Primary,
    /// Current-version backup at the given slot.
    Backup(usize),
    /// Older or newer layout, converted. `backup` is `None` for the primary.
    Migrated {
        from_version: Option<u32>,
        backup: Option<usize>,
    },
    /// Nothing usable was stored.
    Empty,
}

/// Outcome of [`LocalStore::load`].
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub sessions: Vec<Session>,
    pub source: LoadSource,
    /// Per-session fixes applied by the repair pass.
    pub repairs: Vec<(SessionId, Vec<RepairNote>)>,
    /// Records discarded as unrecognizable.
    pub skipped: usize,
    /// Human-readable problems met on the way (unreadable slots, divergences).
    pub warnings: Vec<String>,
}

impl LoadReport {
    fn empty(warnings: Vec<String>) -> Self {
        Self {
            sessions: Vec::new(),
            source: LoadSource::Empty,
            repairs: Vec::new(),
            skipped: 0,
            warnings,
        }
    }

    /// True when the stored data should be rewritten in the current layout.
    #[must_use]
    pub fn needs_rewrite(&self) -> bool {
        !matches!(self.source, LoadSource::Primary | LoadSource::Empty)
            || !self.repairs.is_empty()
            || self.skipped > 0
    }
}

/// Session snapshot store for one user.
#[derive(Clone)]
pub struct LocalStore {
    kv: Arc<dyn KeyValueStore>,
    config: StoreConfig,
    user: UserId,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("config", &self.config)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, config: StoreConfig, user: &UserId) -> Self {
        Self {
            kv,
            config,
            user: user.clone(),
        }
    }

    /// Same backend and configuration, scoped to another user.
    #[must_use]
    pub fn for_user(&self, user: &UserId) -> Self {
        Self::new(Arc::clone(&self.kv), self.config.clone(), user)
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Key of the primary snapshot.
    pub fn primary_key(&self) -> String {
        format!("{}:{}:sessions", self.config.namespace, self.user)
    }

    /// Key of backup slot `slot` (0 is the newest).
    pub fn backup_key(&self, slot: usize) -> String {
        format!("{}.backup.{slot}", self.primary_key())
    }

    /// Writes `sessions` as the new primary snapshot.
    pub fn save(&self, sessions: &[Session]) -> SaveReport {
        self.save_at(sessions, Timestamp::now())
    }

    /// [`save`](Self::save) with an explicit envelope timestamp.
    pub fn save_at(&self, sessions: &[Session], at: Timestamp) -> SaveReport {
        let mut report = SaveReport {
            sessions: sessions.len(),
            ..SaveReport::default()
        };

        report.rotated = self.rotate_backups();

        let normalized: Vec<Session> = sessions
            .iter()
            .map(|session| {
                let repaired = normalize_session(session);
                for note in &repaired.notes {
                    warn!("Normalized session {} before save: {}", session.id, note);
                }
                report.repairs += repaired.notes.len();
                repaired.session
            })
            .collect();

        let raw = match envelope::encode(&normalized, at) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode {} sessions: {}", normalized.len(), e);
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.bytes = raw.len();

        let primary = self.primary_key();
        let mut result = self.kv.set(&primary, &raw);
        if matches!(result, Err(StorageError::QuotaExceeded { .. })) && self.prune_backups() {
            warn!("Local store full; dropped older backups and retrying");
            report.pruned_backups = true;
            result = self.kv.set(&primary, &raw);
        }

        match result {
            Ok(()) => {
                report.written = true;
                debug!("Saved {} sessions ({} bytes) to {}", normalized.len(), raw.len(), primary);
            }
            Err(e) => {
                warn!("Failed to write {}: {}", primary, e);
                report.error = Some(e.to_string());
                report.restored_from_backup = self.restore_primary();
            }
        }
        report
    }

    /// Reads the newest usable snapshot.
    pub fn load(&self) -> LoadReport {
        let mut warnings = Vec::new();
        let slots = std::iter::once((None, self.primary_key()))
            .chain((0..self.config.backup_slots).map(|n| (Some(n), self.backup_key(n))));

        for (backup, key) in slots {
            let raw = match self.kv.get(&key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read {}: {}", key, e);
                    warnings.push(format!("{key}: {e}"));
                    continue;
                }
            };
            match envelope::decode(&key, &raw) {
                Ok(snapshot) if snapshot.is_unusable() => {
                    warn!("No usable sessions in {}", key);
                    warnings.push(format!("{key}: no usable sessions"));
                }
                Ok(snapshot) => return self.report(snapshot, backup, warnings),
                Err(e) => {
                    warn!("Corrupted snapshot in {}: {}", key, e);
                    warnings.push(format!("{key}: {e}"));
                }
            }
        }

        if !warnings.is_empty() {
            warn!("No readable snapshot for {}; starting empty", self.user);
        }
        LoadReport::empty(warnings)
    }

    /// Removes the primary snapshot and every backup.
    pub fn clear(&self) -> StorageResult<()> {
        self.kv.remove(&self.primary_key())?;
        for slot in 0..self.config.backup_slots {
            self.kv.remove(&self.backup_key(slot))?;
        }
        info!("Cleared local sessions for {}", self.user);
        Ok(())
    }

    /// Number of backup slots currently holding data.
    pub fn backup_count(&self) -> usize {
        (0..self.config.backup_slots)
            .filter(|slot| matches!(self.kv.get(&self.backup_key(*slot)), Ok(Some(_))))
            .count()
    }

    /// Copies the newest parseable backup over the primary.
    ///
    /// Returns the slot restored from, or `None` when no backup parses.
    pub fn restore_latest_backup(&self) -> StorageResult<Option<usize>> {
        for slot in 0..self.config.backup_slots {
            let Some(raw) = self.kv.get(&self.backup_key(slot))? else {
                continue;
            };
            if envelope::decode(&self.backup_key(slot), &raw).is_ok() {
                self.kv.set(&self.primary_key(), &raw)?;
                info!("Restored {} from backup slot {}", self.primary_key(), slot);
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn report(&self, snapshot: Snapshot, backup: Option<usize>, mut warnings: Vec<String>) -> LoadReport {
        let source = match (snapshot.is_migrated(), backup) {
            (true, backup) => LoadSource::Migrated {
                from_version: snapshot.version,
                backup,
            },
            (false, Some(slot)) => LoadSource::Backup(slot),
            (false, None) => LoadSource::Primary,
        };
        if let LoadSource::Migrated { from_version, .. } = source {
            info!(
                "Migrated {} sessions from layout {:?} to {}",
                snapshot.sessions.len(),
                from_version,
                STORE_VERSION
            );
        }
        if let Some(slot) = backup {
            warn!("Loaded sessions for {} from backup slot {}", self.user, slot);
        }

        let mut sessions = Vec::with_capacity(snapshot.sessions.len());
        let mut repairs = Vec::new();
        for repaired in snapshot.sessions {
            for note in &repaired.notes {
                if let RepairNote::DerivedMismatch { .. } = note {
                    warnings.push(format!("session {}: {}", repaired.session.id, note));
                }
                debug!("Repaired session {}: {}", repaired.session.id, note);
            }
            if repaired.had_derived_mismatch() {
                warn!("Stored chip count diverged for session {}; using recomputed value", repaired.session.id);
            }
            if !repaired.notes.is_empty() {
                repairs.push((repaired.session.id, repaired.notes));
            }
            sessions.push(repaired.session);
        }

        LoadReport {
            sessions,
            source,
            repairs,
            skipped: snapshot.skipped.len(),
            warnings,
        }
    }

    /// Shifts the primary into `backup.0` and every backup one slot older.
    ///
    /// A primary that is not JSON is left out of the rotation so that a
    /// corrupt write never pushes a good backup out.
    fn rotate_backups(&self) -> usize {
        let slots = self.config.backup_slots;
        if slots == 0 {
            return 0;
        }
        let primary = match self.kv.get(&self.primary_key()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                warn!("Skipping backup rotation, primary unreadable: {}", e);
                return 0;
            }
        };
        if serde_json::from_str::<serde_json::Value>(&primary).is_err() {
            warn!("Skipping backup rotation, primary is not valid JSON");
            return 0;
        }

        let mut rotated = 0;
        for slot in (1..slots).rev() {
            match self.kv.get(&self.backup_key(slot - 1)) {
                Ok(Some(raw)) => match self.kv.set(&self.backup_key(slot), &raw) {
                    Ok(()) => rotated += 1,
                    Err(e) => warn!("Failed to rotate backup {} -> {}: {}", slot - 1, slot, e),
                },
                Ok(None) => {}
                Err(e) => warn!("Failed to read backup {}: {}", slot - 1, e),
            }
        }
        match self.kv.set(&self.backup_key(0), &primary) {
            Ok(()) => rotated += 1,
            Err(e) => warn!("Failed to copy primary into backup 0: {}", e),
        }
        rotated
    }

    /// Drops every backup except the newest. Returns true if anything was removed.
    fn prune_backups(&self) -> bool {
        let mut removed = false;
        for slot in 1..self.config.backup_slots {
            if matches!(self.kv.get(&self.backup_key(slot)), Ok(Some(_)))
                && self.kv.remove(&self.backup_key(slot)).is_ok()
            {
                removed = true;
            }
        }
        removed
    }

    fn restore_primary(&self) -> bool {
        match self.kv.get(&self.backup_key(0)) {
            Ok(Some(raw)) => match self.kv.set(&self.primary_key(), &raw) {
                Ok(()) => {
                    info!("Restored {} from backup 0 after failed write", self.primary_key());
                    true
                }
                Err(e) => {
                    warn!("Failed to restore {} from backup: {}", self.primary_key(), e);
                    false
                }
            },
            _ => false,
        }
    }
}
