//! Sync coordinator.
//!
//! [`SyncCoordinator`] is the single owner of the in-memory session list.
//! UI mutations go through it (optimistic update plus a queued remote
//! write), and so do sync results. It is built once at the composition root
//! and shared as `Arc<SyncCoordinator>`.
//!
//! A sync cycle:
//!
//! 1. Ask the [`SyncMachine`] whether a sync may start (user, in-flight,
//!    cooldown, backoff, stall).
//! 2. Push the outbox of pending writes, oldest first.
//! 3. Fetch owned and accepted-shared sessions.
//! 4. Merge: owned copies win over shared copies of the same id; sessions
//!    edited or deleted locally after the cycle started keep their local
//!    state; locally created sessions not yet on the remote are kept.
//! 5. Replace the in-memory list and persist it.
//!
//! Steps 2 and 3 run under one timeout. On failure the machine schedules a
//! retry, the in-memory list falls back to the local snapshot (marked
//! stale), and a dismissable message is published on the status channel.

use crate::clock::{Clock, SystemClock};
use crate::config::{NetworkQuality, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::fingerprint::{ChangeDetector, Consumer, fingerprint};
use crate::machine::{SkipReason, SyncMachine, SyncPhase, SyncTrigger};
use crate::remote::{GrantStatus, RemoteSession, RemoteStore};
use chipledger_settlement::{Settlement, settle_with_tolerance};
use chipledger_storage::{KeyValueStore, LoadReport, LoadSource, LocalStore, StoreConfig};
use chipledger_types::{MinorUnits, Session, SessionAccess, SessionId, Timestamp, UserId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Category of a user-facing status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Network,
    Auth,
    Storage,
    Other,
}

/// A message for the user about the last sync or save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: MessageKind,
    pub message: String,
    pub dismissable: bool,
}

impl StatusMessage {
    fn for_error(error: &SyncError, stalled: bool) -> Self {
        let (kind, message) = match error {
            SyncError::Auth(_) => (MessageKind::Auth, "Sign in again to sync your games".to_string()),
            e if e.is_transient() && stalled => (
                MessageKind::Network,
                "Sync paused after repeated failures. Refresh to try again".to_string(),
            ),
            e if e.is_transient() => (
                MessageKind::Network,
                "Could not reach the server. Showing saved games".to_string(),
            ),
            SyncError::Storage(e) => (MessageKind::Storage, format!("Could not save games: {e}")),
            other => (MessageKind::Other, format!("Sync failed: {other}")),
        };
        Self {
            kind,
            message,
            dismissable: true,
        }
    }
}

/// Snapshot published on the status channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub last_sync_time: Option<Timestamp>,
    /// Remote writes not yet acknowledged.
    pub pending_writes: usize,
    /// The session list came from the local snapshot after a failed sync.
    pub stale: bool,
    pub stalled: bool,
    pub needs_reauth: bool,
    pub message: Option<StatusMessage>,
    pub network: NetworkQuality,
}

/// Totals recorded when a session completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub participants: usize,
    pub total_contributions: MinorUnits,
    pub total_cash_out: MinorUnits,
    /// Sum of net balances; zero for a correctly booked game.
    pub residual: MinorUnits,
    pub duration: Duration,
}

impl SessionStats {
    fn of(session: &Session) -> Self {
        let ended = session.ended_at.unwrap_or(session.updated_at);
        Self {
            participants: session.participants.len(),
            total_contributions: session.total_contributions(),
            total_cash_out: session.total_cash_out(),
            residual: session.balance_residual(),
            duration: ended.saturating_since(session.started_at),
        }
    }
}

/// Result of [`SyncCoordinator::complete_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCompletion {
    pub session_id: SessionId,
    pub settlement: Settlement,
    pub stats: SessionStats,
}

/// Notifications for observers. Dropping the receiver unsubscribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SyncStarted { trigger: SyncTrigger },
    SyncCompleted { fetched: usize, pushed: usize },
    SyncFailed { message: String, retry_in: Option<Duration> },
    SessionsChanged { count: usize },
    LocalSaved { sessions: usize },
    SessionCompleted(SessionCompletion),
}

/// Result of one [`SyncCoordinator::sync`] call.
#[derive(Debug)]
pub enum SyncOutcome {
    Synced {
        fetched: usize,
        pushed: usize,
        /// Sessions whose local version was kept over the remote one.
        kept_local: usize,
    },
    Skipped(SkipReason),
    Failed {
        error: SyncError,
        retry_in: Option<Duration>,
        /// The session list is a local fallback.
        stale: bool,
    },
    /// Retries are exhausted and there is no local data to show.
    LoadFailed { error: SyncError },
    /// The user changed while the cycle was running; its result was discarded.
    Superseded,
}

impl SyncOutcome {
    #[must_use]
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced { .. })
    }

    /// Delay before the scheduled retry, if one was scheduled.
    pub fn retry_in(&self) -> Option<Duration> {
        match self {
            Self::Failed { retry_in, .. } => *retry_in,
            _ => None,
        }
    }
}

/// A remote write waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Create(Session),
    Update(Session),
    Delete(SessionId),
}

impl PendingWrite {
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Create(s) | Self::Update(s) => s.id,
            Self::Delete(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    seq: u64,
    write: PendingWrite,
}

struct Exchange {
    pushed: usize,
    owned: Vec<RemoteSession>,
    shared: Vec<RemoteSession>,
}

#[derive(Default)]
struct State {
    /// Bumped on every user change; results from an older generation are dropped.
    generation: u64,
    user: Option<UserId>,
    local: Option<LocalStore>,
    machine: SyncMachine,
    network: NetworkQuality,
    sessions: Vec<Session>,
    outbox: VecDeque<Queued>,
    next_seq: u64,
    /// Last local modification per session.
    modified: HashMap<SessionId, Timestamp>,
    /// Local deletions not yet confirmed by the remote.
    tombstones: HashMap<SessionId, Timestamp>,
    detector: ChangeDetector,
    /// Explicit edits so far, and how many of them the local snapshot holds.
    /// Renames and reorders leave the fingerprint alone, so edits are
    /// counted separately.
    local_edits: u64,
    saved_edits: u64,
    message: Option<StatusMessage>,
    stale: bool,
    last_sync_time: Option<Timestamp>,
    /// A readable local snapshot exists for this user.
    has_snapshot: bool,
}

impl State {
    fn position(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    /// Newest first, then by id.
    fn sort_sessions(&mut self) {
        self.sessions
            .sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
    }

    fn mark_edited(&mut self) {
        self.local_edits = self.local_edits.wrapping_add(1);
    }

    fn edited_since(&self, id: SessionId, since: Timestamp) -> bool {
        self.modified.get(&id).is_some_and(|at| !at.is_before(&since))
    }

    /// Queues a write, folding it into any write already queued for the same session.
    fn enqueue(&mut self, write: PendingWrite) {
        let id = write.session_id();
        let existing = self.outbox.iter().position(|q| q.write.session_id() == id);
        let folded = match (existing.map(|i| &self.outbox[i].write), write) {
            (Some(PendingWrite::Create(_)), PendingWrite::Update(s)) => Some(PendingWrite::Create(s)),
            (Some(PendingWrite::Create(_)), PendingWrite::Delete(_)) => None,
            (_, write) => Some(write),
        };
        if let Some(i) = existing {
            self.outbox.remove(i);
        }
        if let Some(write) = folded {
            self.next_seq += 1;
            self.outbox.push_back(Queued {
                seq: self.next_seq,
                write,
            });
        }
    }
}

/// Owner of the in-memory session list and driver of sync cycles.
pub struct SyncCoordinator {
    remote: Arc<dyn RemoteStore>,
    kv: Arc<dyn KeyValueStore>,
    store_config: StoreConfig,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    status_tx: watch::Sender<SyncStatus>,
    events_tx: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    /// Creates a coordinator with no signed-in user.
    pub fn new(remote: Arc<dyn RemoteStore>, kv: Arc<dyn KeyValueStore>, config: SyncConfig) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            remote,
            kv,
            store_config: StoreConfig::default(),
            config,
            clock: Arc::new(SystemClock),
            state: Mutex::new(State::default()),
            status_tx,
            events_tx,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_store_config(mut self, store_config: StoreConfig) -> Self {
        self.store_config = store_config;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.local = state
            .user
            .as_ref()
            .map(|u| LocalStore::new(Arc::clone(&self.kv), self.store_config.clone(), u));
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current time on the coordinator's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ── Observation ──────────────────────────────────────────────

    /// Copy of the in-memory session list, newest first.
    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.clone()
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        let st = self.lock();
        st.position(id).map(|i| st.sessions[i].clone())
    }

    pub fn status(&self) -> SyncStatus {
        self.status_of(&self.lock())
    }

    /// Status updates. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Event stream. Dropping the receiver unsubscribes.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// Writes queued for the remote, oldest first.
    pub fn pending_writes(&self) -> Vec<PendingWrite> {
        self.lock().outbox.iter().map(|q| q.write.clone()).collect()
    }

    pub fn machine(&self) -> SyncMachine {
        self.lock().machine
    }

    pub fn user(&self) -> Option<UserId> {
        self.lock().user.clone()
    }

    // ── Session & environment ────────────────────────────────────

    /// Switches the signed-in user, discarding all in-memory state of the previous one.
    ///
    /// Pending changes of the previous user are flushed to its local snapshot first.
    pub fn set_user(&self, user: Option<UserId>) {
        if self.lock().user == user {
            return;
        }
        self.flush_local("user change");

        let mut st = self.lock();
        info!(
            "Sync user changed to {}",
            user.as_ref().map_or("<none>", UserId::as_str)
        );
        let generation = st.generation + 1;
        let network = st.network;
        *st = State {
            generation,
            local: user
                .as_ref()
                .map(|u| LocalStore::new(Arc::clone(&self.kv), self.store_config.clone(), u)),
            user,
            network,
            ..State::default()
        };
        self.publish(&st);
        drop(st);
        self.emit(SyncEvent::SessionsChanged { count: 0 });
    }

    pub fn set_network(&self, network: NetworkQuality) {
        let mut st = self.lock();
        if st.network != network {
            debug!("Network quality changed to {:?}", network);
            st.network = network;
            self.publish(&st);
        }
    }

    pub fn network(&self) -> NetworkQuality {
        self.lock().network
    }

    /// Clears the current status message.
    pub fn dismiss_error(&self) {
        let mut st = self.lock();
        if st.message.take().is_some() {
            self.publish(&st);
        }
    }

    // ── Mutations ────────────────────────────────────────────────

    /// Adds a session owned by the current user and queues its creation.
    pub fn add(&self, mut session: Session) -> SessionId {
        let now = self.clock.now();
        let id = session.id;
        let count = {
            let mut guard = self.lock();
            let st = &mut *guard;
            session.access = SessionAccess::Owner;
            if session.owner_id.is_none() {
                session.owner_id = st.user.clone();
            }
            session.touch(now);
            st.tombstones.remove(&id);
            st.modified.insert(id, now);
            match st.position(id) {
                Some(i) => st.sessions[i] = session.clone(),
                None => st.sessions.push(session.clone()),
            }
            st.sort_sessions();
            st.mark_edited();
            st.enqueue(PendingWrite::Create(session));
            self.publish(st);
            st.sessions.len()
        };
        debug!("Added session {}", id);
        self.emit(SyncEvent::SessionsChanged { count });
        id
    }

    /// Replaces a session with `session` (last writer wins) and queues the update.
    ///
    /// Access and owner are kept from the stored copy. Updates to sessions
    /// shared with the user stay local: only owners may write to the remote.
    pub fn update(&self, mut session: Session) -> SyncResult<()> {
        let now = self.clock.now();
        let id = session.id;
        let count = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let i = st
                .position(id)
                .ok_or_else(|| SyncError::NotFound(format!("session {id}")))?;
            session.access = st.sessions[i].access;
            session.owner_id = st.sessions[i].owner_id.clone();
            session.touch(now);
            let owned = session.is_owned();
            st.sessions[i] = session.clone();
            st.sort_sessions();
            st.modified.insert(id, now);
            st.mark_edited();
            if owned {
                st.enqueue(PendingWrite::Update(session));
            } else {
                debug!("Session {} is shared with this user; keeping update local", id);
            }
            self.publish(st);
            st.sessions.len()
        };
        self.emit(SyncEvent::SessionsChanged { count });
        Ok(())
    }

    /// Applies `change` to a copy of the session, then stores it with [`update`](Self::update).
    pub fn modify<F>(&self, id: SessionId, change: F) -> SyncResult<Session>
    where
        F: FnOnce(&mut Session) -> chipledger_types::Result<()>,
    {
        let mut session = self
            .session(id)
            .ok_or_else(|| SyncError::NotFound(format!("session {id}")))?;
        change(&mut session)?;
        self.update(session.clone())?;
        Ok(session)
    }

    /// Removes a session and queues its deletion (owner) or grant revocation (guest).
    pub fn remove(&self, id: SessionId) -> SyncResult<()> {
        let now = self.clock.now();
        let count = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let i = st
                .position(id)
                .ok_or_else(|| SyncError::NotFound(format!("session {id}")))?;
            st.sessions.remove(i);
            st.modified.remove(&id);
            st.tombstones.insert(id, now);
            st.mark_edited();
            st.enqueue(PendingWrite::Delete(id));
            self.publish(st);
            st.sessions.len()
        };
        debug!("Removed session {}", id);
        self.emit(SyncEvent::SessionsChanged { count });
        Ok(())
    }

    /// Replaces the whole list without queuing remote writes.
    ///
    /// The new sessions count as local edits, so a sync already in flight
    /// does not overwrite them; the next sync reconciles them with the remote.
    pub fn replace_all(&self, mut sessions: Vec<Session>) {
        let now = self.clock.now();
        let count = {
            let mut guard = self.lock();
            let st = &mut *guard;
            for session in &mut sessions {
                session.recompute_derived();
                st.modified.insert(session.id, now);
            }
            st.sessions = sessions;
            st.sort_sessions();
            st.mark_edited();
            self.publish(st);
            st.sessions.len()
        };
        self.emit(SyncEvent::SessionsChanged { count });
    }

    /// Completes a session, settles it, and announces the result.
    pub fn complete_session(&self, id: SessionId, at: Timestamp) -> SyncResult<SessionCompletion> {
        let completion = {
            let mut guard = self.lock();
            let st = &mut *guard;
            let i = st
                .position(id)
                .ok_or_else(|| SyncError::NotFound(format!("session {id}")))?;
            let mut session = st.sessions[i].clone();
            session.complete(at)?;
            let settlement = settle_with_tolerance(
                &session.net_balances(),
                MinorUnits::new(self.config.balance_tolerance),
            );
            let stats = SessionStats::of(&session);
            let owned = session.is_owned();
            st.sessions[i] = session.clone();
            st.modified.insert(id, at.max(self.clock.now()));
            st.mark_edited();
            if owned {
                st.enqueue(PendingWrite::Update(session));
            }
            self.publish(st);
            SessionCompletion {
                session_id: id,
                settlement,
                stats,
            }
        };

        if let Some(warning) = &completion.settlement.warning {
            warn!("Session {} does not balance: residual {}", id, warning.residual);
        }
        info!(
            "Completed session {} with {} transfers",
            id,
            completion.settlement.transfers.len()
        );
        self.emit(SyncEvent::SessionCompleted(completion.clone()));
        self.flush_local("session completed");
        Ok(completion)
    }

    // ── Persistence ──────────────────────────────────────────────

    /// Loads the local snapshot into memory if the in-memory list is empty.
    ///
    /// Data read from an older layout or a backup is rewritten in the
    /// current layout. Returns `None` without a signed-in user.
    pub fn load_local(&self) -> Option<LoadReport> {
        let (store, generation) = {
            let st = self.lock();
            (st.local.clone()?, st.generation)
        };
        let report = store.load();
        if report.needs_rewrite() && report.source != LoadSource::Empty {
            let saved = store.save(&report.sessions);
            debug!("Rewrote local snapshot after load (written: {})", saved.written);
        }

        let count = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.generation != generation {
                return None;
            }
            if report.source != LoadSource::Empty {
                st.has_snapshot = true;
            }
            if !st.sessions.is_empty() {
                return Some(report);
            }
            st.sessions = report.sessions.clone();
            st.sort_sessions();
            st.detector
                .mark_persisted(Consumer::Local, fingerprint(&st.sessions));
            st.saved_edits = st.local_edits;
            self.publish(st);
            st.sessions.len()
        };
        info!("Loaded {} sessions from local store ({:?})", count, report.source);
        self.emit(SyncEvent::SessionsChanged { count });
        Some(report)
    }

    /// Persists the session list if it was edited or its content changed
    /// since the last save.
    ///
    /// Returns true when a snapshot was written.
    pub fn flush_local(&self, reason: &str) -> bool {
        let (store, sessions, current, edits, generation) = {
            let st = self.lock();
            let Some(store) = st.local.clone() else {
                return false;
            };
            let current = fingerprint(&st.sessions);
            let edited = st.local_edits != st.saved_edits;
            if !edited && !st.detector.has_changed(Consumer::Local, &current) {
                debug!("Skipping local save ({}): nothing changed", reason);
                return false;
            }
            (store, st.sessions.clone(), current, st.local_edits, st.generation)
        };

        let report = store.save(&sessions);

        let mut st = self.lock();
        if st.generation != generation {
            return false;
        }
        if report.written {
            st.detector.mark_persisted(Consumer::Local, current);
            st.saved_edits = edits;
            st.has_snapshot = true;
            if st.message.as_ref().is_some_and(|m| m.kind == MessageKind::Storage) {
                st.message = None;
            }
            self.publish(&st);
            drop(st);
            debug!("Saved {} sessions locally ({})", sessions.len(), reason);
            self.emit(SyncEvent::LocalSaved {
                sessions: sessions.len(),
            });
            true
        } else {
            let reason = report.error.unwrap_or_else(|| "unknown error".to_string());
            warn!("Local save failed: {}", reason);
            st.message = Some(StatusMessage::for_error(&SyncError::Storage(reason), false));
            self.publish(&st);
            false
        }
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// Runs one sync cycle if the machine allows it.
    pub async fn sync(&self, trigger: SyncTrigger) -> SyncOutcome {
        let now = self.clock.now();
        let (user, generation, outbox, timeout) = {
            let mut st = self.lock();
            let Some(user) = st.user.clone() else {
                return SyncOutcome::Skipped(SkipReason::NoUser);
            };
            if !st.network.is_online() && !trigger.is_forced() {
                return SyncOutcome::Skipped(SkipReason::Offline);
            }
            if trigger == SyncTrigger::LocalChange
                && st.outbox.is_empty()
                && !st.detector.has_changed(Consumer::Remote, &fingerprint(&st.sessions))
            {
                return SyncOutcome::Skipped(SkipReason::Unchanged);
            }
            match st.machine.begin(now, trigger, true, &self.config) {
                Ok(machine) => st.machine = machine,
                Err(reason) => {
                    debug!("Sync ({}) skipped: {}", trigger, reason);
                    return SyncOutcome::Skipped(reason);
                }
            }
            let outbox: Vec<Queued> = st.outbox.iter().cloned().collect();
            self.publish(&st);
            (user, st.generation, outbox, self.config.timeout(st.network))
        };

        info!("Sync started ({}) with {} pending writes", trigger, outbox.len());
        self.emit(SyncEvent::SyncStarted { trigger });

        let result = tokio::time::timeout(timeout, self.exchange(&user, outbox))
            .await
            .unwrap_or(Err(SyncError::Timeout));

        match result {
            Ok(exchange) => self.apply_exchange(generation, now, exchange),
            Err(error) => self.handle_failure(generation, error),
        }
    }

    /// Pushes queued writes, then fetches the remote view.
    async fn exchange(&self, user: &UserId, outbox: Vec<Queued>) -> SyncResult<Exchange> {
        let mut pushed = 0;
        for queued in outbox {
            let result = match &queued.write {
                PendingWrite::Create(session) => self.remote.create(user, session).await,
                PendingWrite::Update(session) => match self.remote.update(user, session).await {
                    Err(SyncError::NotFound(_)) => self.remote.create(user, session).await,
                    other => other,
                },
                PendingWrite::Delete(id) => match self.remote.delete(user, *id).await {
                    Err(SyncError::NotFound(_)) => Ok(()),
                    other => other,
                },
            };
            match result {
                Ok(()) => pushed += 1,
                Err(SyncError::Forbidden(reason)) => {
                    warn!(
                        "Remote rejected write for session {}; dropping it: {}",
                        queued.write.session_id(),
                        reason
                    );
                }
                Err(e) => return Err(e),
            }
            self.lock().outbox.retain(|q| q.seq != queued.seq);
        }

        let owned = self.remote.fetch_owned(user).await?;
        let shared = self.remote.fetch_shared(user, GrantStatus::Accepted).await?;
        Ok(Exchange {
            pushed,
            owned,
            shared,
        })
    }

    fn apply_exchange(&self, generation: u64, started_at: Timestamp, exchange: Exchange) -> SyncOutcome {
        let now = self.clock.now();
        let Exchange {
            pushed,
            owned,
            shared,
        } = exchange;
        let fetched = owned.len() + shared.len();

        let (kept_local, count) = {
            let mut guard = self.lock();
            let st = &mut *guard;
            if st.generation != generation {
                debug!("Discarding sync result for a previous user");
                return SyncOutcome::Superseded;
            }

            let mut remote = Vec::with_capacity(fetched);
            let mut remote_ids = HashSet::new();
            for RemoteSession { mut session, .. } in owned {
                session.access = SessionAccess::Owner;
                if session.owner_id.is_none() {
                    session.owner_id = st.user.clone();
                }
                if remote_ids.insert(session.id) {
                    remote.push(session);
                }
            }
            for RemoteSession { mut session, .. } in shared {
                if !remote_ids.insert(session.id) {
                    debug!("Ignoring shared copy of owned session {}", session.id);
                    continue;
                }
                session.access = SessionAccess::Guest;
                remote.push(session);
            }

            let pending: HashSet<SessionId> = st.outbox.iter().map(|q| q.write.session_id()).collect();
            let mut local: HashMap<SessionId, Session> = std::mem::take(&mut st.sessions)
                .into_iter()
                .map(|s| (s.id, s))
                .collect();

            let mut merged = Vec::with_capacity(remote.len() + local.len());
            let mut kept_local = 0;
            for mut session in remote {
                let id = session.id;
                if st.tombstones.contains_key(&id) {
                    debug!("Keeping local deletion of session {}", id);
                    local.remove(&id);
                    continue;
                }
                let local_is_newer = pending.contains(&id) || st.edited_since(id, started_at);
                match local.remove(&id) {
                    Some(mine) if local_is_newer => {
                        merged.push(mine);
                        kept_local += 1;
                    }
                    _ => {
                        session.recompute_derived();
                        merged.push(session);
                    }
                }
            }
            for (id, session) in local {
                if pending.contains(&id) || st.edited_since(id, started_at) {
                    merged.push(session);
                    kept_local += 1;
                } else {
                    debug!("Session {} is gone from the remote; dropping local copy", id);
                }
            }

            st.sessions = merged;
            st.sort_sessions();
            st.tombstones
                .retain(|id, _| pending.contains(id) || remote_ids.contains(id));
            st.modified.retain(|_, at| !at.is_before(&started_at));
            st.machine = st.machine.succeed(now);
            st.last_sync_time = Some(now);
            st.stale = false;
            st.message = None;
            st.detector
                .mark_persisted(Consumer::Remote, fingerprint(&st.sessions));
            self.publish(st);
            (kept_local, st.sessions.len())
        };

        info!(
            "Sync finished: {} fetched, {} pushed, {} kept local",
            fetched, pushed, kept_local
        );
        self.emit(SyncEvent::SyncCompleted { fetched, pushed });
        self.emit(SyncEvent::SessionsChanged { count });
        self.flush_local("sync");
        SyncOutcome::Synced {
            fetched,
            pushed,
            kept_local,
        }
    }

    fn handle_failure(&self, generation: u64, error: SyncError) -> SyncOutcome {
        let now = self.clock.now();
        let (fallback, retry_in) = {
            let mut st = self.lock();
            if st.generation != generation {
                return SyncOutcome::Superseded;
            }
            st.machine = if error.is_auth() {
                st.machine.fail_auth(now)
            } else {
                st.machine.fail_transient(now, &self.config)
            };
            let retry_in = st.machine.backoff_remaining(now);
            st.message = Some(StatusMessage::for_error(&error, st.machine.stalled()));
            warn!(
                "Sync failed (attempt {}): {}; retry in {:?}",
                st.machine.attempts(),
                error,
                retry_in
            );
            let fallback = if st.sessions.is_empty() { st.local.clone() } else { None };
            (fallback, retry_in)
        };

        let report = fallback.map(|store| store.load());

        let mut guard = self.lock();
        let st = &mut *guard;
        if st.generation != generation {
            return SyncOutcome::Superseded;
        }
        if let Some(report) = report {
            if report.source != LoadSource::Empty {
                st.has_snapshot = true;
            }
            let unsaved_edits = st.local_edits != st.saved_edits;
            if st.sessions.is_empty() && !unsaved_edits && !report.sessions.is_empty() {
                info!("Showing {} locally saved sessions after failed sync", report.sessions.len());
                st.sessions = report.sessions;
                st.sort_sessions();
                st.detector
                    .mark_persisted(Consumer::Local, fingerprint(&st.sessions));
            }
        }

        let has_data = !st.sessions.is_empty();
        st.stale = has_data;
        let gave_up = st.machine.stalled() || st.machine.needs_reauth();
        self.publish(st);
        let count = st.sessions.len();
        let message = st.message.as_ref().map(|m| m.message.clone()).unwrap_or_default();
        drop(guard);

        self.emit(SyncEvent::SyncFailed { message, retry_in });
        if has_data {
            self.emit(SyncEvent::SessionsChanged { count });
        }

        if gave_up && !has_data && !self.lock().has_snapshot {
            error!("Sync failed and no local data is available: {}", error);
            return SyncOutcome::LoadFailed { error };
        }
        SyncOutcome::Failed {
            error,
            retry_in,
            stale: has_data,
        }
    }

    // ── Internals ────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status_of(&self, st: &State) -> SyncStatus {
        let now = self.clock.now();
        SyncStatus {
            phase: st.machine.phase_at(now, &self.config),
            last_sync_time: st.last_sync_time,
            pending_writes: st.outbox.len(),
            stale: st.stale,
            stalled: st.machine.stalled(),
            needs_reauth: st.machine.needs_reauth(),
            message: st.message.clone(),
            network: st.network,
        }
    }

    fn publish(&self, st: &State) {
        self.status_tx.send_replace(self.status_of(st));
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}
