//! Trigger wiring.
//!
//! The orchestrator is a single task that turns application signals
//! ([`SyncCommand`]) and timers into coordinator calls:
//!
//! - `Mount` loads the local snapshot, then syncs.
//! - Network transitions to online are debounced before syncing.
//! - A periodic timer runs while the app is mounted, visible and online;
//!   its interval depends on network quality.
//! - Failed syncs are retried when the backoff expires.
//! - Local edits are pushed as soon as the cooldown allows.
//! - Auto-save flushes the session list after edits settle, when the app is
//!   hidden, and on teardown.
//!
//! Syncs run on their own task and report back over a channel, so commands
//! and flushes are never held up by a slow remote. At most one sync task
//! exists at a time; a forced refresh or a local change that arrives while
//! one is running is replayed once it finishes, other triggers are dropped.

use crate::autosave::AutoSaveScheduler;
use crate::config::NetworkQuality;
use crate::coordinator::{SyncCoordinator, SyncEvent, SyncOutcome, SyncStatus};
use crate::error::{SyncError, SyncResult};
use crate::machine::{SkipReason, SyncTrigger};
use chipledger_types::Timestamp;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 32;

type Finished = (SyncTrigger, SyncOutcome);

/// Signals from the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// The session list was opened.
    Mount,
    /// The user asked for a refresh.
    ForceRefresh,
    NetworkChanged { quality: NetworkQuality },
    VisibilityChanged { visible: bool },
    /// Sessions were edited through the coordinator.
    LocalChange,
    /// Flush and stop the orchestrator.
    Teardown,
}

/// Handle for sending commands to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<SyncCommand>,
    coordinator: Arc<SyncCoordinator>,
}

impl OrchestratorHandle {
    pub async fn send(&self, command: SyncCommand) -> SyncResult<()> {
        self.tx.send(command).await.map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn mount(&self) -> SyncResult<()> {
        self.send(SyncCommand::Mount).await
    }

    pub async fn force_refresh(&self) -> SyncResult<()> {
        self.send(SyncCommand::ForceRefresh).await
    }

    pub async fn network_changed(&self, quality: NetworkQuality) -> SyncResult<()> {
        self.send(SyncCommand::NetworkChanged { quality }).await
    }

    pub async fn visibility_changed(&self, visible: bool) -> SyncResult<()> {
        self.send(SyncCommand::VisibilityChanged { visible }).await
    }

    pub async fn local_change(&self) -> SyncResult<()> {
        self.send(SyncCommand::LocalChange).await
    }

    pub async fn teardown(&self) -> SyncResult<()> {
        self.send(SyncCommand::Teardown).await
    }

    pub fn status(&self) -> SyncStatus {
        self.coordinator.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}

/// Starts the orchestrator task for `coordinator`.
///
/// The task ends after `Teardown` or when every handle is dropped; both
/// flush pending changes first.
pub fn spawn(coordinator: Arc<SyncCoordinator>) -> (OrchestratorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let (finished_tx, finished_rx) = mpsc::channel(1);
    let events = coordinator.events();
    let orchestrator = Orchestrator {
        autosave: AutoSaveScheduler::new(coordinator.config()),
        coordinator: Arc::clone(&coordinator),
        finished: finished_tx,
        syncing: false,
        queued: None,
        mounted: false,
        visible: true,
        online_at: None,
        periodic_at: None,
        retry_at: None,
        push_at: None,
    };
    let task = tokio::spawn(orchestrator.run(rx, finished_rx, events));
    (OrchestratorHandle { tx, coordinator }, task)
}

struct Orchestrator {
    coordinator: Arc<SyncCoordinator>,
    autosave: AutoSaveScheduler,
    finished: mpsc::Sender<Finished>,
    /// A sync task is running and has not reported back yet.
    syncing: bool,
    /// Trigger to replay once the running sync reports back.
    queued: Option<SyncTrigger>,
    mounted: bool,
    visible: bool,
    online_at: Option<Instant>,
    periodic_at: Option<Instant>,
    retry_at: Option<Instant>,
    push_at: Option<Instant>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SyncCommand>,
        mut finished: mpsc::Receiver<Finished>,
        mut events: broadcast::Receiver<SyncEvent>,
    ) {
        info!("Sync orchestrator started");
        let mut events_open = true;

        loop {
            let online_at = self.online_at;
            let periodic_at = self.periodic_at;
            let retry_at = self.retry_at;
            let push_at = self.push_at;
            let autosave_at = self.autosave.next_deadline().map(|at| self.instant_at(at));

            // Change notices go first so a flush command sees every edit made before it.
            tokio::select! {
                biased;

                event = events.recv(), if events_open => match event {
                    Ok(SyncEvent::SessionsChanged { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        self.autosave.on_change(self.coordinator.now());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                Some((trigger, outcome)) = finished.recv() => self.finish_sync(trigger, outcome),
                command = rx.recv() => match command {
                    Some(SyncCommand::Teardown) | None => {
                        if self.autosave.on_teardown() {
                            self.flush("teardown").await;
                        }
                        break;
                    }
                    Some(command) => self.handle(command).await,
                },
                _ = sleep_until_opt(online_at) => {
                    self.online_at = None;
                    self.start_sync(SyncTrigger::NetworkOnline);
                }
                _ = sleep_until_opt(periodic_at) => {
                    self.periodic_at = None;
                    self.start_sync(SyncTrigger::Periodic);
                }
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.start_sync(SyncTrigger::Retry);
                }
                _ = sleep_until_opt(push_at) => {
                    self.push_at = None;
                    self.start_sync(SyncTrigger::LocalChange);
                }
                _ = sleep_until_opt(autosave_at) => {
                    self.flush("auto-save").await;
                }
            }
        }

        info!("Sync orchestrator stopped");
    }

    async fn handle(&mut self, command: SyncCommand) {
        debug!("Orchestrator command: {:?}", command);
        match command {
            SyncCommand::Mount => {
                self.mounted = true;
                let coordinator = Arc::clone(&self.coordinator);
                if let Err(e) = tokio::task::spawn_blocking(move || coordinator.load_local()).await {
                    warn!("Local load task failed: {}", e);
                }
                self.start_sync(SyncTrigger::Mount);
            }
            SyncCommand::ForceRefresh => self.start_sync(SyncTrigger::ForceRefresh),
            SyncCommand::NetworkChanged { quality } => {
                let was_online = self.coordinator.network().is_online();
                self.coordinator.set_network(quality);
                if !quality.is_online() {
                    self.online_at = None;
                } else if !was_online {
                    self.online_at = Some(Instant::now() + self.coordinator.config().online_debounce());
                }
                self.schedule_periodic();
            }
            SyncCommand::VisibilityChanged { visible: false } => {
                self.visible = false;
                self.periodic_at = None;
                if self.autosave.on_hidden() {
                    self.flush("hidden").await;
                }
            }
            SyncCommand::VisibilityChanged { visible: true } => {
                let was_visible = std::mem::replace(&mut self.visible, true);
                if !was_visible && self.mounted {
                    self.start_sync(SyncTrigger::VisibilityRegained);
                } else {
                    self.schedule_periodic();
                }
            }
            SyncCommand::LocalChange => {
                self.autosave.on_change(self.coordinator.now());
                self.start_sync(SyncTrigger::LocalChange);
            }
            SyncCommand::Teardown => {}
        }
    }

    fn start_sync(&mut self, trigger: SyncTrigger) {
        if self.syncing {
            match trigger {
                SyncTrigger::ForceRefresh => self.queued = Some(trigger),
                SyncTrigger::LocalChange => {
                    self.queued.get_or_insert(trigger);
                }
                _ => debug!("Sync ({}) dropped, another sync is in flight", trigger),
            }
            return;
        }

        self.syncing = true;
        let coordinator = Arc::clone(&self.coordinator);
        let finished = self.finished.clone();
        tokio::spawn(async move {
            let outcome = coordinator.sync(trigger).await;
            if finished.send((trigger, outcome)).await.is_err() {
                debug!("Sync ({}) finished after the orchestrator stopped", trigger);
            }
        });
    }

    fn finish_sync(&mut self, trigger: SyncTrigger, outcome: SyncOutcome) {
        self.syncing = false;
        let now = Instant::now();
        match &outcome {
            SyncOutcome::Synced { .. } => {
                self.retry_at = None;
                self.push_at = None;
            }
            SyncOutcome::Failed { retry_in, .. } => {
                self.retry_at = retry_in.map(|delay| now + delay);
            }
            SyncOutcome::LoadFailed { .. } => self.retry_at = None,
            SyncOutcome::Skipped(SkipReason::BackingOff { remaining }) => {
                self.retry_at.get_or_insert(now + *remaining);
            }
            SyncOutcome::Skipped(SkipReason::CoolingDown { remaining }) if trigger == SyncTrigger::LocalChange => {
                self.push_at.get_or_insert(now + *remaining);
            }
            SyncOutcome::Skipped(_) | SyncOutcome::Superseded => {}
        }
        debug!("Sync ({}) outcome: {:?}", trigger, outcome);
        self.schedule_periodic();

        if let Some(next) = self.queued.take() {
            self.start_sync(next);
        }
    }

    fn schedule_periodic(&mut self) {
        let network = self.coordinator.network();
        self.periodic_at = (self.mounted && self.visible && network.is_online())
            .then(|| Instant::now() + self.coordinator.config().periodic_interval(network));
    }

    async fn flush(&mut self, reason: &'static str) {
        let coordinator = Arc::clone(&self.coordinator);
        match tokio::task::spawn_blocking(move || coordinator.flush_local(reason)).await {
            Ok(_) => self.autosave.mark_saved(self.coordinator.now()),
            Err(e) => warn!("Local save task failed: {}", e),
        }
    }

    /// Converts a coordinator timestamp into a tokio deadline.
    fn instant_at(&self, at: Timestamp) -> Instant {
        Instant::now() + at.saturating_since(self.coordinator.now())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
