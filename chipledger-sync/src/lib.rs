//! Sync layer for ChipLedger.
//!
//! Keeps the in-memory session list, the local snapshot and the remote
//! store in step.
//!
//! # Architecture
//!
//! - **Fingerprint**: a content hash of the session list that decides
//!   whether a save or a push has anything to do
//! - **Machine**: cooldown, backoff and stall bookkeeping for sync attempts
//! - **Remote**: the [`RemoteStore`] trait, an in-memory mock and a JSON
//!   HTTP client
//! - **Coordinator**: owns the session list, queues writes, runs sync cycles
//!   and settles completed games
//! - **Orchestrator**: a task that turns app signals and timers into
//!   coordinator calls, including debounced auto-save
//!
//! # Example
//!
//! ```
//! use chipledger_storage::MemoryKeyValueStore;
//! use chipledger_sync::{SyncConfig, SyncCoordinator, remote::mock::MemoryRemoteStore};
//! use chipledger_types::UserId;
//! use std::sync::Arc;
//!
//! let coordinator = SyncCoordinator::new(
//!     Arc::new(MemoryRemoteStore::new()),
//!     Arc::new(MemoryKeyValueStore::new()),
//!     SyncConfig::default(),
//! );
//! coordinator.set_user(Some(UserId::new("ana")));
//! assert!(coordinator.sessions().is_empty());
//! ```

pub mod autosave;
pub mod clock;
pub mod config;
mod coordinator;
mod error;
pub mod fingerprint;
pub mod http;
pub mod machine;
mod orchestrator;
pub mod remote;

pub use autosave::AutoSaveScheduler;
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::{NetworkQuality, SyncConfig};
pub use coordinator::{
    MessageKind, PendingWrite, SessionCompletion, SessionStats, StatusMessage, SyncCoordinator,
    SyncEvent, SyncOutcome, SyncStatus,
};
pub use error::{SyncError, SyncResult};
pub use fingerprint::{ChangeDetector, Consumer, Fingerprint, fingerprint};
pub use http::{HttpRemoteConfig, HttpRemoteStore};
pub use machine::{SkipReason, SyncMachine, SyncPhase, SyncTrigger};
pub use orchestrator::{OrchestratorHandle, SyncCommand, spawn};
pub use remote::{Grant, GrantStatus, RemoteSession, RemoteStore};
