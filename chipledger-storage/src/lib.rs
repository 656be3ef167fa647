//! Local persistence for ChipLedger sessions.
//!
//! The store keeps one snapshot of the user's sessions under a namespaced
//! key, plus a short rotation of backups. Every session read back, from any
//! slot and any layout version, is passed through a repair pass before it
//! reaches the caller, so callers can rely on the model's invariants.
//!
//! - [`KeyValueStore`]: flat string backend (memory or file directory)
//! - [`LocalStore`]: save/load with backups and migration
//! - [`repair_session`]: per-record validator, also used for network payloads

pub mod envelope;
pub mod error;
pub mod kv;
pub mod local_store;
pub mod repair;

pub use envelope::{STORE_VERSION, Snapshot, decode, encode};
pub use error::{StorageError, StorageResult, ValidationError};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use local_store::{BACKUP_SLOTS, LoadReport, LoadSource, LocalStore, SaveReport, StoreConfig};
pub use repair::{
    DERIVED_TOLERANCE, RepairNote, RepairedSession, normalize_session, repair_batch,
    repair_session,
};
