//! Versioned snapshot envelope and migration from older layouts.

use crate::error::{StorageError, StorageResult, ValidationError};
use crate::repair::{RepairedSession, repair_batch};
use chipledger_types::{Session, Timestamp};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Layout version written by this build.
///
/// - 1: bare JSON array of sessions, camelCase fields
/// - 2: `{version, timestamp, data}` envelope
/// - 3: `{version, timestamp, sessions}` envelope, snake_case fields
pub const STORE_VERSION: u32 = 3;

#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    timestamp: Timestamp,
    sessions: &'a [Session],
}

/// Serializes `sessions` into a current-version envelope.
pub fn encode(sessions: &[Session], at: Timestamp) -> StorageResult<String> {
    let envelope = Envelope {
        version: STORE_VERSION,
        timestamp: at,
        sessions,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// A decoded snapshot, already passed through the repair pass.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Version tag found in the data; `None` for the unversioned legacy array.
    pub version: Option<u32>,
    /// Write time recorded in the envelope, if any.
    pub timestamp: Option<Timestamp>,
    pub sessions: Vec<RepairedSession>,
    /// Records that could not be salvaged, by position.
    pub skipped: Vec<(usize, ValidationError)>,
}

impl Snapshot {
    /// True when the data was written by a different layout version.
    #[must_use]
    pub fn is_migrated(&self) -> bool {
        self.version != Some(STORE_VERSION)
    }

    /// True when records existed but none could be salvaged.
    #[must_use]
    pub fn is_unusable(&self) -> bool {
        self.sessions.is_empty() && !self.skipped.is_empty()
    }
}

/// Decodes a stored snapshot of any known layout.
///
/// Fails only when the text is not JSON or no session list can be located.
/// Individual sessions that cannot be salvaged are reported in
/// [`Snapshot::skipped`] rather than failing the whole snapshot.
pub fn decode(key: &str, raw: &str) -> StorageResult<Snapshot> {
    let value: Value = serde_json::from_str(raw)?;
    let (version, timestamp, records) = locate_sessions(&value).ok_or_else(|| StorageError::Corrupted {
        key: key.to_string(),
        reason: "no session list found".to_string(),
    })?;

    match version {
        Some(v) if v > STORE_VERSION => {
            warn!("Snapshot {} has newer version {}; attempting best-effort read", key, v);
        }
        Some(v) if v < STORE_VERSION => {
            debug!("Migrating snapshot {} from version {}", key, v);
        }
        None => debug!("Migrating unversioned snapshot {}", key),
        Some(_) => {}
    }

    let (sessions, skipped) = repair_batch(records);
    for (index, error) in &skipped {
        warn!("Discarded session record {} in {}: {}", index, key, error);
    }

    Ok(Snapshot {
        version,
        timestamp,
        sessions,
        skipped,
    })
}

/// Finds the session array in any known layout.
fn locate_sessions(value: &Value) -> Option<(Option<u32>, Option<Timestamp>, &[Value])> {
    match value {
        Value::Array(records) => Some((None, None, records.as_slice())),
        Value::Object(obj) => {
            let version = obj.get("version").and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                    .and_then(|v| u32::try_from(v).ok())
            });
            let timestamp = obj
                .get("timestamp")
                .and_then(Value::as_u64)
                .map(Timestamp::from_millis);
            let records = match (obj.get("sessions"), obj.get("data")) {
                (Some(Value::Array(records)), _) | (_, Some(Value::Array(records))) => records,
                (_, Some(Value::Object(data))) => match data.get("sessions") {
                    Some(Value::Array(records)) => records,
                    _ => return None,
                },
                _ => return None,
            };
            Some((version, timestamp, records.as_slice()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn locates_every_known_layout() {
        let bare = json!([]);
        let v2 = json!({"version": 2, "timestamp": 5, "data": []});
        let nested = json!({"version": 2, "data": {"sessions": []}});
        let v3 = json!({"version": 3, "sessions": []});
        assert_eq!(locate_sessions(&bare).map(|l| l.0), Some(None));
        assert_eq!(locate_sessions(&v2).map(|l| (l.0, l.1)), Some((Some(2), Some(Timestamp::from_millis(5)))));
        assert!(locate_sessions(&nested).is_some());
        assert_eq!(locate_sessions(&v3).map(|l| l.0), Some(Some(3)));
    }

    #[test]
    fn rejects_shapes_without_sessions() {
        assert!(locate_sessions(&json!({"version": 3})).is_none());
        assert!(locate_sessions(&json!("sessions")).is_none());
        assert!(locate_sessions(&json!({"sessions": {}})).is_none());
    }

    #[test]
    fn encode_tags_current_version() {
        let raw = encode(&[], Timestamp::from_millis(9)).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], STORE_VERSION);
        assert_eq!(value["timestamp"], 9);
    }
}
