//! Per-session validation and repair.
//!
//! Every session that enters the process from disk or from the network is
//! passed through [`repair_session`]: missing fields get defaults, negative
//! amounts are clamped to zero, and the derived chip count is recomputed
//! from participant state. The reader accepts the current snake_case shape
//! as well as the camelCase shape older clients wrote.
//!
//! Only a record without a usable session id is rejected. Everything else is
//! salvaged, and each fix is reported as a [`RepairNote`].

use crate::error::ValidationError;
use chipledger_types::{
    CashOutRecord, Contribution, ConversionRate, MinorUnits, Participant, ParticipantId,
    ParticipantStatus, Points, Session, SessionAccess, SessionId, SessionStatus, Timestamp,
    UserId,
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Allowed drift between a stored and a recomputed chip count before a
/// mismatch is reported.
pub const DERIVED_TOLERANCE: Points = Points::ZERO;

/// A single fix applied while repairing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairNote {
    /// Field was missing or unreadable and got its default.
    Defaulted { field: String },
    /// Negative value clamped to zero.
    Clamped { field: String, value: i64 },
    /// Unreadable list entry discarded.
    DroppedEntry { field: String },
    /// Participant had no usable id; a deterministic one was derived.
    DerivedParticipantId { index: usize },
    /// Stored chip count disagreed with participant state; recomputed value kept.
    DerivedMismatch { stored: Points, recomputed: Points },
}

impl fmt::Display for RepairNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defaulted { field } => write!(f, "{field}: defaulted"),
            Self::Clamped { field, value } => write!(f, "{field}: clamped {value} to 0"),
            Self::DroppedEntry { field } => write!(f, "{field}: dropped unreadable entry"),
            Self::DerivedParticipantId { index } => {
                write!(f, "participants[{index}].id: derived")
            }
            Self::DerivedMismatch { stored, recomputed } => write!(
                f,
                "physical_points_on_table: stored {stored}, recomputed {recomputed}"
            ),
        }
    }
}

/// A repaired session and the fixes it needed.
#[derive(Debug, Clone)]
pub struct RepairedSession {
    pub session: Session,
    pub notes: Vec<RepairNote>,
}

impl RepairedSession {
    /// True when nothing had to be fixed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.notes.is_empty()
    }

    /// True when the stored derived value disagreed with participant state.
    #[must_use]
    pub fn had_derived_mismatch(&self) -> bool {
        self.notes
            .iter()
            .any(|n| matches!(n, RepairNote::DerivedMismatch { .. }))
    }
}

/// Validates and repairs one raw session record.
pub fn repair_session(value: &Value) -> Result<RepairedSession, ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;
    let id = match lookup(obj, &["id", "session_id", "sessionId"]) {
        None => return Err(ValidationError::MissingId),
        Some(Value::String(s)) => {
            SessionId::parse(s.trim()).map_err(|_| ValidationError::InvalidId(s.clone()))?
        }
        Some(other) => return Err(ValidationError::InvalidId(other.to_string())),
    };

    let mut r = Repairer::default();
    let name = r.string(obj, &["name", "title"], "name", "Untitled game");
    let started_at = r.timestamp(obj, &["started_at", "startedAt", "start_time", "startTime"], "started_at");

    let mut session = Session::with_id(id, name, started_at);
    session.ended_at = optional_timestamp(obj, &["ended_at", "endedAt", "end_time", "endTime"]);
    session.status = r.session_status(obj);
    session.rate = r.rate(obj);
    session.standard_buy_in = MinorUnits::new(r.optional_non_negative(
        obj,
        &["standard_buy_in", "standardBuyIn", "buy_in_amount", "buyInAmount"],
        "standard_buy_in",
    ));
    session.access = access(obj);
    session.owner_id = lookup(obj, &["owner_id", "ownerId", "user_id", "userId"])
        .and_then(Value::as_str)
        .map(UserId::new);
    session.updated_at =
        optional_timestamp(obj, &["updated_at", "updatedAt"]).unwrap_or(started_at);

    match lookup(obj, &["participants", "players"]) {
        Some(Value::Array(entries)) => {
            let mut seen = HashSet::new();
            for (index, entry) in entries.iter().enumerate() {
                match r.participant(id, index, entry, &mut seen) {
                    Some(participant) => session.participants.push(participant),
                    None => r.note(RepairNote::DroppedEntry {
                        field: format!("participants[{index}]"),
                    }),
                }
            }
        }
        Some(_) => r.defaulted("participants"),
        None => {}
    }

    let stored = lookup(obj, &["physical_points_on_table", "physicalPointsOnTable"]).and_then(as_i64);
    session.recompute_derived();
    if let Some(stored) = stored {
        r.check_derived(Points::new(stored), session.physical_points_on_table());
    }

    Ok(RepairedSession {
        session,
        notes: r.notes,
    })
}

/// Normalizes an in-memory session before it is written.
///
/// Clamps negative amounts, replaces an unusable rate, and recomputes the
/// derived chip count.
#[must_use]
pub fn normalize_session(session: &Session) -> RepairedSession {
    let mut r = Repairer::default();
    let mut session = session.clone();

    session.standard_buy_in = r.clamp_units(session.standard_buy_in, "standard_buy_in");
    if !session.rate.is_valid() {
        r.defaulted("rate");
        session.rate = ConversionRate::default();
    }
    for (index, participant) in session.participants.iter_mut().enumerate() {
        let path = format!("participants[{index}]");
        participant.stack = r.clamp_points(participant.stack, &format!("{path}.stack"));
        participant.cash_out = r.clamp_units(participant.cash_out, &format!("{path}.cash_out"));
        for (i, contribution) in participant.contributions.iter_mut().enumerate() {
            contribution.amount =
                r.clamp_units(contribution.amount, &format!("{path}.contributions[{i}].amount"));
        }
        for (i, record) in participant.cash_out_log.iter_mut().enumerate() {
            record.amount = r.clamp_units(record.amount, &format!("{path}.cash_out_log[{i}].amount"));
            record.points = r.clamp_points(record.points, &format!("{path}.cash_out_log[{i}].points"));
        }
        if let Some(points) = participant.points_left_on_table {
            participant.points_left_on_table =
                Some(r.clamp_points(points, &format!("{path}.points_left_on_table")));
        }
    }

    let stored = session.physical_points_on_table();
    session.recompute_derived();
    r.check_derived(stored, session.physical_points_on_table());

    RepairedSession {
        session,
        notes: r.notes,
    }
}

/// Repairs a batch, discarding unrecognizable records one by one.
///
/// Returns the repaired sessions (in input order, first occurrence of each
/// id wins) and the rejected records with their position.
pub fn repair_batch(values: &[Value]) -> (Vec<RepairedSession>, Vec<(usize, ValidationError)>) {
    let mut repaired = Vec::with_capacity(values.len());
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();
    for (index, value) in values.iter().enumerate() {
        match repair_session(value) {
            Ok(session) if seen.insert(session.session.id) => repaired.push(session),
            Ok(session) => rejected.push((
                index,
                ValidationError::InvalidId(format!("duplicate id {}", session.session.id)),
            )),
            Err(e) => rejected.push((index, e)),
        }
    }
    (repaired, rejected)
}

/// Deterministic participant id for legacy records that stored none.
fn derive_participant_id(session_id: SessionId, index: usize) -> ParticipantId {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_uuid().as_bytes());
    hasher.update((index as u64).to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    ParticipantId::from_derived_bytes(bytes)
}

#[derive(Default)]
struct Repairer {
    notes: Vec<RepairNote>,
}

impl Repairer {
    fn note(&mut self, note: RepairNote) {
        self.notes.push(note);
    }

    fn defaulted(&mut self, field: &str) {
        self.note(RepairNote::Defaulted {
            field: field.to_string(),
        });
    }

    fn string(&mut self, obj: &Map<String, Value>, names: &[&str], field: &str, default: &str) -> String {
        match lookup(obj, names).and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => {
                self.defaulted(field);
                default.to_string()
            }
        }
    }

    fn timestamp(&mut self, obj: &Map<String, Value>, names: &[&str], field: &str) -> Timestamp {
        match optional_timestamp(obj, names) {
            Some(ts) => ts,
            None => {
                self.defaulted(field);
                Timestamp::EPOCH
            }
        }
    }

    /// Required non-negative integer: missing or unreadable is noted.
    fn non_negative(&mut self, obj: &Map<String, Value>, names: &[&str], field: &str) -> i64 {
        match lookup(obj, names).and_then(as_i64) {
            Some(v) => self.clamp(v, field),
            None => {
                self.defaulted(field);
                0
            }
        }
    }

    /// Optional non-negative integer: missing is silent, unreadable is noted.
    fn optional_non_negative(&mut self, obj: &Map<String, Value>, names: &[&str], field: &str) -> i64 {
        match lookup(obj, names) {
            None => 0,
            Some(value) => match as_i64(value) {
                Some(v) => self.clamp(v, field),
                None => {
                    self.defaulted(field);
                    0
                }
            },
        }
    }

    fn clamp(&mut self, value: i64, field: &str) -> i64 {
        if value < 0 {
            self.note(RepairNote::Clamped {
                field: field.to_string(),
                value,
            });
            0
        } else {
            value
        }
    }

    fn clamp_units(&mut self, value: MinorUnits, field: &str) -> MinorUnits {
        MinorUnits::new(self.clamp(value.get(), field))
    }

    fn clamp_points(&mut self, value: Points, field: &str) -> Points {
        Points::new(self.clamp(value.get(), field))
    }

    fn check_derived(&mut self, stored: Points, recomputed: Points) {
        if stored.get().abs_diff(recomputed.get()) > DERIVED_TOLERANCE.get().unsigned_abs() {
            self.note(RepairNote::DerivedMismatch { stored, recomputed });
        }
    }

    fn session_status(&mut self, obj: &Map<String, Value>) -> SessionStatus {
        let Some(raw) = lookup(obj, &["status"]) else {
            self.defaulted("status");
            return SessionStatus::Active;
        };
        match raw.as_str().map(squash).as_deref() {
            Some("active" | "open" | "inprogress") => SessionStatus::Active,
            Some("pendingclose" | "closing") => SessionStatus::PendingClose,
            Some("completed" | "complete" | "closed" | "finished") => SessionStatus::Completed,
            _ => {
                self.defaulted("status");
                SessionStatus::Active
            }
        }
    }

    fn rate(&mut self, obj: &Map<String, Value>) -> ConversionRate {
        if let Some(Value::Object(rate)) = lookup(obj, &["rate"]) {
            let minor = lookup(rate, &["minor_units", "minorUnits"]).and_then(as_i64);
            let per = lookup(rate, &["per_points", "perPoints"]).and_then(as_i64);
            if let (Some(minor), Some(per)) = (minor, per) {
                if let Ok(rate) = ConversionRate::new(minor, per) {
                    return rate;
                }
            }
            self.defaulted("rate");
            return ConversionRate::default();
        }
        if let Some(raw) = lookup(obj, &["minor_units_per_point", "minorUnitsPerPoint"]) {
            if let Some(rate) = as_i64(raw).and_then(|m| ConversionRate::new(m, 1).ok()) {
                return rate;
            }
            self.defaulted("rate");
        } else if lookup(obj, &["rate"]).is_some() {
            self.defaulted("rate");
        }
        ConversionRate::default()
    }

    fn participant(
        &mut self,
        session_id: SessionId,
        index: usize,
        value: &Value,
        seen: &mut HashSet<ParticipantId>,
    ) -> Option<Participant> {
        let obj = value.as_object()?;
        let path = format!("participants[{index}]");

        let parsed = lookup(obj, &["id", "participant_id", "participantId"])
            .and_then(Value::as_str)
            .and_then(|s| ParticipantId::parse(s.trim()).ok());
        let id = match parsed {
            Some(id) if seen.insert(id) => id,
            _ => {
                let id = derive_participant_id(session_id, index);
                seen.insert(id);
                self.note(RepairNote::DerivedParticipantId { index });
                id
            }
        };

        let default_name = format!("Player {}", index + 1);
        let name = self.string(obj, &["name", "display_name", "displayName"], &format!("{path}.name"), &default_name);
        let mut participant = Participant::with_id(id, name);
        participant.stack = Points::new(self.non_negative(
            obj,
            &["stack", "points", "current_stack", "currentStack"],
            &format!("{path}.stack"),
        ));
        participant.cash_out = MinorUnits::new(self.optional_non_negative(
            obj,
            &["cash_out", "cashOut", "cash_out_amount", "cashOutAmount"],
            &format!("{path}.cash_out"),
        ));
        participant.contributions = self.contributions(obj, &path);
        participant.cash_out_log = self.cash_out_log(obj, &path);
        participant.status = self.participant_status(obj, &path);
        if participant.status == ParticipantStatus::CashedOutEarly {
            participant.points_left_on_table = Some(Points::new(self.non_negative(
                obj,
                &["points_left_on_table", "pointsLeftOnTable"],
                &format!("{path}.points_left_on_table"),
            )));
        }
        Some(participant)
    }

    fn contributions(&mut self, obj: &Map<String, Value>, path: &str) -> Vec<Contribution> {
        let Some(Value::Array(entries)) = lookup(obj, &["contributions", "buy_ins", "buyIns"]) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let field = format!("{path}.contributions[{i}]");
            let (amount, at) = match entry {
                Value::Object(c) => (
                    lookup(c, &["amount"]).and_then(as_i64),
                    optional_timestamp(c, &["at", "timestamp", "time"]),
                ),
                other => (as_i64(other), None),
            };
            match amount {
                Some(amount) => out.push(Contribution {
                    amount: MinorUnits::new(self.clamp(amount, &format!("{field}.amount"))),
                    at: at.unwrap_or(Timestamp::EPOCH),
                }),
                None => self.note(RepairNote::DroppedEntry { field }),
            }
        }
        out
    }

    fn cash_out_log(&mut self, obj: &Map<String, Value>, path: &str) -> Vec<CashOutRecord> {
        let Some(Value::Array(entries)) = lookup(obj, &["cash_out_log", "cashOutLog", "cash_outs", "cashOuts"]) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let field = format!("{path}.cash_out_log[{i}]");
            let Some(record) = entry.as_object() else {
                self.note(RepairNote::DroppedEntry { field });
                continue;
            };
            let Some(amount) = lookup(record, &["amount"]).and_then(as_i64) else {
                self.note(RepairNote::DroppedEntry { field });
                continue;
            };
            let points = lookup(record, &["points"]).and_then(as_i64).unwrap_or(0);
            out.push(CashOutRecord {
                amount: MinorUnits::new(self.clamp(amount, &format!("{field}.amount"))),
                points: Points::new(self.clamp(points, &format!("{field}.points"))),
                at: optional_timestamp(record, &["at", "timestamp", "time"]).unwrap_or(Timestamp::EPOCH),
            });
        }
        out
    }

    fn participant_status(&mut self, obj: &Map<String, Value>, path: &str) -> ParticipantStatus {
        match lookup(obj, &["status"]) {
            None => match lookup(obj, &["cashed_out_early", "cashedOutEarly"]).and_then(Value::as_bool) {
                Some(true) => ParticipantStatus::CashedOutEarly,
                _ => ParticipantStatus::Active,
            },
            Some(raw) => match raw.as_str().map(squash).as_deref() {
                Some("active" | "playing") => ParticipantStatus::Active,
                Some("cashedoutearly" | "cashedout" | "left") => ParticipantStatus::CashedOutEarly,
                _ => {
                    self.defaulted(&format!("{path}.status"));
                    ParticipantStatus::Active
                }
            },
        }
    }
}

fn access(obj: &Map<String, Value>) -> SessionAccess {
    if let Some(raw) = lookup(obj, &["access"]).and_then(Value::as_str) {
        return match squash(raw).as_str() {
            "guest" | "shared" | "invited" => SessionAccess::Guest,
            _ => SessionAccess::Owner,
        };
    }
    match lookup(obj, &["is_shared", "isShared", "shared"]).and_then(Value::as_bool) {
        Some(true) => SessionAccess::Guest,
        _ => SessionAccess::Owner,
    }
}

/// First non-null value among `names`.
fn lookup<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|value| !value.is_null())
}

fn optional_timestamp(obj: &Map<String, Value>, names: &[&str]) -> Option<Timestamp> {
    lookup(obj, names)
        .and_then(as_i64)
        .filter(|ms| *ms >= 0)
        .map(|ms| Timestamp::from_millis(ms as u64))
}

/// Reads an integer from a JSON number (rounding legacy fractional values)
/// or a numeric string.
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Lowercases and strips `_`/`-` so `pending_close`, `pendingClose`, and
/// `pending-close` compare equal.
fn squash(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}
