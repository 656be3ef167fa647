//! Session and participant model.
//!
//! A [`Session`] is one played game. Its participants keep their insertion
//! order, which the settlement engine relies on for deterministic
//! tie-breaking. The only derived field, `physical_points_on_table`, is
//! private and always recomputed from participant state: values read from
//! storage or the network are never trusted for it.

use crate::{
    ConversionRate, Error, MinorUnits, NetBalance, ParticipantId, Points, Result, SessionId,
    Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Game in progress.
    #[default]
    Active,
    /// Players are cashing out; no new buy-ins expected.
    PendingClose,
    /// Finished and settled. Immutable.
    Completed,
}

impl SessionStatus {
    /// Returns the wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingClose => "pending_close",
            Self::Completed => "completed",
        }
    }

    /// Returns true while chips are still physically on the table.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a participant is still playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    #[default]
    Active,
    /// Left before the end of the game; may have left chips on the table.
    CashedOutEarly,
}

impl ParticipantStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::CashedOutEarly => "cashed_out_early",
        }
    }
}

/// How the current user holds a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAccess {
    /// Created by the current user; full control.
    #[default]
    Owner,
    /// Shared with the current user through an accepted invitation.
    Guest,
}

/// A single buy-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contribution {
    pub amount: MinorUnits,
    pub at: Timestamp,
}

/// A single cash-out event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CashOutRecord {
    /// Currency paid out.
    pub amount: MinorUnits,
    /// Chips handed back for it.
    pub points: Points,
    pub at: Timestamp,
}

/// A player's state within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    /// Chips currently in front of the player.
    pub stack: Points,
    #[serde(default)]
    pub contributions: Vec<Contribution>,
    /// Total currency paid out to the player.
    #[serde(default)]
    pub cash_out: MinorUnits,
    #[serde(default)]
    pub cash_out_log: Vec<CashOutRecord>,
    #[serde(default)]
    pub status: ParticipantStatus,
    /// Chips the player left behind when cashing out early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_left_on_table: Option<Points>,
}

impl Participant {
    /// Creates an active participant with no chips.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(ParticipantId::new(), name)
    }

    /// Creates an active participant with a known id.
    #[must_use]
    pub fn with_id(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            stack: Points::ZERO,
            contributions: Vec::new(),
            cash_out: MinorUnits::ZERO,
            cash_out_log: Vec::new(),
            status: ParticipantStatus::Active,
            points_left_on_table: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ParticipantStatus::Active
    }

    /// Sum of all buy-ins.
    #[must_use]
    pub fn total_contributions(&self) -> MinorUnits {
        self.contributions.iter().map(|c| c.amount).sum()
    }

    /// `cash_out - total_contributions`.
    #[must_use]
    pub fn net_balance(&self) -> MinorUnits {
        self.cash_out - self.total_contributions()
    }

    /// Chips this participant accounts for on the table.
    ///
    /// The live stack while active; the chips left behind once cashed out early.
    #[must_use]
    pub fn points_on_table(&self) -> Points {
        match self.status {
            ParticipantStatus::Active => self.stack,
            ParticipantStatus::CashedOutEarly => self.points_left_on_table.unwrap_or(Points::ZERO),
        }
    }
}

/// One played game instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub started_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<Timestamp>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub rate: ConversionRate,
    /// Standard buy-in for this game.
    #[serde(default)]
    pub standard_buy_in: MinorUnits,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    physical_points_on_table: Points,
    #[serde(default)]
    pub access: SessionAccess,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    /// Last modification time, local or remote.
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl Session {
    /// Creates a new active session owned by the current user.
    #[must_use]
    pub fn new(name: impl Into<String>, rate: ConversionRate, standard_buy_in: MinorUnits) -> Self {
        let mut session = Self::with_id(SessionId::new(), name, Timestamp::now());
        session.rate = rate;
        session.standard_buy_in = standard_buy_in.clamp_non_negative();
        session
    }

    /// Creates an empty active session with a known id and start time.
    #[must_use]
    pub fn with_id(id: SessionId, name: impl Into<String>, started_at: Timestamp) -> Self {
        Self {
            id,
            name: name.into(),
            started_at,
            ended_at: None,
            status: SessionStatus::Active,
            rate: ConversionRate::default(),
            standard_buy_in: MinorUnits::ZERO,
            participants: Vec::new(),
            physical_points_on_table: Points::ZERO,
            access: SessionAccess::Owner,
            owner_id: None,
            updated_at: started_at,
        }
    }

    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.access == SessionAccess::Owner
    }

    /// The derived chip count on the table, as last recomputed.
    #[must_use]
    pub fn physical_points_on_table(&self) -> Points {
        self.physical_points_on_table
    }

    /// The chip count on the table implied by participant state.
    ///
    /// Completed sessions have no chips on the table.
    #[must_use]
    pub fn expected_physical_points(&self) -> Points {
        if !self.status.is_open() {
            return Points::ZERO;
        }
        self.participants.iter().map(Participant::points_on_table).sum()
    }

    /// Recomputes every derived field from participant state.
    ///
    /// Returns true if the stored value was stale.
    pub fn recompute_derived(&mut self) -> bool {
        let expected = self.expected_physical_points();
        let stale = expected != self.physical_points_on_table;
        self.physical_points_on_table = expected;
        stale
    }

    /// Looks up a participant by id.
    #[must_use]
    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    /// Appends a new participant and returns its id.
    pub fn add_participant(&mut self, name: impl Into<String>, at: Timestamp) -> Result<ParticipantId> {
        self.ensure_mutable()?;
        let participant = Participant::new(name);
        let id = participant.id;
        self.participants.push(participant);
        self.touch(at);
        Ok(id)
    }

    /// Records a buy-in of `amount` for `points` chips.
    pub fn buy_in(
        &mut self,
        participant_id: ParticipantId,
        amount: MinorUnits,
        points: Points,
        at: Timestamp,
    ) -> Result<()> {
        self.ensure_mutable()?;
        if amount.is_negative() {
            return Err(Error::InvalidAmount(format!("buy-in amount {amount} is negative")));
        }
        if points.is_negative() {
            return Err(Error::InvalidAmount(format!("buy-in points {points} are negative")));
        }
        let participant = self.active_participant_mut(participant_id)?;
        participant.contributions.push(Contribution { amount, at });
        participant.stack += points;
        self.touch(at);
        Ok(())
    }

    /// Records a buy-in at the session's standard amount and rate.
    pub fn standard_buy_in(&mut self, participant_id: ParticipantId, at: Timestamp) -> Result<()> {
        let amount = self.standard_buy_in;
        let points = self.rate.to_points(amount);
        self.buy_in(participant_id, amount, points, at)
    }

    /// Pays out `amount` to a participant in exchange for `points` chips.
    ///
    /// The stack never goes below zero.
    pub fn cash_out(
        &mut self,
        participant_id: ParticipantId,
        amount: MinorUnits,
        points: Points,
        at: Timestamp,
    ) -> Result<()> {
        self.ensure_mutable()?;
        if amount.is_negative() {
            return Err(Error::InvalidAmount(format!("cash-out amount {amount} is negative")));
        }
        if points.is_negative() {
            return Err(Error::InvalidAmount(format!("cash-out points {points} are negative")));
        }
        let participant = self.participant_mut(participant_id)?;
        participant.cash_out += amount;
        participant.stack = participant.stack.saturating_sub_to_zero(points);
        participant.cash_out_log.push(CashOutRecord { amount, points, at });
        self.touch(at);
        Ok(())
    }

    /// Cashes a participant out at the session rate for their whole stack.
    pub fn cash_out_stack(&mut self, participant_id: ParticipantId, at: Timestamp) -> Result<MinorUnits> {
        let stack = self
            .participant(participant_id)
            .map(|p| p.stack)
            .ok_or(Error::UnknownParticipant(participant_id))?;
        let amount = self.rate.to_minor_units(stack);
        self.cash_out(participant_id, amount, stack, at)?;
        Ok(amount)
    }

    /// Marks a participant as having left early, leaving `points_left` chips on the table.
    pub fn leave_early(
        &mut self,
        participant_id: ParticipantId,
        points_left: Points,
        at: Timestamp,
    ) -> Result<()> {
        self.ensure_mutable()?;
        if points_left.is_negative() {
            return Err(Error::InvalidAmount(format!(
                "points left on table {points_left} are negative"
            )));
        }
        let participant = self.active_participant_mut(participant_id)?;
        participant.status = ParticipantStatus::CashedOutEarly;
        participant.points_left_on_table = Some(points_left);
        self.touch(at);
        Ok(())
    }

    /// Active -> PendingClose.
    pub fn begin_close(&mut self, at: Timestamp) -> Result<()> {
        if self.status != SessionStatus::Active {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: SessionStatus::PendingClose,
            });
        }
        self.status = SessionStatus::PendingClose;
        self.touch(at);
        Ok(())
    }

    /// Active | PendingClose -> Completed. Stamps `ended_at`.
    pub fn complete(&mut self, at: Timestamp) -> Result<()> {
        if self.status == SessionStatus::Completed {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: SessionStatus::Completed,
            });
        }
        self.status = SessionStatus::Completed;
        self.ended_at = Some(at);
        self.touch(at);
        Ok(())
    }

    /// Sum of every participant's buy-ins.
    #[must_use]
    pub fn total_contributions(&self) -> MinorUnits {
        self.participants.iter().map(Participant::total_contributions).sum()
    }

    /// Sum of every participant's cash-outs.
    #[must_use]
    pub fn total_cash_out(&self) -> MinorUnits {
        self.participants.iter().map(|p| p.cash_out).sum()
    }

    /// Net balances in participant order.
    #[must_use]
    pub fn net_balances(&self) -> Vec<NetBalance> {
        self.participants
            .iter()
            .map(|p| NetBalance::new(p.id, p.net_balance()))
            .collect()
    }

    /// Sum of all net balances. Zero for a correctly booked session.
    #[must_use]
    pub fn balance_residual(&self) -> MinorUnits {
        self.participants.iter().map(Participant::net_balance).sum()
    }

    /// Advances `updated_at` (never moves it backwards) and recomputes derived fields.
    pub fn touch(&mut self, at: Timestamp) {
        self.updated_at = self.updated_at.max(at);
        self.recompute_derived();
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.status == SessionStatus::Completed {
            return Err(Error::SessionCompleted(self.id));
        }
        Ok(())
    }

    fn participant_mut(&mut self, id: ParticipantId) -> Result<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(Error::UnknownParticipant(id))
    }

    fn active_participant_mut(&mut self, id: ParticipantId) -> Result<&mut Participant> {
        let participant = self.participant_mut(id)?;
        if !participant.is_active() {
            return Err(Error::ParticipantInactive(id));
        }
        Ok(participant)
    }
}
