//! Net balances, the input of the settlement engine.

use crate::{MinorUnits, ParticipantId};
use serde::{Deserialize, Serialize};

/// A participant's final profit (positive) or loss (negative).
///
/// `amount = cash_out - sum(contributions)`, in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetBalance {
    pub participant_id: ParticipantId,
    pub amount: MinorUnits,
}

impl NetBalance {
    #[must_use]
    pub const fn new(participant_id: ParticipantId, amount: MinorUnits) -> Self {
        Self {
            participant_id,
            amount,
        }
    }
}
