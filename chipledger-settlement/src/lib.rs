//! Settlement engine for ChipLedger.
//!
//! Turns per-participant net balances into a short list of payments that
//! zeroes every balance. The engine is a pure function: no storage, no
//! network, no clock.
//!
//! # Algorithm
//!
//! Greedy largest-debtor / largest-creditor matching:
//!
//! 1. Split participants into creditors (balance > 0) and debtors
//!    (balance < 0, tracked by absolute value).
//! 2. Repeatedly pair the largest remaining creditor with the largest
//!    remaining debtor (ties go to whoever came first in the input), move
//!    `min(credit, debt)` from debtor to creditor, and drop whoever reaches
//!    zero.
//! 3. Stop when either side is empty.
//!
//! The resulting payments are reported grouped by payer in input order, then
//! by payee in input order, so the list reads the same way the table was
//! seated. Each (payer, payee) pair appears at most once.
//!
//! Every step retires at least one party, so a balanced input of `n`
//! non-zero participants yields at most `n - 1` transfers.
//!
//! # Example
//!
//! ```
//! use chipledger_settlement::settle;
//! use chipledger_types::{MinorUnits, NetBalance, ParticipantId};
//!
//! let a = ParticipantId::new();
//! let b = ParticipantId::new();
//! let settlement = settle(&[
//!     NetBalance::new(a, MinorUnits::new(1_500)),
//!     NetBalance::new(b, MinorUnits::new(-1_500)),
//! ]);
//! assert_eq!(settlement.transfers.len(), 1);
//! assert_eq!(settlement.transfers[0].from, b);
//! assert!(settlement.warning.is_none());
//! ```

use chipledger_types::{MinorUnits, NetBalance, ParticipantId, Session};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default tolerance for the balance check, in minor units.
///
/// All balance arithmetic is integer, so a correctly booked game sums to
/// exactly zero.
pub const DEFAULT_TOLERANCE: MinorUnits = MinorUnits::ZERO;

/// A single payment from a debtor to a creditor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transfer {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub amount: MinorUnits,
}

/// Reported when the input balances do not sum to zero within tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImbalanceWarning {
    /// Sum of all input balances. Positive when creditors are owed more than
    /// debtors owe.
    pub residual: MinorUnits,
}

/// Output of the settlement engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Payments ordered by payer, then payee, in input order.
    pub transfers: Vec<Transfer>,
    /// Present when the input was not balanced; the transfers are then best-effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<ImbalanceWarning>,
}

impl Settlement {
    /// Returns true when the input was balanced.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.warning.is_none()
    }

    /// Total amount moved by all transfers.
    #[must_use]
    pub fn total_transferred(&self) -> MinorUnits {
        self.transfers.iter().map(|t| t.amount).sum()
    }

    /// Applies the transfers to `balances` and returns what is left per participant.
    ///
    /// A paying debtor moves towards zero from below, a paid creditor from
    /// above. For a balanced input every returned amount is zero.
    #[must_use]
    pub fn apply(&self, balances: &[NetBalance]) -> Vec<NetBalance> {
        let mut remaining: HashMap<ParticipantId, MinorUnits> =
            balances.iter().map(|b| (b.participant_id, b.amount)).collect();
        for transfer in &self.transfers {
            if let Some(from) = remaining.get_mut(&transfer.from) {
                *from += transfer.amount;
            }
            if let Some(to) = remaining.get_mut(&transfer.to) {
                *to -= transfer.amount;
            }
        }
        balances
            .iter()
            .map(|b| {
                let amount = remaining.get(&b.participant_id).copied().unwrap_or(b.amount);
                NetBalance::new(b.participant_id, amount)
            })
            .collect()
    }
}

#[derive(Debug)]
struct Party {
    index: usize,
    id: ParticipantId,
    remaining: i64,
}

/// Settles `balances` with [`DEFAULT_TOLERANCE`].
#[must_use]
pub fn settle(balances: &[NetBalance]) -> Settlement {
    settle_with_tolerance(balances, DEFAULT_TOLERANCE)
}

/// Settles `balances`, tolerating an absolute residual up to `tolerance`.
///
/// Unbalanced input still produces a best-effort transfer list using the
/// same algorithm, plus an [`ImbalanceWarning`] carrying the residual.
#[must_use]
pub fn settle_with_tolerance(balances: &[NetBalance], tolerance: MinorUnits) -> Settlement {
    let residual: MinorUnits = balances.iter().map(|b| b.amount).sum();
    let warning = if residual.abs() > tolerance.abs() {
        warn!(
            "Settlement input does not balance: residual {} across {} participants",
            residual,
            balances.len()
        );
        Some(ImbalanceWarning { residual })
    } else {
        None
    };

    let mut creditors = Vec::new();
    let mut debtors = Vec::new();
    for (index, balance) in balances.iter().enumerate() {
        let amount = balance.amount.get();
        let party = Party {
            index,
            id: balance.participant_id,
            remaining: amount.saturating_abs(),
        };
        if amount > 0 {
            creditors.push(party);
        } else if amount < 0 {
            debtors.push(party);
        }
    }

    let mut matched = Vec::with_capacity(creditors.len() + debtors.len());
    while let (Some(ci), Some(di)) = (largest(&creditors), largest(&debtors)) {
        let amount = creditors[ci].remaining.min(debtors[di].remaining);
        matched.push((
            (debtors[di].index, creditors[ci].index),
            Transfer {
                from: debtors[di].id,
                to: creditors[ci].id,
                amount: MinorUnits::new(amount),
            },
        ));
        creditors[ci].remaining -= amount;
        debtors[di].remaining -= amount;
        if creditors[ci].remaining == 0 {
            creditors.remove(ci);
        }
        if debtors[di].remaining == 0 {
            debtors.remove(di);
        }
    }

    matched.sort_by_key(|(order, _)| *order);
    let transfers: Vec<Transfer> = matched.into_iter().map(|(_, t)| t).collect();

    debug!(
        "Settled {} balances with {} transfers",
        balances.len(),
        transfers.len()
    );

    Settlement { transfers, warning }
}

/// Settles the net balances of a session in participant order.
#[must_use]
pub fn settle_session(session: &Session) -> Settlement {
    settle(&session.net_balances())
}

/// Position of the party with the largest remaining amount; earliest input wins ties.
fn largest(parties: &[Party]) -> Option<usize> {
    parties
        .iter()
        .enumerate()
        .max_by_key(|(_, p)| (p.remaining, Reverse(p.index)))
        .map(|(pos, _)| pos)
}
