//! Property-based tests for the settlement engine.
//!
//! For every balanced input:
//! - Correctness: incoming minus outgoing equals each participant's balance
//! - Minimality: at most `n - 1` transfers for `n` non-zero participants
//! - Determinism: the same input always yields the same transfers

use chipledger_settlement::settle;
use chipledger_types::{MinorUnits, NetBalance, ParticipantId};
use proptest::prelude::*;
use std::collections::HashMap;

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

/// Balanced vectors: the last participant absorbs the sum of the others.
fn balanced_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(-50_000i64..50_000, 1..12).prop_map(|mut amounts| {
        let sum: i64 = amounts.iter().sum();
        amounts.push(-sum);
        amounts
    })
}

fn to_balances(amounts: &[i64]) -> Vec<NetBalance> {
    amounts
        .iter()
        .map(|a| NetBalance::new(ParticipantId::new(), MinorUnits::new(*a)))
        .collect()
}

proptest! {
    #[test]
    fn transfers_reproduce_every_balance(amounts in balanced_strategy()) {
        let balances = to_balances(&amounts);
        let result = settle(&balances);
        prop_assert!(result.warning.is_none());

        let mut net: HashMap<ParticipantId, i64> = HashMap::new();
        for t in &result.transfers {
            prop_assert!(t.amount.is_positive());
            *net.entry(t.to).or_default() += t.amount.get();
            *net.entry(t.from).or_default() -= t.amount.get();
        }
        for b in &balances {
            prop_assert_eq!(net.get(&b.participant_id).copied().unwrap_or(0), b.amount.get());
        }
    }

    #[test]
    fn at_most_n_minus_one_transfers(amounts in balanced_strategy()) {
        let balances = to_balances(&amounts);
        let non_zero = amounts.iter().filter(|a| **a != 0).count();
        let result = settle(&balances);
        prop_assert!(result.transfers.len() <= non_zero.saturating_sub(1));
    }

    #[test]
    fn identical_input_is_deterministic(amounts in balanced_strategy()) {
        let balances = to_balances(&amounts);
        prop_assert_eq!(settle(&balances), settle(&balances));
    }

    #[test]
    fn apply_leaves_only_zeroes(amounts in balanced_strategy()) {
        let balances = to_balances(&amounts);
        let after = settle(&balances).apply(&balances);
        prop_assert!(after.iter().all(|b| b.amount.is_zero()));
    }

    #[test]
    fn unbalanced_input_always_carries_residual(
        amounts in prop::collection::vec(-50_000i64..50_000, 1..12)
    ) {
        let balances = to_balances(&amounts);
        let sum: i64 = amounts.iter().sum();
        let result = settle(&balances);
        match result.warning {
            Some(w) => prop_assert_eq!(w.residual.get(), sum),
            None => prop_assert_eq!(sum, 0),
        }
    }
}
