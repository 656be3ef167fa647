use chipledger_settlement::{
    ImbalanceWarning, Settlement, Transfer, settle, settle_session, settle_with_tolerance,
};
use chipledger_types::{
    ConversionRate, MinorUnits, NetBalance, ParticipantId, Points, Session, Timestamp,
};
use pretty_assertions::assert_eq;

fn ids<const N: usize>() -> [ParticipantId; N] {
    std::array::from_fn(|_| ParticipantId::new())
}

fn balances(entries: &[(ParticipantId, i64)]) -> Vec<NetBalance> {
    entries
        .iter()
        .map(|(id, amount)| NetBalance::new(*id, MinorUnits::new(*amount)))
        .collect()
}

fn transfer(from: ParticipantId, to: ParticipantId, amount: i64) -> Transfer {
    Transfer {
        from,
        to,
        amount: MinorUnits::new(amount),
    }
}

// ── Scenarios ────────────────────────────────────────────────────

#[test]
fn one_creditor_two_debtors() {
    let [a, b, c] = ids();
    let result = settle(&balances(&[(a, 30), (b, -10), (c, -20)]));
    assert_eq!(result.transfers, vec![transfer(b, a, 10), transfer(c, a, 20)]);
    assert!(result.warning.is_none());
}

#[test]
fn two_creditors_one_debtor() {
    let [a, b, c] = ids();
    let result = settle(&balances(&[(a, 15), (b, 5), (c, -20)]));
    assert_eq!(result.transfers, vec![transfer(c, a, 15), transfer(c, b, 5)]);
    assert!(result.warning.is_none());
}

#[test]
fn all_zero_balances_settle_to_nothing() {
    let [a, b] = ids();
    let result = settle(&balances(&[(a, 0), (b, 0)]));
    assert_eq!(result, Settlement::default());
}

#[test]
fn empty_input_settles_to_nothing() {
    let result = settle(&[]);
    assert!(result.transfers.is_empty());
    assert!(result.warning.is_none());
}

#[test]
fn imbalanced_input_reports_residual() {
    let [a, b] = ids();
    let result = settle(&balances(&[(a, 10), (b, -5)]));
    assert_eq!(result.transfers, vec![transfer(b, a, 5)]);
    assert_eq!(
        result.warning,
        Some(ImbalanceWarning {
            residual: MinorUnits::new(5)
        })
    );
    assert!(!result.is_balanced());
}

#[test]
fn negative_residual_is_signed() {
    let [a, b] = ids();
    let result = settle(&balances(&[(a, 5), (b, -12)]));
    assert_eq!(result.transfers, vec![transfer(b, a, 5)]);
    assert_eq!(result.warning.unwrap().residual, MinorUnits::new(-7));
}

#[test]
fn single_pair_is_one_transfer_of_min() {
    let [a, b] = ids();
    let result = settle(&balances(&[(a, -40), (b, 40)]));
    assert_eq!(result.transfers, vec![transfer(a, b, 40)]);
}

#[test]
fn largest_parties_are_matched_first() {
    let [a, b, c, d] = ids();
    // Greedy pairs d (-70) with b (+60) first, then leftovers.
    let result = settle(&balances(&[(a, 40), (b, 60), (c, -30), (d, -70)]));
    assert_eq!(
        result.transfers,
        vec![transfer(c, a, 30), transfer(d, a, 10), transfer(d, b, 60)]
    );
}

#[test]
fn ties_are_broken_by_input_order() {
    let [a, b, c, d] = ids();
    let result = settle(&balances(&[(a, 10), (b, 10), (c, -10), (d, -10)]));
    assert_eq!(result.transfers, vec![transfer(c, a, 10), transfer(d, b, 10)]);
}

// ── Tolerance ────────────────────────────────────────────────────

#[test]
fn residual_within_tolerance_is_not_reported() {
    let [a, b] = ids();
    let result = settle_with_tolerance(&balances(&[(a, 101), (b, -100)]), MinorUnits::new(1));
    assert!(result.warning.is_none());
    assert_eq!(result.transfers, vec![transfer(b, a, 100)]);
}

#[test]
fn residual_beyond_tolerance_is_reported() {
    let [a, b] = ids();
    let result = settle_with_tolerance(&balances(&[(a, 103), (b, -100)]), MinorUnits::new(2));
    assert_eq!(result.warning.unwrap().residual, MinorUnits::new(3));
}

// ── Helpers ──────────────────────────────────────────────────────

#[test]
fn apply_zeroes_balanced_input() {
    let [a, b, c, d] = ids();
    let input = balances(&[(a, 700), (b, -250), (c, -300), (d, -150)]);
    let result = settle(&input);
    let after = result.apply(&input);
    assert!(after.iter().all(|b| b.amount.is_zero()));
    assert_eq!(result.total_transferred(), MinorUnits::new(700));
}

#[test]
fn settle_session_uses_participant_order() {
    let t = Timestamp::from_millis;
    let mut session = Session::new("game", ConversionRate::one_to_one(), MinorUnits::new(100));
    let a = session.add_participant("Ana", t(1)).unwrap();
    let b = session.add_participant("Ben", t(1)).unwrap();
    session.buy_in(a, MinorUnits::new(100), Points::new(100), t(2)).unwrap();
    session.buy_in(b, MinorUnits::new(100), Points::new(100), t(2)).unwrap();
    session.cash_out(a, MinorUnits::new(160), Points::new(160), t(3)).unwrap();
    session.cash_out(b, MinorUnits::new(40), Points::new(40), t(3)).unwrap();

    let result = settle_session(&session);
    assert_eq!(result.transfers, vec![transfer(b, a, 60)]);
    assert!(result.is_balanced());
}

#[test]
fn settlement_serializes_without_empty_warning() {
    let [a, b] = ids();
    let result = settle(&balances(&[(a, 1), (b, -1)]));
    let json = serde_json::to_value(&result).unwrap();
    assert!(json.get("warning").is_none());
    assert_eq!(json["transfers"][0]["amount"], 1);
}
