//! Randomized ledger invariants.
//!
//! Each case replays a seeded sequence of deductions, reversals, and
//! rounding changes, then checks the books balance.

mod common;

use common::{facts, request_id, TestHarness};
use credit_ledger_core::{DeductionId, DeductionStatus, LedgerError, UserId};
use credit_ledger_engine::DeductionOutcome;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const CASES: u64 = 24;
const STEPS: usize = 60;

fn random_amount(rng: &mut StdRng) -> Decimal {
    // 0.0001 .. 25.0000 credits, deliberately off-increment.
    Decimal::new(rng.gen_range(1..250_000), 4)
}

async fn run_case(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let harness = TestHarness::new().await;
    let initial = Decimal::from(rng.gen_range(0..200));
    harness.fund(initial);

    let mut charged: Vec<DeductionId> = Vec::new();
    for step in 0..STEPS {
        match rng.gen_range(0..10) {
            0 => {
                let increment = [dec!(0.01), dec!(0.1), dec!(1)][rng.gen_range(0..3)];
                harness
                    .ledger
                    .update_rounding_increment(increment, None)
                    .await
                    .unwrap();
            }
            1 | 2 if !charged.is_empty() => {
                let id = charged[rng.gen_range(0..charged.len())];
                match harness.ledger.reverse(&id, "property", UserId::generate()).await {
                    Ok(_) | Err(LedgerError::AlreadyReversed { .. }) => {}
                    Err(other) => panic!("seed {seed} step {step}: {other:?}"),
                }
            }
            _ => {
                let amount = random_amount(&mut rng);
                // Occasionally replay an old request id.
                let key = if rng.gen_bool(0.1) && step > 0 {
                    format!("req-{seed}-{}", rng.gen_range(0..step))
                } else {
                    format!("req-{seed}-{step}")
                };
                match harness
                    .ledger
                    .deduct(harness.user_id, amount, request_id(&key), facts())
                    .await
                {
                    Ok(DeductionOutcome::Completed(receipt)) => {
                        assert!(receipt.amount >= amount, "seed {seed}: rounded down");
                        charged.push(receipt.deduction_id);
                    }
                    Ok(DeductionOutcome::InsufficientCredits(shortfall)) => {
                        assert!(shortfall.current_balance < shortfall.required);
                    }
                    Err(LedgerError::DuplicateRequest { .. }) => {}
                    Err(other) => panic!("seed {seed} step {step}: {other:?}"),
                }
            }
        }

        assert!(harness.balance().await >= Decimal::ZERO, "seed {seed}: negative balance");
    }

    let entries = harness.history().await;
    assert_eq!(entries.len(), charged.len(), "seed {seed}");

    let outstanding: Decimal = entries
        .iter()
        .filter(|e| e.status == DeductionStatus::Completed)
        .map(|e| e.amount)
        .sum();
    assert_eq!(harness.balance().await, initial - outstanding, "seed {seed}");

    for entry in &entries {
        assert!(
            entry.rounding_increment.is_aligned(entry.amount),
            "seed {seed}: {} not aligned to {}",
            entry.amount,
            entry.rounding_increment
        );
        assert_eq!(entry.balance_after, entry.balance_before - entry.amount);
        assert!(entry.balance_after >= Decimal::ZERO);
    }
}

#[tokio::test]
async fn test_books_balance_under_random_sequences() {
    for seed in 0..CASES {
        run_case(seed).await;
    }
}
