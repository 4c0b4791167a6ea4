//! Reversal integration tests.

mod common;

use std::sync::Arc;

use common::{facts, request_id, TestHarness};
use credit_ledger_core::{DeductionId, DeductionStatus, LedgerError, UserId};
use credit_ledger_engine::DeductionReceipt;
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

async fn charge(harness: &TestHarness, amount: Decimal, id: &str) -> DeductionReceipt {
    harness
        .ledger
        .deduct(harness.user_id, amount, request_id(id), facts())
        .await
        .unwrap()
        .into_result()
        .unwrap()
}

#[tokio::test]
async fn test_reverse_restores_balance_once() {
    let harness = TestHarness::new().await;
    harness.fund(dec!(100));
    let receipt = charge(&harness, dec!(30), "req-1").await;
    assert_eq!(harness.balance().await, dec!(70));

    let admin = UserId::generate();
    let reversal = harness
        .ledger
        .reverse(&receipt.deduction_id, "customer complaint", admin)
        .await
        .unwrap();

    assert_eq!(reversal.amount, dec!(30));
    assert_eq!(reversal.balance_before, dec!(70));
    assert_eq!(reversal.balance_after, dec!(100));
    assert_eq!(reversal.reversed_by, admin);
    assert_eq!(harness.balance().await, dec!(100));

    let entry = harness.ledger.get_deduction(&receipt.deduction_id).await.unwrap();
    assert_eq!(entry.status, DeductionStatus::Reversed);
    assert_eq!(entry.reversed_by, Some(admin));
    assert_eq!(entry.reversal_reason.as_deref(), Some("customer complaint"));
    assert!(entry.reversed_at.is_some());

    let err = harness
        .ledger
        .reverse(&receipt.deduction_id, "again", admin)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyReversed { .. }));
    assert_eq!(harness.balance().await, dec!(100));
}

#[tokio::test]
async fn test_reversal_credits_current_balance_and_keeps_snapshot() {
    let harness = TestHarness::new().await;
    harness.fund(dec!(100));
    let first = charge(&harness, dec!(30), "req-a").await;
    charge(&harness, dec!(20), "req-b").await;
    assert_eq!(harness.balance().await, dec!(50));

    let reversal = harness
        .ledger
        .reverse(&first.deduction_id, "refund", UserId::generate())
        .await
        .unwrap();

    assert_eq!(reversal.balance_before, dec!(50));
    assert_eq!(reversal.balance_after, dec!(80));
    assert_eq!(harness.balance().await, dec!(80));

    // The entry's own snapshot is history and never rewritten.
    let entry = harness.ledger.get_deduction(&first.deduction_id).await.unwrap();
    assert_eq!(entry.balance_before, dec!(100));
    assert_eq!(entry.balance_after, dec!(70));
    assert_eq!(entry.amount, dec!(30));
}

#[tokio::test]
async fn test_reverse_unknown_deduction() {
    let harness = TestHarness::new().await;
    let missing = DeductionId::generate();

    let err = harness
        .ledger
        .reverse(&missing, "refund", UserId::generate())
        .await
        .unwrap_err();

    match err {
        LedgerError::NotFound { deduction_id } => assert_eq!(deduction_id, missing),
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reverse_requires_reason() {
    let harness = TestHarness::new().await;
    harness.fund(dec!(10));
    let receipt = charge(&harness, dec!(1), "req-reason").await;

    let err = harness
        .ledger
        .reverse(&receipt.deduction_id, "   ", UserId::generate())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidInput(_)));
    assert_eq!(harness.balance().await, dec!(9));
    let entry = harness.ledger.get_deduction(&receipt.deduction_id).await.unwrap();
    assert_eq!(entry.status, DeductionStatus::Completed);
}

#[tokio::test]
async fn test_reversal_leaves_usage_and_rollups_alone() {
    let harness = TestHarness::new().await;
    harness.fund(dec!(10));
    let receipt = charge(&harness, dec!(2), "req-rollup").await;
    let day = receipt.processed_at.date_naive();

    let before = harness
        .ledger
        .get_daily_usage(&harness.user_id, day, day)
        .await
        .unwrap();

    harness
        .ledger
        .reverse(&receipt.deduction_id, "refund", UserId::generate())
        .await
        .unwrap();

    let after = harness
        .ledger
        .get_daily_usage(&harness.user_id, day, day)
        .await
        .unwrap();
    assert_eq!(before, after);

    let usage = harness.ledger.get_usage_for(&receipt.deduction_id).await.unwrap();
    assert_eq!(usage.deduction_id, Some(receipt.deduction_id));
}

#[tokio::test]
async fn test_reversed_request_id_stays_consumed() {
    let harness = TestHarness::new().await;
    harness.fund(dec!(10));
    let receipt = charge(&harness, dec!(1), "req-once").await;
    harness
        .ledger
        .reverse(&receipt.deduction_id, "refund", UserId::generate())
        .await
        .unwrap();

    let err = harness
        .ledger
        .deduct(harness.user_id, dec!(1), request_id("req-once"), facts())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::DuplicateRequest { .. }));
    assert_eq!(harness.balance().await, dec!(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reversals_credit_once() {
    let harness = Arc::new(TestHarness::new().await);
    harness.fund(dec!(50));
    let receipt = charge(&harness, dec!(20), "req-race").await;

    let handles = (0..8).map(|i| {
        let harness = Arc::clone(&harness);
        let deduction_id = receipt.deduction_id;
        tokio::spawn(async move {
            harness
                .ledger
                .reverse(&deduction_id, &format!("refund {i}"), UserId::generate())
                .await
        })
    });

    let mut succeeded = 0;
    for result in join_all(handles).await {
        match result.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::AlreadyReversed { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(harness.balance().await, dec!(50));
}
