//! Rounding policy integration tests.

mod common;

use common::{facts, request_id, Fault, TestHarness};
use credit_ledger_core::{LedgerError, RoundingIncrement, UserId};
use credit_ledger_engine::LedgerConfig;
use credit_ledger_store::LedgerStore;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_default_increment_is_hundredth() {
    let harness = TestHarness::new().await;
    assert_eq!(harness.ledger.current_increment(), RoundingIncrement::Hundredth);
}

#[tokio::test]
async fn test_configured_default_applies_when_nothing_persisted() {
    let config = LedgerConfig {
        default_rounding_increment: RoundingIncrement::Tenth,
        ..LedgerConfig::default()
    };
    let harness = TestHarness::with_config(config).await;
    assert_eq!(harness.ledger.current_increment(), RoundingIncrement::Tenth);
}

#[tokio::test]
async fn test_invalid_increment_is_rejected() {
    let harness = TestHarness::new().await;
    harness
        .ledger
        .update_rounding_increment(dec!(0.1), None)
        .await
        .unwrap();

    for bad in [dec!(0.05), dec!(0), dec!(-1), dec!(10)] {
        let err = harness
            .ledger
            .update_rounding_increment(bad, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(_)), "{bad} accepted");
    }

    assert_eq!(harness.ledger.current_increment(), RoundingIncrement::Tenth);
    assert_eq!(
        harness.store.load_rounding_increment().await.unwrap(),
        Some(RoundingIncrement::Tenth)
    );
}

#[tokio::test]
async fn test_update_is_persisted_with_admin() {
    let harness = TestHarness::new().await;
    let admin = UserId::generate();

    let applied = harness
        .ledger
        .update_rounding_increment(dec!(1), Some(admin))
        .await
        .unwrap();

    assert_eq!(applied, RoundingIncrement::Whole);
    assert_eq!(
        harness.store.load_rounding_increment().await.unwrap(),
        Some(RoundingIncrement::Whole)
    );
}

#[tokio::test]
async fn test_whole_increment_charges_two_for_one_point_two() {
    let harness = TestHarness::new().await;
    harness.fund(dec!(10));
    harness
        .ledger
        .update_rounding_increment(dec!(1), None)
        .await
        .unwrap();

    let receipt = harness
        .ledger
        .deduct(harness.user_id, dec!(1.2), request_id("req-whole"), facts())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(receipt.amount, dec!(2));
    assert_eq!(receipt.rounding_increment, RoundingIncrement::Whole);

    let entry = harness.ledger.get_deduction(&receipt.deduction_id).await.unwrap();
    assert_eq!(entry.rounding_increment, RoundingIncrement::Whole);
    assert!(entry.rounding_increment.is_aligned(entry.amount));
}

#[tokio::test]
async fn test_entries_keep_the_increment_they_were_charged_at() {
    let harness = TestHarness::new().await;
    harness.fund(dec!(10));

    let first = harness
        .ledger
        .deduct(harness.user_id, dec!(1.234), request_id("req-r1"), facts())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    harness
        .ledger
        .update_rounding_increment(dec!(0.1), None)
        .await
        .unwrap();
    let second = harness
        .ledger
        .deduct(harness.user_id, dec!(1.234), request_id("req-r2"), facts())
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(first.amount, dec!(1.24));
    assert_eq!(second.amount, dec!(1.3));

    let first = harness.ledger.get_deduction(&first.deduction_id).await.unwrap();
    assert_eq!(first.rounding_increment, RoundingIncrement::Hundredth);
}

#[tokio::test]
async fn test_reload_picks_up_external_change() {
    let harness = TestHarness::new().await;

    // Another process changes the setting.
    harness
        .store
        .save_rounding_increment(RoundingIncrement::Tenth, None)
        .await
        .unwrap();
    assert_eq!(harness.ledger.current_increment(), RoundingIncrement::Hundredth);

    assert_eq!(harness.ledger.reload_rounding().await, RoundingIncrement::Tenth);
    assert_eq!(harness.ledger.current_increment(), RoundingIncrement::Tenth);
}

#[tokio::test]
async fn test_failed_reload_keeps_last_known_value() {
    let (harness, faulty) = TestHarness::faulty(LedgerConfig::default()).await;
    harness
        .ledger
        .update_rounding_increment(dec!(0.1), None)
        .await
        .unwrap();

    faulty.inject(Some(Fault::FailSettingsRead));
    harness
        .store
        .save_rounding_increment(RoundingIncrement::Whole, None)
        .await
        .unwrap();

    assert_eq!(harness.ledger.reload_rounding().await, RoundingIncrement::Tenth);

    faulty.inject(None);
    assert_eq!(harness.ledger.reload_rounding().await, RoundingIncrement::Whole);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_reload_follows_store() {
    let config = LedgerConfig {
        rounding_reload_interval: std::time::Duration::from_secs(60),
        ..LedgerConfig::default()
    };
    let harness = TestHarness::with_config(config).await;
    let handle = harness.ledger.spawn_rounding_reload();

    harness
        .store
        .save_rounding_increment(RoundingIncrement::Whole, None)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(61)).await;

    assert_eq!(harness.ledger.current_increment(), RoundingIncrement::Whole);
    handle.abort();
}
