//! Common test utilities for credit ledger integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use credit_ledger_core::{
    CreditBalance, DailyUsageRollup, DateRange, DeductionId, DeductionLedgerEntry, PricingTable,
    RequestId, Reversal, RoundingIncrement, TokenCounts, UsageFacts, UsageRecord, UsageRecordId,
    UserId,
};
use credit_ledger_engine::{CreditLedger, LedgerConfig};
use credit_ledger_store::{LedgerStore, LedgerTx, MemoryStore, Result, StoreError, TxOptions};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Test harness over an in-memory store.
pub struct TestHarness {
    /// The ledger under test.
    pub ledger: CreditLedger,
    /// The backing store, for seeding and inspection.
    pub store: MemoryStore,
    /// A funded-on-demand test user.
    pub user_id: UserId,
}

impl TestHarness {
    /// A ledger with default configuration.
    pub async fn new() -> Self {
        Self::with_config(LedgerConfig::default()).await
    }

    /// A ledger with custom configuration.
    pub async fn with_config(config: LedgerConfig) -> Self {
        let store = MemoryStore::new();
        let ledger = CreditLedger::new(
            Arc::new(store.clone()),
            Arc::new(PricingTable::with_defaults()),
            config,
        )
        .await
        .expect("Failed to build ledger");

        Self {
            ledger,
            store,
            user_id: UserId::generate(),
        }
    }

    /// A ledger whose store fails on demand.
    pub async fn faulty(config: LedgerConfig) -> (Self, FaultyStore) {
        let store = MemoryStore::new();
        let faulty = FaultyStore::new(store.clone());
        let ledger = CreditLedger::new(
            Arc::new(faulty.clone()),
            Arc::new(PricingTable::with_defaults()),
            config,
        )
        .await
        .expect("Failed to build ledger");

        let harness = Self {
            ledger,
            store,
            user_id: UserId::generate(),
        };
        (harness, faulty)
    }

    /// Set the test user's balance.
    pub fn fund(&self, amount: Decimal) {
        self.store.set_balance(self.user_id, amount);
    }

    /// The test user's committed balance.
    pub async fn balance(&self) -> Decimal {
        self.ledger
            .get_current_balance(&self.user_id)
            .await
            .expect("Failed to read balance")
    }

    /// All of the test user's ledger entries, newest first.
    pub async fn history(&self) -> Vec<DeductionLedgerEntry> {
        self.ledger
            .get_deduction_history(&self.user_id, &DateRange::all(), Some(500))
            .await
            .expect("Failed to read history")
    }
}

/// Usage facts for a small Claude request.
pub fn facts() -> UsageFacts {
    UsageFacts::llm(
        "anthropic",
        "claude-3-5-sonnet",
        TokenCounts::new(1000, 500),
        dec!(0.0105),
        dec!(1.5),
    )
}

/// Parse a request id.
pub fn request_id(value: &str) -> RequestId {
    RequestId::new(value).expect("valid request id")
}

/// Configuration with short timeouts for contention tests.
pub fn fast_config() -> LedgerConfig {
    LedgerConfig {
        lock_timeout: Duration::from_millis(100),
        transaction_timeout: Duration::from_millis(500),
        ..LedgerConfig::default()
    }
}

/// Failures a [`FaultyStore`] can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every daily rollup write fails.
    FailRollup,
    /// Every commit fails.
    FailCommit,
    /// Every settings read fails.
    FailSettingsRead,
    /// Every balance lock stalls for this long before proceeding.
    SlowLock(Duration),
}

/// A `LedgerStore` that wraps a [`MemoryStore`] and injects one fault.
#[derive(Clone)]
pub struct FaultyStore {
    inner: MemoryStore,
    fault: Arc<Mutex<Option<Fault>>>,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// Arm a fault; `None` disarms.
    pub fn inject(&self, fault: Option<Fault>) {
        *self.fault.lock().unwrap() = fault;
    }

    fn fault(&self) -> Option<Fault> {
        *self.fault.lock().unwrap()
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Database(format!("injected {what} failure"))
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn begin(&self, options: TxOptions) -> Result<Box<dyn LedgerTx>> {
        let inner = self.inner.begin(options).await?;
        Ok(Box::new(FaultyTx {
            inner,
            fault: self.fault(),
        }))
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        self.inner.get_balance(user_id).await
    }

    async fn get_deduction(
        &self,
        deduction_id: &DeductionId,
    ) -> Result<Option<DeductionLedgerEntry>> {
        self.inner.get_deduction(deduction_id).await
    }

    async fn get_usage_record(
        &self,
        usage_record_id: &UsageRecordId,
    ) -> Result<Option<UsageRecord>> {
        self.inner.get_usage_record(usage_record_id).await
    }

    async fn list_deductions(
        &self,
        user_id: &UserId,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<DeductionLedgerEntry>> {
        self.inner.list_deductions(user_id, range, limit).await
    }

    async fn list_daily_usage(
        &self,
        user_id: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRollup>> {
        self.inner.list_daily_usage(user_id, from, to).await
    }

    async fn load_rounding_increment(&self) -> Result<Option<RoundingIncrement>> {
        if self.fault() == Some(Fault::FailSettingsRead) {
            return Err(injected("settings read"));
        }
        self.inner.load_rounding_increment().await
    }

    async fn save_rounding_increment(
        &self,
        increment: RoundingIncrement,
        updated_by: Option<UserId>,
    ) -> Result<()> {
        self.inner.save_rounding_increment(increment, updated_by).await
    }
}

struct FaultyTx {
    inner: Box<dyn LedgerTx>,
    fault: Option<Fault>,
}

#[async_trait]
impl LedgerTx for FaultyTx {
    async fn lock_balance(&mut self, user_id: &UserId) -> Result<CreditBalance> {
        if let Some(Fault::SlowLock(delay)) = self.fault {
            tokio::time::sleep(delay).await;
        }
        self.inner.lock_balance(user_id).await
    }

    async fn write_balance(&mut self, balance: &CreditBalance) -> Result<()> {
        self.inner.write_balance(balance).await
    }

    async fn insert_usage_record(&mut self, record: &UsageRecord) -> Result<()> {
        self.inner.insert_usage_record(record).await
    }

    async fn insert_deduction(&mut self, entry: &DeductionLedgerEntry) -> Result<()> {
        self.inner.insert_deduction(entry).await
    }

    async fn link_usage_record(
        &mut self,
        usage_record_id: &UsageRecordId,
        deduction_id: &DeductionId,
    ) -> Result<()> {
        self.inner.link_usage_record(usage_record_id, deduction_id).await
    }

    async fn record_daily_usage(&mut self, increment: &DailyUsageRollup) -> Result<()> {
        if self.fault == Some(Fault::FailRollup) {
            return Err(injected("rollup"));
        }
        self.inner.record_daily_usage(increment).await
    }

    async fn lock_deduction(
        &mut self,
        deduction_id: &DeductionId,
    ) -> Result<Option<DeductionLedgerEntry>> {
        self.inner.lock_deduction(deduction_id).await
    }

    async fn mark_reversed(
        &mut self,
        deduction_id: &DeductionId,
        reversal: &Reversal,
    ) -> Result<()> {
        self.inner.mark_reversed(deduction_id, reversal).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.fault == Some(Fault::FailCommit) {
            return Err(injected("commit"));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}
