//! Storage layer for the credit ledger.
//!
//! This crate persists balances, deduction ledger entries, usage records, daily
//! usage rollups, and the rounding setting. Every balance mutation happens inside
//! a [`LedgerTx`] that holds an exclusive lock on the balance row.
//!
//! # Backends
//!
//! - [`PgLedgerStore`]: PostgreSQL, `SERIALIZABLE` transactions, `SELECT ... FOR UPDATE`
//!   row locks bounded by `lock_timeout`
//! - [`MemoryStore`]: in-process store with per-key async locks, used by tests and
//!   local tooling
//!
//! # Tables
//!
//! - `credit_balances`: one row per user, keyed by `user_id`
//! - `usage_records`: usage facts, linked one-to-one with a ledger entry
//! - `deduction_ledger`: immutable deduction entries, unique on `request_id`
//! - `usage_daily_rollups`: per-day aggregates by model and provider
//! - `ledger_settings`: durable key/value settings (the rounding increment)
//!
//! # Example
//!
//! ```no_run
//! use credit_ledger_store::{LedgerStore, LedgerTx, MemoryStore, TxOptions};
//! use credit_ledger_core::UserId;
//!
//! # async fn run() -> credit_ledger_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//!
//! let mut tx = store.begin(TxOptions::default()).await?;
//! let balance = tx.lock_balance(&user_id).await?;
//! assert!(balance.amount.is_zero());
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgLedgerStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use credit_ledger_core::{
    CreditBalance, DailyUsageRollup, DateRange, DeductionId, DeductionLedgerEntry, Reversal,
    RoundingIncrement, UsageRecord, UsageRecordId, UserId,
};

/// Per-transaction limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    /// Maximum wait for any single row lock.
    pub lock_timeout: Duration,
    /// Maximum duration of any single statement.
    pub statement_timeout: Duration,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(10),
        }
    }
}

/// The storage trait defining all ledger reads and the transaction entry point.
///
/// Reads outside a transaction observe committed state only.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Open a transaction with the given limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start a transaction.
    async fn begin(&self, options: TxOptions) -> Result<Box<dyn LedgerTx>>;

    /// Committed balance of a user, if a balance row exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>>;

    /// Get a ledger entry by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_deduction(&self, deduction_id: &DeductionId)
        -> Result<Option<DeductionLedgerEntry>>;

    /// Get a usage record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_usage_record(&self, usage_record_id: &UsageRecordId)
        -> Result<Option<UsageRecord>>;

    /// List a user's ledger entries inside `range`, newest first.
    ///
    /// Ties on `processed_at` are broken by id, descending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_deductions(
        &self,
        user_id: &UserId,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<DeductionLedgerEntry>>;

    /// Daily rollups for a user with `from <= usage_date <= to`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_daily_usage(
        &self,
        user_id: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRollup>>;

    /// The persisted rounding increment, if one was ever saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored value is
    /// not an allowed increment.
    async fn load_rounding_increment(&self) -> Result<Option<RoundingIncrement>>;

    /// Persist the rounding increment.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn save_rounding_increment(
        &self,
        increment: RoundingIncrement,
        updated_by: Option<UserId>,
    ) -> Result<()>;
}

/// One open ledger transaction.
///
/// Nothing written through a transaction is visible to other readers until
/// [`LedgerTx::commit`] succeeds. Dropping the handle without committing rolls
/// everything back and releases its locks.
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock a user's balance row for the rest of the transaction and return it.
    ///
    /// A missing row is created with a zero balance. Re-locking a row the
    /// transaction already holds returns its current (staged) value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the lock is not acquired within
    /// the transaction's lock timeout.
    async fn lock_balance(&mut self, user_id: &UserId) -> Result<CreditBalance>;

    /// Overwrite a locked balance row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotLocked` if the row was not locked by this
    /// transaction, or `StoreError::Constraint` for a negative amount.
    async fn write_balance(&mut self, balance: &CreditBalance) -> Result<()>;

    /// Insert a usage record. Its `deduction_id` is set later by
    /// [`LedgerTx::link_usage_record`].
    ///
    /// # Errors
    ///
    /// Returns an error if the record id already exists.
    async fn insert_usage_record(&mut self, record: &UsageRecord) -> Result<()>;

    /// Insert a completed ledger entry.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateRequest` if an entry with the same request
    /// id exists, or `StoreError::Constraint` if the entry is inconsistent.
    async fn insert_deduction(&mut self, entry: &DeductionLedgerEntry) -> Result<()>;

    /// Point a usage record at the ledger entry that paid for it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Constraint` if the record is missing or already linked.
    async fn link_usage_record(
        &mut self,
        usage_record_id: &UsageRecordId,
        deduction_id: &DeductionId,
    ) -> Result<()>;

    /// Add one deduction's usage to its daily bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn record_daily_usage(&mut self, increment: &DailyUsageRollup) -> Result<()>;

    /// Lock a ledger entry for the rest of the transaction and return it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the lock is not acquired in time.
    async fn lock_deduction(
        &mut self,
        deduction_id: &DeductionId,
    ) -> Result<Option<DeductionLedgerEntry>>;

    /// Transition a locked entry from `completed` to `reversed`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotLocked` if the entry was not locked by this
    /// transaction, or `StoreError::AlreadyReversed`.
    async fn mark_reversed(&mut self, deduction_id: &DeductionId, reversal: &Reversal)
        -> Result<()>;

    /// Make every write visible atomically and release all locks.
    ///
    /// # Errors
    ///
    /// Returns an error if a constraint fails at commit time or the backend
    /// aborts the transaction. Nothing is applied in that case.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write and release all locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend reports a failure while rolling back.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
