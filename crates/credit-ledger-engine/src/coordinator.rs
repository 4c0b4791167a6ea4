//! Deduction coordinator.
//!
//! One deduction is one `DeductionUnit` driven through typed stages:
//!
//! ```text
//! begin -> lock_balance -> debit -> record -> link -> roll_up -> commit
//! ```
//!
//! Each stage consumes the unit and returns the next one, so a stage cannot be
//! skipped or repeated, and only a fully rolled-up unit can commit. Dropping a
//! unit at any stage rolls its transaction back. The stages are private to this
//! crate; outside callers go through [`DeductionCoordinator::deduct`], which
//! quantizes the amount before any balance is touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use credit_ledger_core::{
    Charge, CreditBalance, DailyUsageRollup, DeductionId, DeductionLedgerEntry, LedgerError,
    RequestId, RoundingIncrement, Shortfall, UsageFacts, UsageRecord, UsageRecordId, UserId,
};
use credit_ledger_store::{LedgerStore, LedgerTx, StoreError, TxOptions};
use rust_decimal::Decimal;
use serde::Serialize;

/// One deduction as handed over by the serving layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeductionRequest {
    /// User being charged.
    pub user_id: UserId,
    /// Raw credit amount; quantized up before it is charged.
    pub amount: Decimal,
    /// Caller-supplied idempotency key.
    pub request_id: RequestId,
    /// Usage that produced the charge.
    pub facts: UsageFacts,
    /// Human-readable reason stored on the ledger entry.
    pub reason: String,
}

impl DeductionRequest {
    /// Build a request with a reason derived from the usage facts.
    #[must_use]
    pub fn new(user_id: UserId, amount: Decimal, request_id: RequestId, facts: UsageFacts) -> Self {
        let reason = format!("{}/{} usage", facts.provider, facts.model_id);
        Self {
            user_id,
            amount,
            request_id,
            facts,
            reason,
        }
    }

    /// Replace the ledger reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// What a completed deduction did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeductionReceipt {
    /// The new ledger entry.
    pub deduction_id: DeductionId,
    /// The usage record linked to it.
    pub usage_record_id: UsageRecordId,
    /// Amount charged, after quantization.
    pub amount: Decimal,
    /// Balance before the charge.
    pub balance_before: Decimal,
    /// Balance after the charge.
    pub balance_after: Decimal,
    /// Increment the amount was quantized to.
    pub rounding_increment: RoundingIncrement,
    /// Commit-side timestamp of the deduction.
    pub processed_at: DateTime<Utc>,
}

impl From<&DeductionLedgerEntry> for DeductionReceipt {
    fn from(entry: &DeductionLedgerEntry) -> Self {
        Self {
            deduction_id: entry.id,
            usage_record_id: entry.usage_record_id,
            amount: entry.amount,
            balance_before: entry.balance_before,
            balance_after: entry.balance_after,
            rounding_increment: entry.rounding_increment,
            processed_at: entry.processed_at,
        }
    }
}

/// Expected outcomes of a deduction.
///
/// Insufficient credit is an outcome, not a failure: callers must handle it
/// separately from the `Err` side, which carries true failures.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductionOutcome {
    /// The deduction committed.
    Completed(DeductionReceipt),
    /// The balance did not cover the amount; nothing was written.
    InsufficientCredits(Shortfall),
}

impl DeductionOutcome {
    /// Collapse insufficiency into `LedgerError::InsufficientCredits`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InsufficientCredits` for the insufficient outcome.
    pub fn into_result(self) -> Result<DeductionReceipt, LedgerError> {
        match self {
            Self::Completed(receipt) => Ok(receipt),
            Self::InsufficientCredits(shortfall) => Err(LedgerError::insufficient(shortfall)),
        }
    }

    /// The receipt, if the deduction committed.
    #[must_use]
    pub const fn receipt(&self) -> Option<&DeductionReceipt> {
        match self {
            Self::Completed(receipt) => Some(receipt),
            Self::InsufficientCredits(_) => None,
        }
    }
}

/// Transaction opened, nothing locked.
pub(crate) struct Open;

/// Balance row locked.
pub(crate) struct Locked {
    balance: CreditBalance,
}

/// Balance written down.
pub(crate) struct Debited {
    balance_before: Decimal,
    charge: Charge,
    processed_at: DateTime<Utc>,
}

/// Usage record and ledger entry inserted.
pub(crate) struct Recorded {
    entry: DeductionLedgerEntry,
    record: UsageRecord,
}

/// Usage record pointed at its ledger entry.
pub(crate) struct Linked {
    entry: DeductionLedgerEntry,
    record: UsageRecord,
}

/// Daily rollup updated; ready to commit.
pub(crate) struct RolledUp {
    entry: DeductionLedgerEntry,
}

/// A deduction transaction at stage `S`.
pub(crate) struct DeductionUnit<S> {
    tx: Box<dyn LedgerTx>,
    stage: S,
}

/// Result of the debit stage.
pub(crate) enum Debit {
    /// The balance covered the charge.
    Debited(DeductionUnit<Debited>),
    /// The balance fell short; the unit must be aborted.
    Insufficient {
        /// The still-locked unit.
        unit: DeductionUnit<Locked>,
        /// How far short the balance fell.
        shortfall: Shortfall,
    },
}

impl DeductionUnit<Open> {
    /// Open the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot start a transaction.
    pub(crate) async fn begin(
        store: &dyn LedgerStore,
        options: TxOptions,
    ) -> Result<Self, StoreError> {
        let tx = store.begin(options).await?;
        Ok(Self { tx, stage: Open })
    }

    /// Take the exclusive lock on the user's balance row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if another transaction holds the row
    /// past the lock timeout.
    pub(crate) async fn lock_balance(
        mut self,
        user_id: &UserId,
    ) -> Result<DeductionUnit<Locked>, StoreError> {
        let balance = self.tx.lock_balance(user_id).await?;
        tracing::debug!(user_id = %user_id, balance = %balance.amount, "Balance locked");
        Ok(DeductionUnit {
            tx: self.tx,
            stage: Locked { balance },
        })
    }
}

impl DeductionUnit<Locked> {
    /// Check sufficiency and write the reduced balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the balance write fails.
    pub(crate) async fn debit(
        mut self,
        charge: Charge,
        processed_at: DateTime<Utc>,
    ) -> Result<Debit, StoreError> {
        if let Some(shortfall) = self.stage.balance.shortfall(charge.amount) {
            return Ok(Debit::Insufficient {
                unit: self,
                shortfall,
            });
        }

        let debited = self.stage.balance.debited(charge.amount, processed_at);
        self.tx.write_balance(&debited).await?;
        tracing::debug!(
            user_id = %debited.user_id,
            amount = %charge.amount,
            balance_after = %debited.amount,
            "Balance debited"
        );

        Ok(Debit::Debited(DeductionUnit {
            tx: self.tx,
            stage: Debited {
                balance_before: self.stage.balance.amount,
                charge,
                processed_at,
            },
        }))
    }

    /// Roll back without writing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend reports a rollback failure.
    pub(crate) async fn abort(self) -> Result<(), StoreError> {
        self.tx.rollback().await
    }
}

impl DeductionUnit<Debited> {
    /// Insert the usage record, then the ledger entry that references it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateRequest` if the request id was already
    /// charged.
    pub(crate) async fn record(
        mut self,
        request: &DeductionRequest,
    ) -> Result<DeductionUnit<Recorded>, StoreError> {
        let Debited {
            balance_before,
            charge,
            processed_at,
        } = self.stage;

        let record = UsageRecord::from_facts(
            UsageRecordId::generate(),
            request.user_id,
            request.request_id.clone(),
            &request.facts,
            processed_at,
        );
        self.tx.insert_usage_record(&record).await?;

        let entry = DeductionLedgerEntry::completed(
            DeductionId::generate(),
            request.user_id,
            record.id,
            request.request_id.clone(),
            charge,
            balance_before,
            request.reason.clone(),
            processed_at,
        );
        self.tx.insert_deduction(&entry).await?;
        tracing::debug!(
            deduction_id = %entry.id,
            usage_record_id = %record.id,
            request_id = %entry.request_id,
            "Ledger entry recorded"
        );

        Ok(DeductionUnit {
            tx: self.tx,
            stage: Recorded { entry, record },
        })
    }
}

impl DeductionUnit<Recorded> {
    /// Close the one-to-one link from the usage record back to the entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or already linked.
    pub(crate) async fn link(mut self) -> Result<DeductionUnit<Linked>, StoreError> {
        let Recorded { entry, mut record } = self.stage;
        self.tx.link_usage_record(&record.id, &entry.id).await?;
        record.deduction_id = Some(entry.id);

        Ok(DeductionUnit {
            tx: self.tx,
            stage: Linked { entry, record },
        })
    }
}

impl DeductionUnit<Linked> {
    /// Add the deduction to its daily usage bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollup write fails; the whole unit must then be
    /// dropped.
    pub(crate) async fn roll_up(mut self) -> Result<DeductionUnit<RolledUp>, StoreError> {
        let Linked { entry, record } = self.stage;
        self.tx
            .record_daily_usage(&DailyUsageRollup::increment(&entry, &record))
            .await?;

        Ok(DeductionUnit {
            tx: self.tx,
            stage: RolledUp { entry },
        })
    }
}

impl DeductionUnit<RolledUp> {
    /// Commit and return the entry that is now visible.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails. Nothing is applied in that case.
    pub(crate) async fn commit(self) -> Result<DeductionLedgerEntry, StoreError> {
        self.tx.commit().await?;
        Ok(self.stage.entry)
    }
}

/// Runs deductions, one transaction each. Never retries.
#[derive(Clone)]
pub struct DeductionCoordinator {
    store: Arc<dyn LedgerStore>,
    tx_options: TxOptions,
    transaction_timeout: Duration,
    credit_value_usd: Decimal,
}

impl DeductionCoordinator {
    /// Create a coordinator over a store.
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        tx_options: TxOptions,
        transaction_timeout: Duration,
        credit_value_usd: Decimal,
    ) -> Self {
        Self {
            store,
            tx_options,
            transaction_timeout,
            credit_value_usd,
        }
    }

    /// Charge `request.amount`, quantized up to `increment`.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidInput` if the usage facts are invalid or the
    ///   quantized amount is not positive or exceeds `MAX_CREDIT_AMOUNT`
    /// - `LedgerError::DuplicateRequest` if the request id was already charged
    /// - `LedgerError::LockTimeout` / `TransactionTimeout` / `SerializationConflict`
    ///   for contention; the caller may retry with the same request id
    /// - `LedgerError::DeductionFailed` for any other storage failure
    pub async fn deduct(
        &self,
        request: &DeductionRequest,
        increment: RoundingIncrement,
    ) -> Result<DeductionOutcome, LedgerError> {
        request.facts.validate()?;

        let amount = increment.quantize(request.amount)?;
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidInput(format!(
                "deduction amount must be positive, got {}",
                request.amount
            )));
        }

        let charge = Charge {
            amount,
            vendor_cost: request.facts.vendor_cost,
            margin_multiplier: request.facts.margin_multiplier,
            credit_value_usd: self.credit_value_usd,
            rounding_increment: increment,
        };

        let result = tokio::time::timeout(self.transaction_timeout, self.run(request, charge))
            .await
            .unwrap_or(Err(LedgerError::TransactionTimeout));

        match &result {
            Ok(DeductionOutcome::Completed(receipt)) => tracing::info!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                deduction_id = %receipt.deduction_id,
                amount = %receipt.amount,
                balance_after = %receipt.balance_after,
                "Deduction completed"
            ),
            Ok(DeductionOutcome::InsufficientCredits(shortfall)) => tracing::warn!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                current_balance = %shortfall.current_balance,
                required = %shortfall.required,
                shortfall = %shortfall.shortfall,
                "Insufficient credits"
            ),
            Err(e) if e.is_transient() => tracing::warn!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                error = %e,
                "Deduction aborted"
            ),
            Err(e) => tracing::error!(
                user_id = %request.user_id,
                request_id = %request.request_id,
                error = %e,
                "Deduction failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        request: &DeductionRequest,
        charge: Charge,
    ) -> Result<DeductionOutcome, LedgerError> {
        let unit = DeductionUnit::begin(self.store.as_ref(), self.tx_options)
            .await?
            .lock_balance(&request.user_id)
            .await?;

        let unit = match unit.debit(charge, Utc::now()).await? {
            Debit::Debited(unit) => unit,
            Debit::Insufficient { unit, shortfall } => {
                if let Err(e) = unit.abort().await {
                    tracing::warn!(error = %e, "Rollback after insufficient balance failed");
                }
                return Ok(DeductionOutcome::InsufficientCredits(shortfall));
            }
        };

        let entry = unit
            .record(request)
            .await?
            .link()
            .await?
            .roll_up()
            .await?
            .commit()
            .await?;

        Ok(DeductionOutcome::Completed(DeductionReceipt::from(&entry)))
    }
}
