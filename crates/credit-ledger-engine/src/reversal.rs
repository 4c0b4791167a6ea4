//! Reversal handler.
//!
//! A reversal credits a deduction's amount back to the user's *current*
//! balance and marks the entry reversed. The entry's amount and balance
//! snapshot are left as recorded. Locks are taken entry first, then balance;
//! deductions only ever lock the balance, so the two paths cannot deadlock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use credit_ledger_core::{DeductionId, LedgerError, Reversal, UserId};
use credit_ledger_store::{LedgerStore, TxOptions};
use rust_decimal::Decimal;
use serde::Serialize;

/// What a completed reversal did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReversalReceipt {
    /// The reversed entry.
    pub deduction_id: DeductionId,
    /// Owner of the credited balance.
    pub user_id: UserId,
    /// Amount credited back.
    pub amount: Decimal,
    /// Balance just before the credit.
    pub balance_before: Decimal,
    /// Balance just after the credit.
    pub balance_after: Decimal,
    /// When the reversal was stamped.
    pub reversed_at: DateTime<Utc>,
    /// Administrator who reversed it.
    pub reversed_by: UserId,
}

/// Undoes completed deductions.
#[derive(Clone)]
pub struct ReversalHandler {
    store: Arc<dyn LedgerStore>,
    tx_options: TxOptions,
    transaction_timeout: Duration,
}

impl ReversalHandler {
    /// Create a handler over a store.
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        tx_options: TxOptions,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            store,
            tx_options,
            transaction_timeout,
        }
    }

    /// Reverse one deduction.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidInput` if `reason` is blank
    /// - `LedgerError::NotFound` if no such entry exists
    /// - `LedgerError::AlreadyReversed` if it was reversed before
    /// - contention and storage errors as for deductions
    pub async fn reverse(
        &self,
        deduction_id: &DeductionId,
        reason: &str,
        admin: UserId,
    ) -> Result<ReversalReceipt, LedgerError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::InvalidInput(
                "reversal reason must not be empty".into(),
            ));
        }

        let work = self.run(deduction_id, reason, admin);
        let result = tokio::time::timeout(self.transaction_timeout, work)
            .await
            .unwrap_or(Err(LedgerError::TransactionTimeout));

        match &result {
            Ok(receipt) => tracing::info!(
                deduction_id = %deduction_id,
                user_id = %receipt.user_id,
                amount = %receipt.amount,
                balance_after = %receipt.balance_after,
                reversed_by = %admin,
                "Deduction reversed"
            ),
            Err(e) => tracing::warn!(
                deduction_id = %deduction_id,
                reversed_by = %admin,
                error = %e,
                "Reversal rejected"
            ),
        }
        result
    }

    async fn run(
        &self,
        deduction_id: &DeductionId,
        reason: &str,
        admin: UserId,
    ) -> Result<ReversalReceipt, LedgerError> {
        let mut tx = self.store.begin(self.tx_options).await?;

        let entry = tx
            .lock_deduction(deduction_id)
            .await?
            .ok_or(LedgerError::NotFound {
                deduction_id: *deduction_id,
            })?;
        if entry.is_reversed() {
            return Err(LedgerError::AlreadyReversed {
                deduction_id: *deduction_id,
            });
        }

        let balance = tx.lock_balance(&entry.user_id).await?;
        let reversed_at = Utc::now();
        let credited = balance.credited(entry.amount, reversed_at);
        tx.write_balance(&credited).await?;

        let reversal = Reversal {
            reversed_at,
            reversed_by: admin,
            reason: reason.to_string(),
        };
        tx.mark_reversed(deduction_id, &reversal).await?;
        tx.commit().await?;

        Ok(ReversalReceipt {
            deduction_id: *deduction_id,
            user_id: entry.user_id,
            amount: entry.amount,
            balance_before: balance.amount,
            balance_after: credited.amount,
            reversed_at,
            reversed_by: admin,
        })
    }
}
