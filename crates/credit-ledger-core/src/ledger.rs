//! Deduction ledger entries.
//!
//! A ledger entry is written once per completed deduction. Its amount and
//! balance snapshot never change; the only later mutation is the single
//! `completed -> reversed` transition.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::rounding::RoundingIncrement;
use crate::{DeductionId, RequestId, UsageRecordId, UserId};

/// An immutable record of one completed deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionLedgerEntry {
    /// Unique entry ID (ULID for time-ordering).
    pub id: DeductionId,

    /// The user whose balance was debited.
    pub user_id: UserId,

    /// The usage record created in the same transaction.
    pub usage_record_id: UsageRecordId,

    /// Caller idempotency key. Unique across all entries.
    pub request_id: RequestId,

    /// Credits debited. A multiple of `rounding_increment`.
    pub amount: Decimal,

    /// Balance before the debit.
    pub balance_before: Decimal,

    /// Balance after the debit (`balance_before - amount`).
    pub balance_after: Decimal,

    /// Vendor cost in USD.
    pub vendor_cost: Decimal,

    /// Margin multiplier applied to the vendor cost.
    pub margin_multiplier: Decimal,

    /// Dollar value of `amount` minus the vendor cost.
    pub gross_margin: Decimal,

    /// Human-readable description.
    pub reason: String,

    /// Increment in effect when the entry was created.
    pub rounding_increment: RoundingIncrement,

    /// Current status.
    pub status: DeductionStatus,

    /// When the deduction was processed.
    pub processed_at: DateTime<Utc>,

    /// When the entry was reversed.
    pub reversed_at: Option<DateTime<Utc>>,

    /// Administrator who reversed the entry.
    pub reversed_by: Option<UserId>,

    /// Why the entry was reversed.
    pub reversal_reason: Option<String>,
}

/// The monetary side of a deduction, prepared before the transaction opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    /// Quantized credits to debit.
    pub amount: Decimal,
    /// Vendor cost in USD.
    pub vendor_cost: Decimal,
    /// Margin multiplier applied.
    pub margin_multiplier: Decimal,
    /// Dollar value of one credit.
    pub credit_value_usd: Decimal,
    /// Increment the amount was quantized to.
    pub rounding_increment: RoundingIncrement,
}

impl Charge {
    /// Dollar value of the charged credits minus the vendor cost.
    #[must_use]
    pub fn gross_margin(&self) -> Decimal {
        self.amount * self.credit_value_usd - self.vendor_cost
    }
}

impl DeductionLedgerEntry {
    /// Create a completed entry for a debit from `balance_before`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn completed(
        id: DeductionId,
        user_id: UserId,
        usage_record_id: UsageRecordId,
        request_id: RequestId,
        charge: Charge,
        balance_before: Decimal,
        reason: String,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            usage_record_id,
            request_id,
            amount: charge.amount,
            balance_before,
            balance_after: balance_before - charge.amount,
            vendor_cost: charge.vendor_cost,
            margin_multiplier: charge.margin_multiplier,
            gross_margin: charge.gross_margin(),
            reason,
            rounding_increment: charge.rounding_increment,
            status: DeductionStatus::Completed,
            processed_at,
            reversed_at: None,
            reversed_by: None,
            reversal_reason: None,
        }
    }

    /// Check if the entry has been reversed.
    #[must_use]
    pub fn is_reversed(&self) -> bool {
        self.status == DeductionStatus::Reversed
    }

    /// Apply the one permitted status transition.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::AlreadyReversed` if the entry is already reversed.
    pub fn apply_reversal(&mut self, reversal: &Reversal) -> Result<(), LedgerError> {
        if self.is_reversed() {
            return Err(LedgerError::AlreadyReversed { deduction_id: self.id });
        }
        self.status = DeductionStatus::Reversed;
        self.reversed_at = Some(reversal.reversed_at);
        self.reversed_by = Some(reversal.reversed_by);
        self.reversal_reason = Some(reversal.reason.clone());
        Ok(())
    }
}

/// Status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionStatus {
    /// The deduction stands.
    Completed,
    /// The deduction was credited back. Terminal.
    Reversed,
}

impl DeductionStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Reversed => "reversed",
        }
    }
}

impl fmt::Display for DeductionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeductionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "reversed" => Ok(Self::Reversed),
            other => Err(LedgerError::DeductionFailed(format!(
                "unknown deduction status {other:?}"
            ))),
        }
    }
}

/// The stamp written onto an entry when it is reversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reversal {
    /// When the reversal happened.
    pub reversed_at: DateTime<Utc>,
    /// The acting administrator.
    pub reversed_by: UserId,
    /// Why.
    pub reason: String,
}

/// A half-open time range `[start, end)`. Missing bounds are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// The unbounded range.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidInput` if `end` is not after `start`.
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, LedgerError> {
        if end <= start {
            return Err(LedgerError::InvalidInput(format!(
                "date range end {end} is not after start {start}"
            )));
        }
        Ok(Self {
            start: Some(start),
            end: Some(end),
        })
    }

    /// Check if `at` falls inside the range.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at < e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn entry(amount: Decimal, balance_before: Decimal) -> DeductionLedgerEntry {
        DeductionLedgerEntry::completed(
            DeductionId::generate(),
            UserId::generate(),
            UsageRecordId::generate(),
            RequestId::new("req-1").unwrap(),
            Charge {
                amount,
                vendor_cost: dec!(0.2),
                margin_multiplier: dec!(1.5),
                credit_value_usd: dec!(0.01),
                rounding_increment: RoundingIncrement::Tenth,
            },
            balance_before,
            "LLM usage".into(),
            Utc::now(),
        )
    }

    #[test]
    fn completed_entry_balances() {
        let e = entry(dec!(30), dec!(100));
        assert_eq!(e.balance_after, dec!(70));
        assert_eq!(e.balance_after, e.balance_before - e.amount);
        assert_eq!(e.status, DeductionStatus::Completed);
        // 30 credits at $0.01 = $0.30, minus $0.20 vendor cost.
        assert_eq!(e.gross_margin, dec!(0.1));
    }

    #[test]
    fn reversal_happens_once() {
        let mut e = entry(dec!(30), dec!(100));
        let reversal = Reversal {
            reversed_at: Utc::now(),
            reversed_by: UserId::generate(),
            reason: "duplicate charge".into(),
        };

        e.apply_reversal(&reversal).unwrap();
        assert!(e.is_reversed());
        assert_eq!(e.reversed_by, Some(reversal.reversed_by));
        assert_eq!(e.amount, dec!(30));
        assert_eq!(e.balance_after, dec!(70));

        let again = e.apply_reversal(&reversal);
        assert!(matches!(again, Err(LedgerError::AlreadyReversed { .. })));
    }

    #[test]
    fn status_parses() {
        assert_eq!("reversed".parse::<DeductionStatus>().unwrap(), DeductionStatus::Reversed);
        assert!("pending".parse::<DeductionStatus>().is_err());
    }

    #[test]
    fn date_range_is_half_open() {
        let start = Utc::now();
        let end = start + Duration::hours(1);
        let range = DateRange::between(start, end).unwrap();

        assert!(range.contains(start));
        assert!(!range.contains(end));
        assert!(DateRange::all().contains(end));
        assert!(DateRange::between(end, start).is_err());
    }
}
