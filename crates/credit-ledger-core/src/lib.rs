//! Core types and utilities for the credit ledger.
//!
//! This crate provides the foundational types used by the deduction engine and its stores:
//!
//! - **Identifiers**: `UserId`, `DeductionId`, `UsageRecordId`, `RequestId`
//! - **Balances**: `CreditBalance`
//! - **Ledger**: `DeductionLedgerEntry`, `DeductionStatus`, `Reversal`
//! - **Usage**: `UsageFacts`, `UsageRecord`, `DailyUsageRollup`
//! - **Rounding**: `RoundingIncrement` and the quantization rule
//! - **Pricing**: `PricingTable`, `ModelPricing`
//!
//! # Credit Unit
//!
//! One credit is worth a fixed dollar amount (`$0.01` by default). Amounts are
//! `rust_decimal::Decimal` so that increments like `0.1` credit stay exact. Every
//! charged amount is a multiple of the rounding increment in effect when it was
//! recorded, always rounded up so the vendor cost is covered.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod balance;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod pricing;
pub mod rounding;
pub mod usage;

pub use balance::CreditBalance;
pub use error::{LedgerError, Result, Shortfall};
pub use ids::{DeductionId, IdError, RequestId, UsageRecordId, UserId};
pub use ledger::{Charge, DateRange, DeductionLedgerEntry, DeductionStatus, Reversal};
pub use pricing::{ModelKey, ModelPricing, PricingTable};
pub use rounding::{RoundingIncrement, DEFAULT_CREDIT_VALUE_USD, MAX_CREDIT_AMOUNT};
pub use usage::{DailyUsageRollup, TokenCounts, UsageFacts, UsageRecord, UsageStatus};
