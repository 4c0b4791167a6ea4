//! Credit ledger and deduction engine.
//!
//! Converts metered LLM usage into auditable, all-or-nothing balance
//! mutations:
//!
//! - **Estimation**: conservative pre-flight credit estimates
//! - **Deduction**: lock, check, debit, record, link, roll up, commit
//! - **Reversal**: credit a deduction back and mark it reversed
//! - **Rounding**: cached minimum credit increment with explicit reload
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use credit_ledger_core::{PricingTable, RequestId, TokenCounts, UsageFacts, UserId};
//! use credit_ledger_engine::{CreditLedger, DeductionOutcome, LedgerConfig};
//! use credit_ledger_store::MemoryStore;
//! use rust_decimal_macros::dec;
//!
//! # async fn run() -> Result<(), credit_ledger_core::LedgerError> {
//! let ledger = CreditLedger::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(PricingTable::with_defaults()),
//!     LedgerConfig::default(),
//! )
//! .await?;
//!
//! let user_id = UserId::generate();
//! let facts = UsageFacts::llm(
//!     "anthropic",
//!     "claude-3-5-sonnet",
//!     TokenCounts::new(1000, 500),
//!     dec!(0.0105),
//!     dec!(1.5),
//! );
//!
//! match ledger.deduct_usage(user_id, RequestId::new("req-1")?, facts).await? {
//!     DeductionOutcome::Completed(receipt) => println!("charged {}", receipt.amount),
//!     DeductionOutcome::InsufficientCredits(s) => println!("short by {}", s.shortfall),
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod coordinator;
pub mod estimation;
pub mod ledger;
pub mod reversal;
pub mod rounding;

pub use config::LedgerConfig;
pub use coordinator::{DeductionCoordinator, DeductionOutcome, DeductionReceipt, DeductionRequest};
pub use estimation::{Estimate, EstimationConfig, EstimationEngine, PricingError, PricingSource};
pub use ledger::{CreditLedger, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
pub use reversal::{ReversalHandler, ReversalReceipt};
pub use rounding::RoundingPolicyCache;
