//! Credit balance types.
//!
//! One balance row exists per user. It is created lazily by the first locked
//! access and never deleted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Shortfall;
use crate::UserId;

/// A user's current credit balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    /// The owning user.
    pub user_id: UserId,

    /// Current balance in credits. Never negative.
    pub amount: Decimal,

    /// When the last deduction was applied.
    pub last_deduction_at: Option<DateTime<Utc>>,

    /// Amount of the last deduction.
    pub last_deduction_amount: Option<Decimal>,

    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

impl CreditBalance {
    /// The implicit zero balance of a user who has no row yet.
    #[must_use]
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            amount: Decimal::ZERO,
            last_deduction_at: None,
            last_deduction_amount: None,
            updated_at: Utc::now(),
        }
    }

    /// Check if the balance covers a deduction of `amount`.
    #[must_use]
    pub fn covers(&self, amount: Decimal) -> bool {
        self.amount >= amount
    }

    /// The shortfall for `amount`, or `None` if the balance covers it.
    #[must_use]
    pub fn shortfall(&self, amount: Decimal) -> Option<Shortfall> {
        (!self.covers(amount)).then(|| Shortfall::new(self.amount, amount))
    }

    /// Return the balance after debiting `amount` at `at`.
    ///
    /// The caller must have checked [`Self::covers`] first.
    #[must_use]
    pub fn debited(&self, amount: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            user_id: self.user_id,
            amount: self.amount - amount,
            last_deduction_at: Some(at),
            last_deduction_amount: Some(amount),
            updated_at: at,
        }
    }

    /// Return the balance after crediting `amount` back at `at`.
    ///
    /// The last-deduction fields are left untouched.
    #[must_use]
    pub fn credited(&self, amount: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            amount: self.amount + amount,
            updated_at: at,
            ..self.clone()
        }
    }
}
