//! Rounding policy and the quantization rule.
//!
//! Every charged amount is rounded *up* to the nearest allowed increment, so a
//! deduction never bills below the vendor cost that produced it.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Dollar value of one credit unless configured otherwise.
pub const DEFAULT_CREDIT_VALUE_USD: Decimal = dec!(0.01);

/// Largest amount a single charge may carry.
///
/// Balance and amount columns hold sixteen integer digits; this leaves one
/// digit of headroom so a balance credited back by a reversal still fits.
pub const MAX_CREDIT_AMOUNT: Decimal = dec!(1000000000000000);

/// The minimum credit increment. Only these three values are ever allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub enum RoundingIncrement {
    /// 0.01 credit.
    #[default]
    Hundredth,
    /// 0.1 credit.
    Tenth,
    /// 1 credit.
    Whole,
}

impl RoundingIncrement {
    /// Every allowed increment, smallest first.
    pub const ALL: [Self; 3] = [Self::Hundredth, Self::Tenth, Self::Whole];

    /// The increment as a decimal number of credits.
    #[must_use]
    pub const fn as_decimal(self) -> Decimal {
        match self {
            Self::Hundredth => dec!(0.01),
            Self::Tenth => dec!(0.1),
            Self::Whole => dec!(1),
        }
    }

    /// Compact code used for lock-free caching.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Hundredth => 0,
            Self::Tenth => 1,
            Self::Whole => 2,
        }
    }

    /// Inverse of [`Self::code`].
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Hundredth),
            1 => Some(Self::Tenth),
            2 => Some(Self::Whole),
            _ => None,
        }
    }

    /// Round a raw credit amount up to the smallest multiple of this increment
    /// that is greater than or equal to it.
    ///
    /// Non-positive input quantizes to zero. Already aligned values are returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidInput` if the result would exceed
    /// [`MAX_CREDIT_AMOUNT`].
    pub fn quantize(self, credits: Decimal) -> Result<Decimal, LedgerError> {
        if credits <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let step = self.as_decimal();
        credits
            .checked_div(step)
            .and_then(|steps| steps.ceil().checked_mul(step))
            .filter(|amount| *amount <= MAX_CREDIT_AMOUNT)
            .map(|amount| amount.normalize())
            .ok_or_else(|| out_of_range(credits))
    }

    /// Convert a dollar cost into quantized credits.
    ///
    /// Computes `ceil(usd / (increment * credit_value_usd)) * increment`.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` if `credit_value_usd` is not positive,
    /// or `LedgerError::InvalidInput` if the credits would exceed
    /// [`MAX_CREDIT_AMOUNT`].
    pub fn quantize_usd(
        self,
        usd: Decimal,
        credit_value_usd: Decimal,
    ) -> Result<Decimal, LedgerError> {
        if credit_value_usd <= Decimal::ZERO {
            return Err(LedgerError::Configuration(format!(
                "credit value must be positive, got {credit_value_usd}"
            )));
        }
        if usd <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let step = self.as_decimal();
        step.checked_mul(credit_value_usd)
            .and_then(|unit| usd.checked_div(unit))
            .and_then(|steps| steps.ceil().checked_mul(step))
            .filter(|amount| *amount <= MAX_CREDIT_AMOUNT)
            .map(|amount| amount.normalize())
            .ok_or_else(|| {
                LedgerError::InvalidInput(format!("cost of ${usd} is out of range"))
            })
    }

    /// Whether `amount` is an exact multiple of this increment.
    #[must_use]
    pub fn is_aligned(self, amount: Decimal) -> bool {
        (amount % self.as_decimal()).is_zero()
    }
}

fn out_of_range(credits: Decimal) -> LedgerError {
    LedgerError::InvalidInput(format!(
        "credit amount {credits} exceeds the maximum of {MAX_CREDIT_AMOUNT}"
    ))
}

impl TryFrom<Decimal> for RoundingIncrement {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|inc| inc.as_decimal() == value)
            .ok_or_else(|| {
                LedgerError::Configuration(format!(
                    "rounding increment {value} is not one of 0.01, 0.1, 1"
                ))
            })
    }
}

impl From<RoundingIncrement> for Decimal {
    fn from(inc: RoundingIncrement) -> Self {
        inc.as_decimal()
    }
}

impl FromStr for RoundingIncrement {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim()).map_err(|_| {
            LedgerError::Configuration(format!("rounding increment {s:?} is not a number"))
        })?;
        Self::try_from(value)
    }
}

impl fmt::Display for RoundingIncrement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_decimal())
    }
}
