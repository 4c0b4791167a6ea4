//! Engine configuration.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use credit_ledger_core::{LedgerError, RoundingIncrement, DEFAULT_CREDIT_VALUE_USD};
use credit_ledger_store::TxOptions;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::estimation::EstimationConfig;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// PostgreSQL connection string (`DATABASE_URL`).
    pub database_url: Option<String>,

    /// Maximum pooled connections (default: 10).
    pub max_connections: u32,

    /// Maximum wait for a balance or ledger row lock (default: 5s).
    pub lock_timeout: Duration,

    /// Upper bound on one deduction or reversal, lock waits included (default: 10s).
    pub transaction_timeout: Duration,

    /// Dollar value of one credit (default: $0.01).
    pub credit_value_usd: Decimal,

    /// Increment used until a persisted setting is loaded (default: 0.01).
    pub default_rounding_increment: RoundingIncrement,

    /// How often the rounding cache re-reads the persisted setting (default: 60s).
    pub rounding_reload_interval: Duration,

    /// Estimation parameters.
    pub estimation: EstimationConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            lock_timeout: Duration::from_millis(5000),
            transaction_timeout: Duration::from_millis(10_000),
            credit_value_usd: DEFAULT_CREDIT_VALUE_USD,
            default_rounding_increment: RoundingIncrement::default(),
            rounding_reload_interval: Duration::from_secs(60),
            estimation: EstimationConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables take their defaults. Malformed values are logged and
    /// also fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let estimation = defaults.estimation;

        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            max_connections: env_or("LEDGER_MAX_CONNECTIONS", defaults.max_connections),
            lock_timeout: Duration::from_millis(env_or("LEDGER_LOCK_TIMEOUT_MS", 5000)),
            transaction_timeout: Duration::from_millis(env_or(
                "LEDGER_TRANSACTION_TIMEOUT_MS",
                10_000,
            )),
            credit_value_usd: positive_env_or(
                "LEDGER_CREDIT_VALUE_USD",
                defaults.credit_value_usd,
            ),
            default_rounding_increment: env_or(
                "LEDGER_DEFAULT_ROUNDING_INCREMENT",
                defaults.default_rounding_increment,
            ),
            rounding_reload_interval: Duration::from_secs(env_or(
                "LEDGER_ROUNDING_RELOAD_SECS",
                60,
            )),
            estimation: EstimationConfig {
                default_margin: positive_env_or("LEDGER_DEFAULT_MARGIN", estimation.default_margin),
                safety_margin: env_or("LEDGER_ESTIMATE_SAFETY_MARGIN", estimation.safety_margin),
                fallback_usd_per_1k_tokens: positive_env_or(
                    "LEDGER_FALLBACK_USD_PER_1K_TOKENS",
                    estimation.fallback_usd_per_1k_tokens,
                ),
                pricing_timeout: Duration::from_millis(env_or("LEDGER_PRICING_TIMEOUT_MS", 500)),
            },
        }
    }

    /// Check values that would make the engine charge incorrectly.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` naming the first invalid value.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.credit_value_usd <= Decimal::ZERO {
            return Err(LedgerError::Configuration(format!(
                "credit value must be positive, got {}",
                self.credit_value_usd
            )));
        }
        if self.estimation.safety_margin < Decimal::ZERO {
            return Err(LedgerError::Configuration(format!(
                "safety margin must not be negative, got {}",
                self.estimation.safety_margin
            )));
        }
        if self.estimation.default_margin < dec!(1) {
            return Err(LedgerError::Configuration(format!(
                "default margin must be at least 1, got {}",
                self.estimation.default_margin
            )));
        }
        if self.transaction_timeout.is_zero() || self.lock_timeout.is_zero() {
            return Err(LedgerError::Configuration(
                "lock and transaction timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Per-transaction limits handed to the store.
    #[must_use]
    pub const fn tx_options(&self) -> TxOptions {
        TxOptions {
            lock_timeout: self.lock_timeout,
            statement_timeout: self.transaction_timeout,
        }
    }
}

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T>(name: &str, raw: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                variable = name,
                value = raw,
                error = %e,
                default = %default,
                "Malformed configuration value, using default"
            );
            default
        }
    }
}

fn positive_env_or(name: &str, default: Decimal) -> Decimal {
    let value = env_or(name, default);
    if value > Decimal::ZERO {
        value
    } else {
        tracing::warn!(
            variable = name,
            value = %value,
            default = %default,
            "Value must be positive, using default"
        );
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.credit_value_usd, dec!(0.01));
        assert_eq!(config.estimation.default_margin, dec!(1.5));
        assert_eq!(config.tx_options().lock_timeout, Duration::from_secs(5));
    }

    #[test]
    fn malformed_values_fall_back() {
        assert_eq!(parse_or("X", "not-a-number", 10_u32), 10);
        assert_eq!(parse_or("X", " 25 ", 10_u32), 25);
        assert_eq!(
            parse_or("X", "0.5", RoundingIncrement::Hundredth),
            RoundingIncrement::Hundredth
        );
        assert_eq!(parse_or("X", "1", RoundingIncrement::Hundredth), RoundingIncrement::Whole);
    }

    #[test]
    fn non_positive_credit_value_is_rejected() {
        let config = LedgerConfig {
            credit_value_usd: Decimal::ZERO,
            ..LedgerConfig::default()
        };
        assert!(matches!(config.validate(), Err(LedgerError::Configuration(_))));
    }
}
