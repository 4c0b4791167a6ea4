//! Database schema definitions.
//!
//! Table and constraint names shared by the PostgreSQL backend and its migrations.

/// Table names in the PostgreSQL database.
pub mod table {
    /// One balance row per user, keyed by `user_id`.
    pub const CREDIT_BALANCES: &str = "credit_balances";

    /// Immutable deduction entries, keyed by `id` (ULID stored as UUID).
    pub const DEDUCTION_LEDGER: &str = "deduction_ledger";

    /// Usage facts, one-to-one with ledger entries.
    pub const USAGE_RECORDS: &str = "usage_records";

    /// Per-day usage aggregates, keyed by `(user_id, usage_date, model_id, provider)`.
    pub const USAGE_DAILY_ROLLUPS: &str = "usage_daily_rollups";

    /// Durable key/value settings.
    pub const LEDGER_SETTINGS: &str = "ledger_settings";
}

/// Unique index guarding request-id idempotency.
pub const REQUEST_ID_UNIQUE_INDEX: &str = "deduction_ledger_request_id_key";

/// Settings key for the rounding increment.
pub const ROUNDING_INCREMENT_SETTING: &str = "rounding_increment";

/// Returns all table names in creation order.
#[must_use]
pub fn all_tables() -> Vec<&'static str> {
    vec![
        table::CREDIT_BALANCES,
        table::USAGE_RECORDS,
        table::DEDUCTION_LEDGER,
        table::USAGE_DAILY_ROLLUPS,
        table::LEDGER_SETTINGS,
    ]
}
