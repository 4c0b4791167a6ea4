//! PostgreSQL storage implementation.
//!
//! Every transaction runs at `SERIALIZABLE` isolation with `lock_timeout` and
//! `statement_timeout` set locally, so a stuck lock or query fails the
//! transaction instead of hanging it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use credit_ledger_core::{
    CreditBalance, DailyUsageRollup, DateRange, DeductionId, DeductionLedgerEntry,
    DeductionStatus, RequestId, Reversal, RoundingIncrement, TokenCounts, UsageRecord,
    UsageRecordId, UsageStatus, UserId,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::schema::{REQUEST_ID_UNIQUE_INDEX, ROUNDING_INCREMENT_SETTING};
use crate::{LedgerStore, LedgerTx, TxOptions};

const DEDUCTION_COLUMNS: &str = "id, user_id, usage_record_id, request_id, amount, \
    balance_before, balance_after, vendor_cost, margin_multiplier, gross_margin, reason, \
    rounding_increment, status, processed_at, reversed_at, reversed_by, reversal_reason";

const USAGE_COLUMNS: &str = "id, user_id, request_id, model_id, provider, input_tokens, \
    output_tokens, cached_tokens, vendor_cost, margin_multiplier, started_at, completed_at, \
    duration_ms, status, deduction_id, created_at";

const BALANCE_COLUMNS: &str =
    "user_id, amount, last_deduction_at, last_deduction_amount, updated_at";

/// PostgreSQL-backed ledger store.
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect to the database at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot establish a connection.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::debug!(max_connections, "Connected to ledger database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        tracing::info!("Ledger migrations applied");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self, options: TxOptions) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(millis(options.lock_timeout))
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT set_config('statement_timeout', $1, true)")
            .bind(millis(options.statement_timeout))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgTx {
            tx,
            locked_balances: HashSet::new(),
            locked_deductions: HashSet::new(),
        }))
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        let row: Option<BalanceRow> = sqlx::query_as(&format!(
            "SELECT {BALANCE_COLUMNS} FROM credit_balances WHERE user_id = $1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CreditBalance::from))
    }

    async fn get_deduction(
        &self,
        deduction_id: &DeductionId,
    ) -> Result<Option<DeductionLedgerEntry>> {
        let row: Option<DeductionRow> = sqlx::query_as(&format!(
            "SELECT {DEDUCTION_COLUMNS} FROM deduction_ledger WHERE id = $1"
        ))
        .bind(deduction_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeductionLedgerEntry::try_from).transpose()
    }

    async fn get_usage_record(
        &self,
        usage_record_id: &UsageRecordId,
    ) -> Result<Option<UsageRecord>> {
        let row: Option<UsageRow> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE id = $1"
        ))
        .bind(usage_record_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(UsageRecord::try_from).transpose()
    }

    async fn list_deductions(
        &self,
        user_id: &UserId,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<DeductionLedgerEntry>> {
        let rows: Vec<DeductionRow> = sqlx::query_as(&format!(
            "SELECT {DEDUCTION_COLUMNS} FROM deduction_ledger \
             WHERE user_id = $1 \
               AND ($2::timestamptz IS NULL OR processed_at >= $2) \
               AND ($3::timestamptz IS NULL OR processed_at < $3) \
             ORDER BY processed_at DESC, id DESC \
             LIMIT $4"
        ))
        .bind(user_id.as_uuid())
        .bind(range.start)
        .bind(range.end)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeductionLedgerEntry::try_from).collect()
    }

    async fn list_daily_usage(
        &self,
        user_id: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRollup>> {
        let rows: Vec<RollupRow> = sqlx::query_as(
            "SELECT user_id, usage_date, model_id, provider, request_count, input_tokens, \
                    output_tokens, cached_tokens, credits_charged, vendor_cost \
             FROM usage_daily_rollups \
             WHERE user_id = $1 AND usage_date BETWEEN $2 AND $3 \
             ORDER BY usage_date, provider, model_id",
        )
        .bind(user_id.as_uuid())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DailyUsageRollup::from).collect())
    }

    async fn load_rounding_increment(&self) -> Result<Option<RoundingIncrement>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM ledger_settings WHERE key = $1")
                .bind(ROUNDING_INCREMENT_SETTING)
                .fetch_optional(&self.pool)
                .await?;

        value
            .map(|v| v.parse().map_err(|e| StoreError::Corrupt(format!("{e}"))))
            .transpose()
    }

    async fn save_rounding_increment(
        &self,
        increment: RoundingIncrement,
        updated_by: Option<UserId>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ledger_settings (key, value, updated_at, updated_by) \
             VALUES ($1, $2, now(), $3) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at, \
                 updated_by = EXCLUDED.updated_by",
        )
        .bind(ROUNDING_INCREMENT_SETTING)
        .bind(increment.to_string())
        .bind(updated_by.map(|u| *u.as_uuid()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// A transaction over [`PgLedgerStore`].
struct PgTx {
    tx: Transaction<'static, Postgres>,
    locked_balances: HashSet<UserId>,
    locked_deductions: HashSet<DeductionId>,
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn lock_balance(&mut self, user_id: &UserId) -> Result<CreditBalance> {
        sqlx::query("INSERT INTO credit_balances (user_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(user_id.as_uuid())
            .execute(&mut *self.tx)
            .await?;

        let row: BalanceRow = sqlx::query_as(&format!(
            "SELECT {BALANCE_COLUMNS} FROM credit_balances WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await?;

        self.locked_balances.insert(*user_id);
        Ok(row.into())
    }

    async fn write_balance(&mut self, balance: &CreditBalance) -> Result<()> {
        if !self.locked_balances.contains(&balance.user_id) {
            return Err(StoreError::NotLocked(format!("balance {}", balance.user_id)));
        }

        sqlx::query(
            "UPDATE credit_balances \
             SET amount = $2, last_deduction_at = $3, last_deduction_amount = $4, updated_at = $5 \
             WHERE user_id = $1",
        )
        .bind(balance.user_id.as_uuid())
        .bind(balance.amount)
        .bind(balance.last_deduction_at)
        .bind(balance.last_deduction_amount)
        .bind(balance.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_usage_record(&mut self, record: &UsageRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO usage_records ({USAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NULL, $15)"
        ))
        .bind(record.id.to_uuid())
        .bind(record.user_id.as_uuid())
        .bind(record.request_id.as_str())
        .bind(&record.model_id)
        .bind(&record.provider)
        .bind(to_i64(record.tokens.input)?)
        .bind(to_i64(record.tokens.output)?)
        .bind(to_i64(record.tokens.cached)?)
        .bind(record.vendor_cost)
        .bind(record.margin_multiplier)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_deduction(&mut self, entry: &DeductionLedgerEntry) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO deduction_ledger ({DEDUCTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(entry.id.to_uuid())
        .bind(entry.user_id.as_uuid())
        .bind(entry.usage_record_id.to_uuid())
        .bind(entry.request_id.as_str())
        .bind(entry.amount)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.vendor_cost)
        .bind(entry.margin_multiplier)
        .bind(entry.gross_margin)
        .bind(&entry.reason)
        .bind(entry.rounding_increment.as_decimal())
        .bind(entry.status.as_str())
        .bind(entry.processed_at)
        .bind(entry.reversed_at)
        .bind(entry.reversed_by.map(|u| *u.as_uuid()))
        .bind(entry.reversal_reason.as_deref())
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some("23505")
                    && db.constraint() == Some(REQUEST_ID_UNIQUE_INDEX) =>
            {
                Err(StoreError::DuplicateRequest {
                    request_id: entry.request_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn link_usage_record(
        &mut self,
        usage_record_id: &UsageRecordId,
        deduction_id: &DeductionId,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE usage_records SET deduction_id = $2 WHERE id = $1 AND deduction_id IS NULL",
        )
        .bind(usage_record_id.to_uuid())
        .bind(deduction_id.to_uuid())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(StoreError::Constraint(format!(
                "usage record {usage_record_id} is missing or already linked"
            )));
        }
        Ok(())
    }

    async fn record_daily_usage(&mut self, increment: &DailyUsageRollup) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_daily_rollups \
                (user_id, usage_date, model_id, provider, request_count, input_tokens, \
                 output_tokens, cached_tokens, credits_charged, vendor_cost) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (user_id, usage_date, model_id, provider) DO UPDATE SET \
                request_count = usage_daily_rollups.request_count + EXCLUDED.request_count, \
                input_tokens = usage_daily_rollups.input_tokens + EXCLUDED.input_tokens, \
                output_tokens = usage_daily_rollups.output_tokens + EXCLUDED.output_tokens, \
                cached_tokens = usage_daily_rollups.cached_tokens + EXCLUDED.cached_tokens, \
                credits_charged = usage_daily_rollups.credits_charged + EXCLUDED.credits_charged, \
                vendor_cost = usage_daily_rollups.vendor_cost + EXCLUDED.vendor_cost",
        )
        .bind(increment.user_id.as_uuid())
        .bind(increment.usage_date)
        .bind(&increment.model_id)
        .bind(&increment.provider)
        .bind(increment.request_count)
        .bind(increment.input_tokens)
        .bind(increment.output_tokens)
        .bind(increment.cached_tokens)
        .bind(increment.credits_charged)
        .bind(increment.vendor_cost)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_deduction(
        &mut self,
        deduction_id: &DeductionId,
    ) -> Result<Option<DeductionLedgerEntry>> {
        let row: Option<DeductionRow> = sqlx::query_as(&format!(
            "SELECT {DEDUCTION_COLUMNS} FROM deduction_ledger WHERE id = $1 FOR UPDATE"
        ))
        .bind(deduction_id.to_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        if row.is_some() {
            self.locked_deductions.insert(*deduction_id);
        }
        row.map(DeductionLedgerEntry::try_from).transpose()
    }

    async fn mark_reversed(
        &mut self,
        deduction_id: &DeductionId,
        reversal: &Reversal,
    ) -> Result<()> {
        if !self.locked_deductions.contains(deduction_id) {
            return Err(StoreError::NotLocked(format!("deduction {deduction_id}")));
        }

        let result = sqlx::query(
            "UPDATE deduction_ledger \
             SET status = $2, reversed_at = $3, reversed_by = $4, reversal_reason = $5 \
             WHERE id = $1 AND status = $6",
        )
        .bind(deduction_id.to_uuid())
        .bind(DeductionStatus::Reversed.as_str())
        .bind(reversal.reversed_at)
        .bind(reversal.reversed_by.as_uuid())
        .bind(&reversal.reason)
        .bind(DeductionStatus::Completed.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyReversed {
                deduction_id: *deduction_id,
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn millis(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::Constraint(format!("{value} overflows BIGINT")))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative token count {value}")))
}

#[derive(sqlx::FromRow)]
struct BalanceRow {
    user_id: Uuid,
    amount: Decimal,
    last_deduction_at: Option<DateTime<Utc>>,
    last_deduction_amount: Option<Decimal>,
    updated_at: DateTime<Utc>,
}

impl From<BalanceRow> for CreditBalance {
    fn from(row: BalanceRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
            last_deduction_at: row.last_deduction_at,
            last_deduction_amount: row.last_deduction_amount,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeductionRow {
    id: Uuid,
    user_id: Uuid,
    usage_record_id: Uuid,
    request_id: String,
    amount: Decimal,
    balance_before: Decimal,
    balance_after: Decimal,
    vendor_cost: Decimal,
    margin_multiplier: Decimal,
    gross_margin: Decimal,
    reason: String,
    rounding_increment: Decimal,
    status: String,
    processed_at: DateTime<Utc>,
    reversed_at: Option<DateTime<Utc>>,
    reversed_by: Option<Uuid>,
    reversal_reason: Option<String>,
}

impl TryFrom<DeductionRow> for DeductionLedgerEntry {
    type Error = StoreError;

    fn try_from(row: DeductionRow) -> Result<Self> {
        Ok(Self {
            id: DeductionId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            usage_record_id: UsageRecordId::from_uuid(row.usage_record_id),
            request_id: RequestId::new(row.request_id)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            vendor_cost: row.vendor_cost,
            margin_multiplier: row.margin_multiplier,
            gross_margin: row.gross_margin,
            reason: row.reason,
            rounding_increment: RoundingIncrement::try_from(row.rounding_increment)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            status: row
                .status
                .parse()
                .map_err(|e: credit_ledger_core::LedgerError| StoreError::Corrupt(e.to_string()))?,
            processed_at: row.processed_at,
            reversed_at: row.reversed_at,
            reversed_by: row.reversed_by.map(UserId::from_uuid),
            reversal_reason: row.reversal_reason,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    id: Uuid,
    user_id: Uuid,
    request_id: String,
    model_id: String,
    provider: String,
    input_tokens: i64,
    output_tokens: i64,
    cached_tokens: i64,
    vendor_cost: Decimal,
    margin_multiplier: Decimal,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    duration_ms: i64,
    status: String,
    deduction_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UsageRow> for UsageRecord {
    type Error = StoreError;

    fn try_from(row: UsageRow) -> Result<Self> {
        Ok(Self {
            id: UsageRecordId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            request_id: RequestId::new(row.request_id)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            model_id: row.model_id,
            provider: row.provider,
            tokens: TokenCounts {
                input: to_u64(row.input_tokens)?,
                output: to_u64(row.output_tokens)?,
                cached: to_u64(row.cached_tokens)?,
            },
            vendor_cost: row.vendor_cost,
            margin_multiplier: row.margin_multiplier,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            status: UsageStatus::parse(&row.status)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            deduction_id: row.deduction_id.map(DeductionId::from_uuid),
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RollupRow {
    user_id: Uuid,
    usage_date: NaiveDate,
    model_id: String,
    provider: String,
    request_count: i64,
    input_tokens: i64,
    output_tokens: i64,
    cached_tokens: i64,
    credits_charged: Decimal,
    vendor_cost: Decimal,
}

impl From<RollupRow> for DailyUsageRollup {
    fn from(row: RollupRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            usage_date: row.usage_date,
            model_id: row.model_id,
            provider: row.provider,
            request_count: row.request_count,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            cached_tokens: row.cached_tokens,
            credits_charged: row.credits_charged,
            vendor_cost: row.vendor_cost,
        }
    }
}
