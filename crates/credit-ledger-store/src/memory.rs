//! In-memory storage implementation.
//!
//! `MemoryStore` keeps committed state behind a mutex and serializes writers
//! with one async lock per balance row and per ledger entry. A transaction
//! stages its writes locally and applies them in one step at commit, so a
//! dropped or rolled-back transaction leaves no trace.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use credit_ledger_core::{
    CreditBalance, DailyUsageRollup, DateRange, DeductionId, DeductionLedgerEntry, RequestId,
    Reversal, RoundingIncrement, UsageRecord, UsageRecordId, UserId,
};
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;

use crate::error::{Result, StoreError};
use crate::{LedgerStore, LedgerTx, TxOptions};

/// Lockable rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Balance(UserId),
    Deduction(DeductionId),
}

#[derive(Debug, Default)]
struct MemoryState {
    balances: HashMap<UserId, CreditBalance>,
    deductions: BTreeMap<DeductionId, DeductionLedgerEntry>,
    request_ids: HashSet<RequestId>,
    usage_records: HashMap<UsageRecordId, UsageRecord>,
    rollups: Vec<DailyUsageRollup>,
    rounding_increment: Option<RoundingIncrement>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<MemoryState>,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_for(&self, key: LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }

    /// Forget row locks that no transaction holds or waits on.
    ///
    /// Holders and waiters keep a clone of the lock, and clones are only taken
    /// under the table mutex, so a count of one means the table is the last
    /// reference.
    fn prune_locks(&self, keys: impl IntoIterator<Item = LockKey>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Row locks held by one transaction.
///
/// Dropping releases every guard, then prunes the rows from the lock table.
struct HeldLocks {
    inner: Arc<Inner>,
    guards: HashMap<LockKey, OwnedMutexGuard<()>>,
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        let keys: Vec<LockKey> = self.guards.drain().map(|(key, _guard)| key).collect();
        self.inner.prune_locks(keys);
    }
}

/// In-memory ledger store.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a user's committed balance.
    ///
    /// This bypasses row locks and exists to seed fixtures; the engine never
    /// calls it.
    pub fn set_balance(&self, user_id: UserId, amount: Decimal) {
        let mut state = self.inner.state();
        let now = Utc::now();
        let balance = state
            .balances
            .entry(user_id)
            .or_insert_with(|| CreditBalance::empty(user_id));
        balance.amount = amount;
        balance.updated_at = now;
    }

    /// Every committed ledger entry, in id order.
    #[must_use]
    pub fn all_deductions(&self) -> Vec<DeductionLedgerEntry> {
        self.inner.state().deductions.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self, options: TxOptions) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryTx::new(Arc::clone(&self.inner), options)))
    }

    async fn get_balance(&self, user_id: &UserId) -> Result<Option<CreditBalance>> {
        Ok(self.inner.state().balances.get(user_id).cloned())
    }

    async fn get_deduction(
        &self,
        deduction_id: &DeductionId,
    ) -> Result<Option<DeductionLedgerEntry>> {
        Ok(self.inner.state().deductions.get(deduction_id).cloned())
    }

    async fn get_usage_record(
        &self,
        usage_record_id: &UsageRecordId,
    ) -> Result<Option<UsageRecord>> {
        Ok(self.inner.state().usage_records.get(usage_record_id).cloned())
    }

    async fn list_deductions(
        &self,
        user_id: &UserId,
        range: &DateRange,
        limit: usize,
    ) -> Result<Vec<DeductionLedgerEntry>> {
        let state = self.inner.state();
        let mut entries: Vec<_> = state
            .deductions
            .values()
            .filter(|e| e.user_id == *user_id && range.contains(e.processed_at))
            .cloned()
            .collect();

        entries.sort_by(|a, b| {
            b.processed_at
                .cmp(&a.processed_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn list_daily_usage(
        &self,
        user_id: &UserId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyUsageRollup>> {
        let state = self.inner.state();
        let mut rollups: Vec<_> = state
            .rollups
            .iter()
            .filter(|r| r.user_id == *user_id && r.usage_date >= from && r.usage_date <= to)
            .cloned()
            .collect();

        rollups.sort_by(|a, b| {
            a.usage_date
                .cmp(&b.usage_date)
                .then_with(|| a.provider.cmp(&b.provider))
                .then_with(|| a.model_id.cmp(&b.model_id))
        });
        Ok(rollups)
    }

    async fn load_rounding_increment(&self) -> Result<Option<RoundingIncrement>> {
        Ok(self.inner.state().rounding_increment)
    }

    async fn save_rounding_increment(
        &self,
        increment: RoundingIncrement,
        _updated_by: Option<UserId>,
    ) -> Result<()> {
        self.inner.state().rounding_increment = Some(increment);
        Ok(())
    }
}

/// A transaction over [`MemoryStore`].
///
/// Statement timeouts do not apply; every staged write is a map insert.
struct MemoryTx {
    inner: Arc<Inner>,
    options: TxOptions,
    locks: HeldLocks,
    balances: HashMap<UserId, CreditBalance>,
    usage_records: Vec<UsageRecord>,
    deductions: Vec<DeductionLedgerEntry>,
    links: Vec<(UsageRecordId, DeductionId)>,
    reversals: Vec<(DeductionId, Reversal)>,
    rollups: Vec<DailyUsageRollup>,
}

impl MemoryTx {
    fn new(inner: Arc<Inner>, options: TxOptions) -> Self {
        Self {
            locks: HeldLocks {
                inner: Arc::clone(&inner),
                guards: HashMap::new(),
            },
            inner,
            options,
            balances: HashMap::new(),
            usage_records: Vec::new(),
            deductions: Vec::new(),
            links: Vec::new(),
            reversals: Vec::new(),
            rollups: Vec::new(),
        }
    }

    async fn acquire(&mut self, key: LockKey) -> Result<()> {
        if self.holds(key) {
            return Ok(());
        }

        let lock = self.inner.lock_for(key);
        let acquired = tokio::time::timeout(self.options.lock_timeout, lock.lock_owned()).await;
        let Ok(guard) = acquired else {
            self.inner.prune_locks([key]);
            return Err(StoreError::LockTimeout);
        };
        self.locks.guards.insert(key, guard);
        Ok(())
    }

    fn holds(&self, key: LockKey) -> bool {
        self.locks.guards.contains_key(&key)
    }

    fn staged_request(&self, request_id: &RequestId) -> bool {
        self.deductions.iter().any(|e| e.request_id == *request_id)
    }

    fn staged_deduction(&self, deduction_id: &DeductionId) -> Option<&DeductionLedgerEntry> {
        self.deductions.iter().find(|e| e.id == *deduction_id)
    }

    fn staged_reversal(&self, deduction_id: &DeductionId) -> Option<&Reversal> {
        self.reversals
            .iter()
            .find(|(id, _)| id == deduction_id)
            .map(|(_, r)| r)
    }
}

/// Mirror of the table constraints on `deduction_ledger`.
fn check_entry(entry: &DeductionLedgerEntry) -> Result<()> {
    if entry.amount <= Decimal::ZERO {
        return Err(StoreError::Constraint(format!(
            "deduction amount must be positive, got {}",
            entry.amount
        )));
    }
    if entry.balance_after != entry.balance_before - entry.amount {
        return Err(StoreError::Constraint(
            "balance_after must equal balance_before - amount".into(),
        ));
    }
    if entry.balance_after < Decimal::ZERO {
        return Err(StoreError::Constraint(
            "balance_after must not be negative".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_balance(&mut self, user_id: &UserId) -> Result<CreditBalance> {
        self.acquire(LockKey::Balance(*user_id)).await?;

        if let Some(staged) = self.balances.get(user_id) {
            return Ok(staged.clone());
        }

        let balance = self
            .inner
            .state()
            .balances
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| CreditBalance::empty(*user_id));
        self.balances.insert(*user_id, balance.clone());
        Ok(balance)
    }

    async fn write_balance(&mut self, balance: &CreditBalance) -> Result<()> {
        if !self.holds(LockKey::Balance(balance.user_id)) {
            return Err(StoreError::NotLocked(format!("balance {}", balance.user_id)));
        }
        if balance.amount < Decimal::ZERO {
            return Err(StoreError::Constraint(format!(
                "balance must not be negative, got {}",
                balance.amount
            )));
        }
        self.balances.insert(balance.user_id, balance.clone());
        Ok(())
    }

    async fn insert_usage_record(&mut self, record: &UsageRecord) -> Result<()> {
        let exists = self.usage_records.iter().any(|r| r.id == record.id)
            || self.inner.state().usage_records.contains_key(&record.id);
        if exists {
            return Err(StoreError::Constraint(format!(
                "usage record {} already exists",
                record.id
            )));
        }
        self.usage_records.push(record.clone());
        Ok(())
    }

    async fn insert_deduction(&mut self, entry: &DeductionLedgerEntry) -> Result<()> {
        let (committed_request, committed_record) = {
            let state = self.inner.state();
            (
                state.request_ids.contains(&entry.request_id),
                state.usage_records.contains_key(&entry.usage_record_id),
            )
        };

        if committed_request || self.staged_request(&entry.request_id) {
            return Err(StoreError::DuplicateRequest {
                request_id: entry.request_id.clone(),
            });
        }
        let staged_record = self
            .usage_records
            .iter()
            .any(|r| r.id == entry.usage_record_id);
        if !committed_record && !staged_record {
            return Err(StoreError::Constraint(format!(
                "usage record {} does not exist",
                entry.usage_record_id
            )));
        }
        check_entry(entry)?;

        self.deductions.push(entry.clone());
        Ok(())
    }

    async fn link_usage_record(
        &mut self,
        usage_record_id: &UsageRecordId,
        deduction_id: &DeductionId,
    ) -> Result<()> {
        if self.staged_deduction(deduction_id).is_none()
            && !self.inner.state().deductions.contains_key(deduction_id)
        {
            return Err(StoreError::Constraint(format!(
                "deduction {deduction_id} does not exist"
            )));
        }
        if self.links.iter().any(|(_, d)| d == deduction_id) {
            return Err(StoreError::Constraint(format!(
                "deduction {deduction_id} is already linked"
            )));
        }

        if let Some(record) = self.usage_records.iter_mut().find(|r| r.id == *usage_record_id) {
            if record.deduction_id.is_some() {
                return Err(StoreError::Constraint(format!(
                    "usage record {usage_record_id} is already linked"
                )));
            }
            record.deduction_id = Some(*deduction_id);
            self.links.push((*usage_record_id, *deduction_id));
            return Ok(());
        }

        match self.inner.state().usage_records.get(usage_record_id) {
            Some(record) if record.deduction_id.is_none() => {}
            Some(_) => {
                return Err(StoreError::Constraint(format!(
                    "usage record {usage_record_id} is already linked"
                )));
            }
            None => {
                return Err(StoreError::Constraint(format!(
                    "usage record {usage_record_id} does not exist"
                )));
            }
        }
        self.links.push((*usage_record_id, *deduction_id));
        Ok(())
    }

    async fn record_daily_usage(&mut self, increment: &DailyUsageRollup) -> Result<()> {
        match self.rollups.iter_mut().find(|r| r.same_bucket(increment)) {
            Some(bucket) => bucket.absorb(increment),
            None => self.rollups.push(increment.clone()),
        }
        Ok(())
    }

    async fn lock_deduction(
        &mut self,
        deduction_id: &DeductionId,
    ) -> Result<Option<DeductionLedgerEntry>> {
        self.acquire(LockKey::Deduction(*deduction_id)).await?;

        let mut entry = match self.staged_deduction(deduction_id) {
            Some(staged) => Some(staged.clone()),
            None => self.inner.state().deductions.get(deduction_id).cloned(),
        };
        if let (Some(entry), Some(reversal)) = (entry.as_mut(), self.staged_reversal(deduction_id))
        {
            entry.apply_reversal(reversal).map_err(|_| StoreError::AlreadyReversed {
                deduction_id: *deduction_id,
            })?;
        }
        Ok(entry)
    }

    async fn mark_reversed(
        &mut self,
        deduction_id: &DeductionId,
        reversal: &Reversal,
    ) -> Result<()> {
        if !self.holds(LockKey::Deduction(*deduction_id)) {
            return Err(StoreError::NotLocked(format!("deduction {deduction_id}")));
        }

        let committed = self.inner.state().deductions.get(deduction_id).cloned();
        let entry = match committed {
            Some(entry) => entry,
            None => self.staged_deduction(deduction_id).cloned().ok_or_else(|| {
                StoreError::NotFound {
                    entity: "deduction",
                    id: deduction_id.to_string(),
                }
            })?,
        };
        if entry.is_reversed() || self.staged_reversal(deduction_id).is_some() {
            return Err(StoreError::AlreadyReversed {
                deduction_id: *deduction_id,
            });
        }

        self.reversals.push((*deduction_id, reversal.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.inner.state();

        for entry in &this.deductions {
            if state.request_ids.contains(&entry.request_id) {
                return Err(StoreError::DuplicateRequest {
                    request_id: entry.request_id.clone(),
                });
            }
        }
        if let Some(negative) = this.balances.values().find(|b| b.amount < Decimal::ZERO) {
            return Err(StoreError::Constraint(format!(
                "balance for {} would be negative",
                negative.user_id
            )));
        }
        for (deduction_id, _) in &this.reversals {
            if state.deductions.get(deduction_id).is_some_and(DeductionLedgerEntry::is_reversed) {
                return Err(StoreError::AlreadyReversed {
                    deduction_id: *deduction_id,
                });
            }
        }

        for (user_id, balance) in this.balances {
            state.balances.insert(user_id, balance);
        }
        for record in this.usage_records {
            state.usage_records.insert(record.id, record);
        }
        for entry in this.deductions {
            state.request_ids.insert(entry.request_id.clone());
            state.deductions.insert(entry.id, entry);
        }
        for (usage_record_id, deduction_id) in this.links {
            if let Some(record) = state.usage_records.get_mut(&usage_record_id) {
                record.deduction_id = Some(deduction_id);
            }
        }
        for (deduction_id, reversal) in &this.reversals {
            if let Some(entry) = state.deductions.get_mut(deduction_id) {
                entry.apply_reversal(reversal).map_err(|_| StoreError::AlreadyReversed {
                    deduction_id: *deduction_id,
                })?;
            }
        }
        for increment in this.rollups {
            match state.rollups.iter_mut().find(|r| r.same_bucket(&increment)) {
                Some(bucket) => bucket.absorb(&increment),
                None => state.rollups.push(increment),
            }
        }

        drop(state);
        drop(this.locks);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}
