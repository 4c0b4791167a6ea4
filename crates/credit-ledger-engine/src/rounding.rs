//! Rounding policy cache.
//!
//! The current increment lives in an atomic so that readers never block or
//! touch storage. The cached value may lag the persisted setting by at most
//! one reload interval in processes that did not perform the update
//! themselves; the process that performs an update sees it immediately.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use credit_ledger_core::{LedgerError, RoundingIncrement, UserId};
use credit_ledger_store::{LedgerStore, StoreError};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Cached rounding increment backed by the store's settings table.
pub struct RoundingPolicyCache {
    store: Arc<dyn LedgerStore>,
    current: AtomicU8,
}

impl RoundingPolicyCache {
    /// Create a cache holding `initial` until the first successful reload.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, initial: RoundingIncrement) -> Self {
        Self {
            store,
            current: AtomicU8::new(initial.code()),
        }
    }

    /// The increment in effect. No I/O.
    #[must_use]
    pub fn current_increment(&self) -> RoundingIncrement {
        RoundingIncrement::from_code(self.current.load(Ordering::Acquire)).unwrap_or_default()
    }

    fn set(&self, increment: RoundingIncrement) -> RoundingIncrement {
        let previous = self.current.swap(increment.code(), Ordering::AcqRel);
        RoundingIncrement::from_code(previous).unwrap_or_default()
    }

    /// Re-read the persisted increment.
    ///
    /// Read failures are logged and the last-known value is kept. A store with
    /// no persisted setting leaves the current value in place. Returns the
    /// increment in effect afterwards.
    pub async fn reload(&self) -> RoundingIncrement {
        if let Err(e) = self.try_reload().await {
            tracing::warn!(
                error = %e,
                increment = %self.current_increment(),
                "Rounding reload failed, keeping last-known increment"
            );
        }
        self.current_increment()
    }

    async fn try_reload(&self) -> Result<(), StoreError> {
        let Some(increment) = self.store.load_rounding_increment().await? else {
            tracing::debug!("No persisted rounding increment");
            return Ok(());
        };

        let previous = self.set(increment);
        if previous != increment {
            tracing::info!(%previous, %increment, "Rounding increment changed");
        }
        Ok(())
    }

    /// Validate, persist, and apply a new increment.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Configuration` if `increment` is not one of the
    /// allowed values; nothing is persisted in that case. Storage failures on
    /// the write map through the usual store error conversion.
    pub async fn update(
        &self,
        increment: Decimal,
        updated_by: Option<UserId>,
    ) -> Result<RoundingIncrement, LedgerError> {
        let increment = RoundingIncrement::try_from(increment)?;

        self.store
            .save_rounding_increment(increment, updated_by)
            .await?;

        if let Err(e) = self.try_reload().await {
            tracing::warn!(error = %e, "Reload after rounding update failed, applying locally");
            self.set(increment);
        }

        tracing::info!(
            %increment,
            updated_by = ?updated_by,
            "Rounding increment updated"
        );
        Ok(self.current_increment())
    }

    /// Reload on a fixed interval until the returned handle is aborted.
    pub fn spawn_periodic_reload(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.reload().await;
            }
        })
    }
}
