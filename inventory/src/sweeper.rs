//! Periodic reservation expiry sweeper.
//!
//! Walks every product partition on an interval (operators keep it at or
//! below a quarter of the minimum reservation TTL) and releases lapsed
//! reservations under the product lock, via the engine.

use crate::engine::StockEngine;
use crate::store::ProductStore;
use merx_core::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

/// The expiry sweeper task.
pub struct ExpirySweeper {
    engine: Arc<StockEngine>,
    store: Arc<dyn ProductStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl ExpirySweeper {
    /// Create a sweeper running every `interval`.
    #[must_use]
    pub fn new(
        engine: Arc<StockEngine>,
        store: Arc<dyn ProductStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            store,
            clock,
            interval,
        }
    }

    /// Run forever, sweeping every interval. Spawn as a background task.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis(), "Expiry sweeper started");

        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// One full pass over every product partition.
    ///
    /// Sweep failures on one product don't stop the pass; the next tick
    /// retries naturally.
    pub async fn sweep_once(&self) {
        let ids = match self.store.list_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::error!(error = %err, "Sweeper could not list products");
                return;
            }
        };

        let now = self.clock.now();
        let mut released = 0usize;
        for product_id in ids {
            match self.engine.expire_due(product_id, now).await {
                Ok(expired) => released += expired.len(),
                Err(err) => {
                    tracing::warn!(product_id = %product_id, error = %err, "Sweep failed for product");
                }
            }
        }

        if released > 0 {
            tracing::info!(released, "Expiry sweep released lapsed reservations");
        }
    }
}
