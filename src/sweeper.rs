//! Orphaned-file sweeper: retries storage deletions whose DB rows are
//! already gone.
//!
//! Rows that exhaust their retry budget stay visible in the table but are
//! no longer picked up: resolving those is an operator action.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::storage::ObjectStore;
use crate::store::Store;

pub struct OrphanSweeper {
    store: Arc<Store>,
    storage: Arc<dyn ObjectStore>,
    interval: Duration,
    batch_size: u32,
    max_retries: u32,
}

impl OrphanSweeper {
    pub fn new(
        store: Arc<Store>,
        storage: Arc<dyn ObjectStore>,
        interval: Duration,
        batch_size: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            storage,
            interval,
            batch_size,
            max_retries,
        }
    }

    /// Run one pass at boot, then hourly (configurable) until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!("orphan sweep failed: {e}");
                    }
                }
            }
        }

        tracing::info!("orphan sweeper stopped");
    }

    /// One sweep: fetch a batch of live orphans and retry each deletion.
    pub async fn sweep_once(&self) -> Result<SweepReport, crate::error::KilnError> {
        let batch = self
            .store
            .orphan_batch(self.batch_size, self.max_retries)
            .await?;
        let mut report = SweepReport::default();

        for orphan in batch {
            match self.storage.delete(&orphan.s3_key).await {
                Ok(()) => {
                    self.store.orphan_deleted(&orphan.id).await?;
                    report.deleted += 1;
                }
                Err(e) => {
                    self.store
                        .orphan_failed(&orphan.id, &e.user_message())
                        .await?;
                    report.failed += 1;
                    tracing::warn!(
                        key = orphan.s3_key,
                        retry_count = orphan.retry_count + 1,
                        "orphan deletion failed: {e}"
                    );
                }
            }
        }

        if report.deleted + report.failed > 0 {
            tracing::info!(
                deleted = report.deleted,
                failed = report.failed,
                "orphan sweep finished"
            );
        }
        Ok(report)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub deleted: u32,
    pub failed: u32,
}
