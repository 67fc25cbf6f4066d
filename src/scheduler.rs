//! Opens one batch per cycle covering every watched artist at every retailer.
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::config::SchedulerConfig;
use crate::ledger;
use crate::model::{distinct_artists, ScanRequest};
use crate::queue::WorkQueue;
use crate::store::PipelineStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No retailers or nobody watching anything.
    Idle,
    Scheduled { batch_id: i64, required: i64 },
}

pub struct Scheduler {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn WorkQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn WorkQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn schedule_cycle(&self) -> Result<CycleOutcome> {
        let retailers = self.store.retailers().await?;
        let watches = self.store.watched_artists().await?;
        let artists = distinct_artists(&watches);
        if retailers.is_empty() || artists.is_empty() {
            info!(
                retailers = retailers.len(),
                artists = artists.len(),
                "nothing to schedule"
            );
            return Ok(CycleOutcome::Idle);
        }
        let required = (artists.len() * retailers.len()) as i64;

        let mut tx = self.store.begin().await?;
        let batch_id = match ledger::open_batch(tx.as_mut(), &watches, required).await {
            Ok(id) => id,
            Err(e) => {
                tx.rollback().await?;
                return Err(e.context("failed to open batch"));
            }
        };
        tx.commit().await?;

        for (artist_id, artist_name) in &artists {
            for retailer in &retailers {
                let req = ScanRequest {
                    batch_id,
                    artist_id: *artist_id,
                    artist_name: artist_name.clone(),
                    retailer_id: retailer.id,
                    retailer_name: retailer.name.clone(),
                };
                if let Err(e) = self.queue.enqueue(&req).await {
                    error!(batch_id, error = %e, "enqueue failed; removing batch");
                    if let Err(del) = self.store.delete_batch(batch_id).await {
                        error!(batch_id, error = %del, "failed to remove batch after enqueue failure");
                    }
                    return Err(e).with_context(|| {
                        format!("failed to enqueue scan of {artist_name} at {}", retailer.name)
                    });
                }
            }
        }

        info!(
            batch_id,
            required,
            users = watches.len(),
            artists = artists.len(),
            retailers = retailers.len(),
            "batch scheduled"
        );
        Ok(CycleOutcome::Scheduled { batch_id, required })
    }

    /// Wait the startup delay, then run a cycle every interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = tokio::time::sleep(self.config.startup_delay) => {}
        }
        loop {
            if let Err(e) = self.schedule_cycle().await {
                error!(error = ?e, "schedule cycle failed");
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}
