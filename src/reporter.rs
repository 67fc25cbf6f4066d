//! Report builder: sends digests for batches whose searches have all finished.
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::ReporterConfig;
use crate::digest;
use crate::model::{Batch, PendingReport};
use crate::notify::Notifier;
use crate::store::PipelineStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub sent: usize,
    pub deleted: usize,
    pub failed: usize,
    pub batches_finalised: usize,
}

pub struct ReportBuilder {
    store: Arc<dyn PipelineStore>,
    notifier: Arc<dyn Notifier>,
    config: ReporterConfig,
}

impl ReportBuilder {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        notifier: Arc<dyn Notifier>,
        config: ReporterConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Send or delete every pending report of every complete batch. A batch is
    /// stamped reported only when all of its reports went out in this pass;
    /// otherwise its remaining reports are retried on the next call.
    pub async fn drain_completed_batches(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();

        let mut by_batch: BTreeMap<i64, Vec<PendingReport>> = BTreeMap::new();
        for r in self.store.completed_unsent_reports().await? {
            by_batch.entry(r.batch_id).or_default().push(r);
        }

        for (batch_id, reports) in by_batch {
            let mut failed = false;
            for report in &reports {
                match self.finish_report(report).await {
                    Ok(true) => summary.sent += 1,
                    Ok(false) => summary.deleted += 1,
                    Err(e) => {
                        error!(batch_id, report_id = report.report_id, error = ?e, "report not sent");
                        summary.failed += 1;
                        failed = true;
                    }
                }
            }
            if failed {
                warn!(batch_id, "batch has unsent reports; retrying next poll");
                continue;
            }
            if self.store.mark_batch_reported(batch_id).await? {
                info!(batch_id, reports = reports.len(), "batch reported");
                summary.batches_finalised += 1;
            }
        }

        for batch_id in self.store.drained_batches().await? {
            if self.store.mark_batch_reported(batch_id).await? {
                info!(batch_id, "batch had no reports left; marked reported");
                summary.batches_finalised += 1;
            }
        }
        Ok(summary)
    }

    /// Returns true if the report was sent, false if it was empty and deleted.
    async fn finish_report(&self, report: &PendingReport) -> Result<bool> {
        let skus = self.store.skus_for_report(report.report_id).await?;
        if skus.is_empty() {
            self.store.delete_report(report.report_id).await?;
            return Ok(false);
        }
        let html = digest::render(&report.user_name, &skus);
        self.notifier
            .send(&report.user_email, &self.config.subject, &html)
            .await?;
        self.store.mark_report_sent(report.report_id).await?;
        Ok(true)
    }

    /// Log batches that have been waiting on searches for longer than the
    /// stall threshold.
    pub async fn check_stalled(&self) -> Result<Vec<Batch>> {
        let stalled_after = chrono::Duration::from_std(self.config.stalled_after)?;
        let stalled = self.store.stalled_batches(Utc::now() - stalled_after).await?;
        for b in &stalled {
            warn!(
                batch_id = b.id,
                completed = b.completed_searches,
                required = b.required_searches,
                created_at = %b.created_at,
                "batch stalled"
            );
        }
        Ok(stalled)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            match self.drain_completed_batches().await {
                Ok(s) if s != DrainSummary::default() => {
                    info!(sent = s.sent, deleted = s.deleted, failed = s.failed, finalised = s.batches_finalised, "drain pass");
                }
                Ok(_) => {}
                Err(e) => error!(error = ?e, "drain pass failed"),
            }
            if let Err(e) = self.check_stalled().await {
                error!(error = ?e, "stalled batch check failed");
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.poll) => {}
            }
        }
        info!("report builder stopped");
        Ok(())
    }
}
