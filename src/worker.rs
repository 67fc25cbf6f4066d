//! Scan worker: turns one queued artist/retailer pair into ledger rows, report
//! attachments and exactly one completion tick on the batch.
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog;
use crate::config::WorkerConfig;
use crate::error::PipelineError;
use crate::ledger::{self, Completion};
use crate::model::{Candidate, NewSku, ScanRequest};
use crate::queue::{Delivery, WorkQueue};
use crate::retailers::{scrape_with_timeout, ScraperRegistry};
use crate::store::{PipelineStore, PipelineTx};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub candidates: usize,
    pub unchanged: usize,
    pub new_listings: usize,
    pub sold_out: usize,
    pub attached: u64,
    pub swept: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub completion: Completion,
    pub stats: ReconcileStats,
    /// Scrape or reconcile failed; the search was still counted.
    pub degraded: bool,
}

pub struct ScanWorker {
    store: Arc<dyn PipelineStore>,
    queue: Arc<dyn WorkQueue>,
    scrapers: ScraperRegistry,
    config: WorkerConfig,
}

impl ScanWorker {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        queue: Arc<dyn WorkQueue>,
        scrapers: ScraperRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            scrapers,
            config,
        }
    }

    /// Scrape and reconcile one request, then count it towards its batch.
    #[instrument(skip(self, req), fields(batch_id = req.batch_id, artist_id = req.artist_id, retailer_id = req.retailer_id))]
    pub async fn process_scan_request(&self, req: &ScanRequest) -> Result<ScanOutcome> {
        let artist = req.artist_name.trim().to_lowercase();
        let scraped = match self.scrapers.get(req.retailer_id) {
            Ok(scraper) => {
                debug!(url = %scraper.query_url(&artist), "scraping");
                scrape_with_timeout(
                    scraper.as_ref(),
                    &req.retailer_name,
                    &artist,
                    self.config.scrape_timeout,
                )
                .await
            }
            Err(e) => Err(e.into()),
        };
        let candidates = match scraped {
            Ok(c) => Some(c),
            Err(e) => {
                error!(retailer = %req.retailer_name, artist = %artist, error = %e, "scrape failed; counting search without results");
                None
            }
        };

        let mut tx = self.store.begin().await?;
        let mut degraded = candidates.is_none();
        let mut stats = ReconcileStats::default();
        if let Some(candidates) = &candidates {
            match reconcile(tx.as_mut(), req, candidates).await {
                Ok(s) => stats = s,
                Err(e) => {
                    error!(error = ?e, "reconcile failed; rolling back and counting search only");
                    tx.rollback().await?;
                    tx = self.store.begin().await?;
                    degraded = true;
                }
            }
        }

        match ledger::complete_search(tx.as_mut(), req).await {
            Ok(Completion::Duplicate) => {
                // Already counted by an earlier delivery. Its batch may have been
                // reported, so nothing this pass observed may reach the ledger.
                tx.rollback().await?;
                Ok(ScanOutcome {
                    completion: Completion::Duplicate,
                    stats: ReconcileStats::default(),
                    degraded,
                })
            }
            Ok(completion) => {
                tx.commit().await?;
                Ok(ScanOutcome {
                    completion,
                    stats,
                    degraded,
                })
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Take one item off the queue and process it. Returns `None` when the queue
    /// had nothing for a non-blocking dequeue.
    pub async fn work_once(&self, blocking: bool) -> Result<Option<ScanOutcome>> {
        let Some(delivery) = self.queue.dequeue(blocking).await? else {
            return Ok(None);
        };
        self.handle(delivery).await.map(Some)
    }

    /// Process a dequeued item and ack it once it is accounted for.
    async fn handle(&self, delivery: Delivery) -> Result<ScanOutcome> {
        match self.process_scan_request(&delivery.request).await {
            Ok(outcome) => {
                self.queue.ack(&delivery).await?;
                info!(
                    batch_id = delivery.request.batch_id,
                    artist = %delivery.request.artist_name,
                    retailer = %delivery.request.retailer_name,
                    new_listings = outcome.stats.new_listings,
                    attached = outcome.stats.attached,
                    swept = outcome.stats.swept,
                    "scan complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                // A batch that is gone or already full will never accept this
                // search; anything else is left for redelivery.
                match e.downcast_ref::<PipelineError>() {
                    Some(PipelineError::BatchNotFound(_)) => {
                        error!(error = %e, "dropping scan for missing batch");
                        self.queue.ack(&delivery).await?;
                    }
                    Some(PipelineError::BatchAlreadyComplete(_)) => {
                        warn!(error = %e, "dropping scan for full batch");
                        self.queue.ack(&delivery).await?;
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    /// Run `concurrency` dequeue loops until `shutdown` flips to true.
    ///
    /// Shutdown only interrupts a loop while it waits on the queue. An item
    /// already dequeued is processed and acked before the loop exits.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut set = JoinSet::new();
        for slot in 0..self.config.concurrency {
            let worker = self.clone();
            let mut shutdown = shutdown.clone();
            set.spawn(async move {
                info!(slot, "scan loop started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let dequeued = tokio::select! {
                        _ = shutdown.changed() => break,
                        res = worker.queue.dequeue(true) => res,
                    };
                    let res = match dequeued {
                        Ok(Some(delivery)) => worker.handle(delivery).await.map(|_| ()),
                        Ok(None) => Ok(()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = res {
                        warn!(slot, error = ?e, "scan failed; backing off");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(worker.config.error_backoff) => {}
                        }
                    }
                }
                info!(slot, "scan loop stopped");
            });
        }
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "scan loop panicked");
            }
        }
        Ok(())
    }
}

/// Apply one scrape's candidates to the ledger and fan new finds out to reports.
pub async fn reconcile(
    tx: &mut dyn PipelineTx,
    req: &ScanRequest,
    candidates: &[Candidate],
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats {
        candidates: candidates.len(),
        ..Default::default()
    };
    let mut seen: HashSet<i64> = HashSet::new();

    for c in candidates {
        let title = c.title.trim();
        if title.is_empty() {
            continue;
        }
        let release = tx.upsert_release(req.artist_id, title).await?;
        seen.insert(release.id);

        let (sku, same) = catalog::upsert_sku(
            tx,
            NewSku {
                release_id: release.id,
                retailer_id: req.retailer_id,
                artist_id: req.artist_id,
                item_url: c.item_url.clone(),
                image_url: c.image_url.clone(),
                price: c.price.clone(),
            },
        )
        .await?;
        if same {
            stats.unchanged += 1;
            continue;
        }
        if sku.is_sold_out() {
            stats.sold_out += 1;
            continue;
        }
        stats.new_listings += 1;
        match ledger::fan_out(tx, req.batch_id, req.artist_id, sku.id).await {
            Ok(n) => stats.attached += n,
            Err(e) if matches!(e.downcast_ref::<PipelineError>(), Some(PipelineError::NoReportsForArtist { .. })) => {
                error!(sku_id = sku.id, error = %e, "new listing has nowhere to go");
            }
            Err(e) => return Err(e),
        }
    }

    stats.swept = catalog::sweep_sold_out(tx, req.artist_id, req.retailer_id, &seen)
        .await?
        .len();
    Ok(stats)
}
