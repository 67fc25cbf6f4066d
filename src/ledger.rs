//! Batch lifecycle: opening a batch with its report shells, attaching new skus
//! to the reports that cover an artist, and counting completed searches.
use anyhow::Result;
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::model::{ScanRequest, WatchMap};
use crate::store::PipelineTx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The batch counter moved by one.
    Counted,
    /// This (batch, artist, retailer) had already been counted, e.g. a redelivery.
    Duplicate,
}

/// Create the batch plus one report per watching user and a snapshot of the
/// artists each report covers. Returns the batch id.
pub async fn open_batch(
    tx: &mut dyn PipelineTx,
    watches: &WatchMap,
    required_searches: i64,
) -> Result<i64> {
    let batch_id = tx.insert_batch(required_searches).await?;
    for (user_id, artists) in watches {
        let report_id = tx.insert_report(batch_id, *user_id).await?;
        for artist in artists {
            tx.insert_report_artist(batch_id, report_id, artist.artist_id)
                .await?;
        }
    }
    debug!(batch_id, reports = watches.len(), "opened batch");
    Ok(batch_id)
}

/// Attach a sku to every report in the batch that covers the artist.
pub async fn fan_out(
    tx: &mut dyn PipelineTx,
    batch_id: i64,
    artist_id: i64,
    sku_id: i64,
) -> Result<u64> {
    let report_ids = tx.reports_covering_artist(batch_id, artist_id).await?;
    if report_ids.is_empty() {
        return Err(PipelineError::NoReportsForArtist {
            batch_id,
            artist_id,
        }
        .into());
    }
    tx.attach_sku_to_reports(sku_id, &report_ids).await
}

/// Count one finished search towards its batch. Must be the last write of the
/// transaction that reconciled the scan.
pub async fn complete_search(tx: &mut dyn PipelineTx, req: &ScanRequest) -> Result<Completion> {
    let Some(batch) = tx.batch(req.batch_id).await? else {
        return Err(PipelineError::BatchNotFound(req.batch_id).into());
    };
    if !tx
        .record_completion(req.batch_id, req.artist_id, req.retailer_id)
        .await?
    {
        warn!(
            batch_id = req.batch_id,
            artist_id = req.artist_id,
            retailer_id = req.retailer_id,
            "search already counted"
        );
        return Ok(Completion::Duplicate);
    }
    if tx.increment_completed(req.batch_id).await? == 0 {
        if batch.is_complete() {
            return Err(PipelineError::BatchAlreadyComplete(req.batch_id).into());
        }
        return Err(PipelineError::BatchNotFound(req.batch_id).into());
    }
    Ok(Completion::Counted)
}
