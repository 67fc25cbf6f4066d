//! Persistence seam for the catalog and batch ledger.
//!
//! `PipelineStore` covers reads and single-statement writes. Anything that has to
//! land atomically (opening a batch, reconciling one scan) goes through a
//! `PipelineTx` obtained from [`PipelineStore::begin`]; nothing is visible to
//! other callers until [`PipelineTx::commit`].
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Batch, NewSku, PendingReport, Release, ReportedSku, Retailer, Sku, WatchMap};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn PipelineTx>>;

    /// All retailers, ordered by id.
    async fn retailers(&self) -> Result<Vec<Retailer>>;

    /// Every user with at least one watched artist, artists ordered by id.
    async fn watched_artists(&self) -> Result<WatchMap>;

    /// Remove a batch together with its reports, report artists, attached skus
    /// and recorded completions.
    async fn delete_batch(&self, batch_id: i64) -> Result<()>;

    async fn batch(&self, batch_id: i64) -> Result<Option<Batch>>;

    /// Newest first.
    async fn recent_batches(&self, limit: i64) -> Result<Vec<Batch>>;

    /// Unreported batches created before `cutoff` that still have outstanding searches.
    async fn stalled_batches(&self, cutoff: DateTime<Utc>) -> Result<Vec<Batch>>;

    /// Reports with `completed_at IS NULL` whose batch is complete and unreported,
    /// ordered by batch then report id.
    async fn completed_unsent_reports(&self) -> Result<Vec<PendingReport>>;

    async fn skus_for_report(&self, report_id: i64) -> Result<Vec<ReportedSku>>;

    /// Sets `sent_at` and `completed_at`. Fails with `ReportNotFound` when no row matched.
    async fn mark_report_sent(&self, report_id: i64) -> Result<()>;

    async fn delete_report(&self, report_id: i64) -> Result<()>;

    /// Stamp `reported_at` on a complete batch. Returns false if the batch was
    /// already reported, incomplete or missing.
    async fn mark_batch_reported(&self, batch_id: i64) -> Result<bool>;

    /// Complete, unreported batches with no pending reports left.
    async fn drained_batches(&self) -> Result<Vec<i64>>;
}

#[async_trait]
pub trait PipelineTx: Send {
    async fn insert_batch(&mut self, required_searches: i64) -> Result<i64>;
    async fn insert_report(&mut self, batch_id: i64, user_id: i64) -> Result<i64>;
    async fn insert_report_artist(&mut self, batch_id: i64, report_id: i64, artist_id: i64)
        -> Result<()>;

    /// Create the release if absent, otherwise touch `updated_at`.
    async fn upsert_release(&mut self, artist_id: i64, title: &str) -> Result<Release>;

    /// Newest ledger row for the pair (`created_at DESC, id DESC`).
    async fn current_sku(&mut self, release_id: i64, retailer_id: i64) -> Result<Option<Sku>>;
    async fn insert_sku(&mut self, sku: &NewSku) -> Result<Sku>;

    /// Newest ledger row of every release this artist has at this retailer.
    async fn current_skus_for_artist_retailer(
        &mut self,
        artist_id: i64,
        retailer_id: i64,
    ) -> Result<Vec<Sku>>;

    async fn reports_covering_artist(&mut self, batch_id: i64, artist_id: i64)
        -> Result<Vec<i64>>;

    /// Attach a sku to each report. Already-attached pairs are ignored; returns rows added.
    async fn attach_sku_to_reports(&mut self, sku_id: i64, report_ids: &[i64]) -> Result<u64>;

    /// Returns true when this (batch, artist, retailer) had not been recorded yet.
    async fn record_completion(
        &mut self,
        batch_id: i64,
        artist_id: i64,
        retailer_id: i64,
    ) -> Result<bool>;

    /// `completed_searches + 1` guarded by `completed_searches < req_searches`.
    /// Returns the affected row count.
    async fn increment_completed(&mut self, batch_id: i64) -> Result<u64>;

    async fn batch(&mut self, batch_id: i64) -> Result<Option<Batch>>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
