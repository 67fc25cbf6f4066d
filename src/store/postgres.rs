use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use super::{PipelineStore, PipelineTx};
use crate::error::PipelineError;
use crate::model::{
    Batch, NewSku, PendingReport, Release, ReportedSku, Retailer, Sku, WatchMap, WatchedArtist,
};

const BATCH_COLUMNS: &str = "id, req_searches, completed_searches, created_at, reported_at";
const SKU_COLUMNS: &str =
    "id, release_id, retailer_id, artist_id, item_url, image_url, price, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn PipelineTx>> {
        let tx = self.pool.begin().await.context("failed to begin transaction")?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn retailers(&self) -> Result<Vec<Retailer>> {
        let rows = sqlx::query_as::<_, Retailer>(
            "SELECT id, name, url, adapter FROM retailers ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("error getting retailers")?;
        Ok(rows)
    }

    async fn watched_artists(&self) -> Result<WatchMap> {
        let rows = sqlx::query_as::<_, WatchedArtist>(
            r#"
            SELECT ufa.user_id, a.id AS artist_id, a.name AS artist_name, a.variants AS artist_variants
            FROM users_following_artists ufa
            JOIN artists a ON a.id = ufa.artist_id
            ORDER BY ufa.user_id, a.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("error getting watched artists")?;

        let mut watches = WatchMap::new();
        for w in rows {
            watches.entry(w.user_id).or_default().push(w);
        }
        Ok(watches)
    }

    #[instrument(skip(self))]
    async fn delete_batch(&self, batch_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM batches WHERE id = $1")
            .bind(batch_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete batch {batch_id}"))?;
        Ok(())
    }

    async fn batch(&self, batch_id: i64) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn recent_batches(&self, limit: i64) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn stalled_batches(&self, cutoff: DateTime<Utc>) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches \
             WHERE reported_at IS NULL AND completed_searches < req_searches AND created_at < $1 \
             ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn completed_unsent_reports(&self) -> Result<Vec<PendingReport>> {
        let rows = sqlx::query_as::<_, PendingReport>(
            r#"
            SELECT r.id AS report_id, r.batch_id, u.id AS user_id, u.name AS user_name, u.email AS user_email
            FROM reports r
            JOIN batches b ON b.id = r.batch_id
            JOIN users u ON u.id = r.user_id
            WHERE b.reported_at IS NULL
              AND b.completed_searches = b.req_searches
              AND r.completed_at IS NULL
            ORDER BY r.batch_id, r.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("error getting completed reports")?;
        Ok(rows)
    }

    async fn skus_for_report(&self, report_id: i64) -> Result<Vec<ReportedSku>> {
        let rows = sqlx::query_as::<_, ReportedSku>(
            r#"
            SELECT s.id AS sku_id, a.name AS artist, rel.title, ret.name AS retailer,
                   ret.url AS retailer_url, s.item_url, s.image_url, s.price
            FROM report_skus rs
            JOIN skus s ON s.id = rs.sku_id
            JOIN releases rel ON rel.id = s.release_id
            JOIN artists a ON a.id = s.artist_id
            JOIN retailers ret ON ret.id = s.retailer_id
            WHERE rs.report_id = $1
            ORDER BY a.name, rel.title, s.id
            "#,
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("error getting skus for report {report_id}"))?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn mark_report_sent(&self, report_id: i64) -> Result<()> {
        let res = sqlx::query(
            "UPDATE reports SET sent_at = now(), completed_at = now() WHERE id = $1",
        )
        .bind(report_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(PipelineError::ReportNotFound(report_id).into());
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_report(&self, report_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM reports WHERE id = $1")
            .bind(report_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_batch_reported(&self, batch_id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE batches SET reported_at = now() \
             WHERE id = $1 AND reported_at IS NULL AND completed_searches = req_searches",
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn drained_batches(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT b.id FROM batches b
            WHERE b.reported_at IS NULL
              AND b.completed_searches = b.req_searches
              AND NOT EXISTS (
                  SELECT 1 FROM reports r WHERE r.batch_id = b.id AND r.completed_at IS NULL
              )
            ORDER BY b.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(Into::into))
            .collect()
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PipelineTx for PgTx {
    async fn insert_batch(&mut self, required_searches: i64) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO batches (req_searches) VALUES ($1) RETURNING id",
        )
        .bind(required_searches)
        .fetch_one(&mut *self.tx)
        .await
        .context("failed to insert batch")?;
        Ok(id)
    }

    async fn insert_report(&mut self, batch_id: i64, user_id: i64) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO reports (batch_id, user_id) VALUES ($1, $2) RETURNING id",
        )
        .bind(batch_id)
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await
        .with_context(|| format!("failed to insert report for user {user_id}"))?;
        Ok(id)
    }

    async fn insert_report_artist(
        &mut self,
        batch_id: i64,
        report_id: i64,
        artist_id: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO report_artists (batch_id, report_id, artist_id) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(batch_id)
        .bind(report_id)
        .bind(artist_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_release(&mut self, artist_id: i64, title: &str) -> Result<Release> {
        let release = sqlx::query_as::<_, Release>(
            "INSERT INTO releases (artist_id, title) VALUES ($1, $2) \
             ON CONFLICT (artist_id, title) DO UPDATE SET updated_at = now() \
             RETURNING id, artist_id, title, created_at, updated_at",
        )
        .bind(artist_id)
        .bind(title)
        .fetch_one(&mut *self.tx)
        .await
        .with_context(|| format!("failed to upsert release '{title}'"))?;
        Ok(release)
    }

    async fn current_sku(&mut self, release_id: i64, retailer_id: i64) -> Result<Option<Sku>> {
        let sku = sqlx::query_as::<_, Sku>(&format!(
            "SELECT {SKU_COLUMNS} FROM skus WHERE release_id = $1 AND retailer_id = $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(release_id)
        .bind(retailer_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(sku)
    }

    async fn insert_sku(&mut self, sku: &NewSku) -> Result<Sku> {
        let row = sqlx::query_as::<_, Sku>(&format!(
            "INSERT INTO skus (release_id, retailer_id, artist_id, item_url, image_url, price) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {SKU_COLUMNS}"
        ))
        .bind(sku.release_id)
        .bind(sku.retailer_id)
        .bind(sku.artist_id)
        .bind(&sku.item_url)
        .bind(&sku.image_url)
        .bind(&sku.price)
        .fetch_one(&mut *self.tx)
        .await
        .context("failed to insert sku")?;
        Ok(row)
    }

    async fn current_skus_for_artist_retailer(
        &mut self,
        artist_id: i64,
        retailer_id: i64,
    ) -> Result<Vec<Sku>> {
        let rows = sqlx::query_as::<_, Sku>(&format!(
            "SELECT DISTINCT ON (release_id) {SKU_COLUMNS} FROM skus \
             WHERE artist_id = $1 AND retailer_id = $2 \
             ORDER BY release_id, created_at DESC, id DESC"
        ))
        .bind(artist_id)
        .bind(retailer_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn reports_covering_artist(
        &mut self,
        batch_id: i64,
        artist_id: i64,
    ) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT report_id FROM report_artists WHERE batch_id = $1 AND artist_id = $2 \
             ORDER BY report_id",
        )
        .bind(batch_id)
        .bind(artist_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn attach_sku_to_reports(&mut self, sku_id: i64, report_ids: &[i64]) -> Result<u64> {
        if report_ids.is_empty() {
            return Ok(0);
        }
        let res = sqlx::query(
            "INSERT INTO report_skus (report_id, sku_id) \
             SELECT unnest($1::BIGINT[]), $2 ON CONFLICT DO NOTHING",
        )
        .bind(report_ids)
        .bind(sku_id)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("failed to attach sku {sku_id} to reports"))?;
        Ok(res.rows_affected())
    }

    async fn record_completion(
        &mut self,
        batch_id: i64,
        artist_id: i64,
        retailer_id: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO scan_completions (batch_id, artist_id, retailer_id) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(batch_id)
        .bind(artist_id)
        .bind(retailer_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn increment_completed(&mut self, batch_id: i64) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE batches SET completed_searches = completed_searches + 1 \
             WHERE id = $1 AND completed_searches < req_searches",
        )
        .bind(batch_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    async fn batch(&mut self, batch_id: i64) -> Result<Option<Batch>> {
        let row = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("failed to commit transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("failed to roll back transaction")
    }
}
