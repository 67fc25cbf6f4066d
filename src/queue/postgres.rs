use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, instrument};

use super::{Delivery, QueueEnvelope, WorkQueue};
use crate::model::ScanRequest;

/// Queue backed by the `scan_queue` table.
///
/// Dequeue claims the oldest visible row with `FOR UPDATE SKIP LOCKED` and
/// hides it for `visibility_timeout_secs`. `ack` deletes the row. A worker that
/// dies before acking gets its item redelivered once the timeout lapses.
#[derive(Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
    name: String,
    visibility_timeout_secs: i32,
    poll: Duration,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool, name: &str, visibility_timeout_secs: i32, poll: Duration) -> Self {
        Self {
            pool,
            name: name.to_string(),
            visibility_timeout_secs: visibility_timeout_secs.max(1),
            poll,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove every entry of this queue, visible or not.
    pub async fn purge(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM scan_queue WHERE queue_name = $1")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to cleanup existing items from queue {}", self.name))?;
        Ok(res.rows_affected())
    }

    async fn claim(&self) -> Result<Option<Delivery>> {
        loop {
            let row = sqlx::query(
                "UPDATE scan_queue \
                 SET visible_at = now() + make_interval(secs => $2), read_ct = read_ct + 1 \
                 WHERE id = ( \
                     SELECT id FROM scan_queue \
                     WHERE queue_name = $1 AND visible_at <= now() \
                     ORDER BY id ASC \
                     FOR UPDATE SKIP LOCKED LIMIT 1 \
                 ) \
                 RETURNING id, envelope, read_ct, enqueued_at",
            )
            .bind(&self.name)
            .bind(self.visibility_timeout_secs as f64)
            .fetch_optional(&self.pool)
            .await
            .context("failed to pop queue entry")?;

            let Some(row) = row else {
                return Ok(None);
            };
            let id: i64 = row.try_get("id")?;
            let raw: String = row.try_get("envelope")?;
            let attempts: i32 = row.try_get("read_ct")?;
            let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at")?;

            let decoded = QueueEnvelope::decode(&raw).and_then(|env| env.unwrap::<ScanRequest>());
            match decoded {
                Ok(request) => {
                    return Ok(Some(Delivery {
                        id,
                        request,
                        enqueued_at,
                        attempts,
                    }))
                }
                Err(err) => {
                    error!(queue = %self.name, entry_id = id, error = %err, "bad payload; dropping entry");
                    self.delete(id).await?;
                }
            }
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM scan_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete queue entry {id}"))?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    #[instrument(skip(self, request), fields(queue = %self.name, batch_id = request.batch_id))]
    async fn enqueue(&self, request: &ScanRequest) -> Result<()> {
        let raw = QueueEnvelope::wrap(request)?.encode()?;
        sqlx::query("INSERT INTO scan_queue (queue_name, envelope) VALUES ($1, $2)")
            .bind(&self.name)
            .bind(raw)
            .execute(&self.pool)
            .await
            .context("failed to push queue entry")?;
        Ok(())
    }

    async fn dequeue(&self, blocking: bool) -> Result<Option<Delivery>> {
        loop {
            if let Some(d) = self.claim().await? {
                debug!(queue = %self.name, entry_id = d.id, attempts = d.attempts, "claimed scan request");
                return Ok(Some(d));
            }
            if !blocking {
                return Ok(None);
            }
            sleep(self.poll).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.delete(delivery.id).await
    }

    async fn len(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_queue WHERE queue_name = $1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to get length of queue {}", self.name))?;
        Ok(n)
    }
}
