use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};
use tracing::error;

use super::{Delivery, QueueEnvelope, WorkQueue};
use crate::model::ScanRequest;

/// In-process queue. Items are removed on dequeue, so `ack` is a no-op and a
/// task that dies mid-item loses it.
pub struct MemoryQueue {
    entries: Mutex<VecDeque<(i64, String)>>,
    next_id: AtomicI64,
    arrived: Notify,
    poll: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl MemoryQueue {
    pub fn new(poll: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            next_id: AtomicI64::new(1),
            arrived: Notify::new(),
            poll,
        }
    }

    /// Push a raw entry without encoding it. Used to exercise malformed input.
    pub fn push_raw(&self, raw: impl Into<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push_back((id, raw.into()));
        self.arrived.notify_one();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<(i64, String)>> {
        // a poisoned queue still holds valid entries
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop(&self) -> Option<Delivery> {
        loop {
            let (id, raw) = self.lock().pop_front()?;
            let decoded = QueueEnvelope::decode(&raw)
                .and_then(|env| Ok((env.created_at, env.unwrap::<ScanRequest>()?)));
            match decoded {
                Ok((enqueued_at, request)) => {
                    return Some(Delivery {
                        id,
                        request,
                        enqueued_at,
                        attempts: 1,
                    })
                }
                Err(err) => {
                    error!(entry_id = id, error = %err, "dropping malformed queue entry");
                }
            }
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, request: &ScanRequest) -> Result<()> {
        let raw = QueueEnvelope::wrap(request)?.encode()?;
        self.push_raw(raw);
        Ok(())
    }

    async fn dequeue(&self, blocking: bool) -> Result<Option<Delivery>> {
        loop {
            if let Some(d) = self.pop() {
                return Ok(Some(d));
            }
            if !blocking {
                return Ok(None);
            }
            let _ = timeout(self.poll, self.arrived.notified()).await;
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }

    async fn len(&self) -> Result<i64> {
        Ok(self.lock().len() as i64)
    }
}
