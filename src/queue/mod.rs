//! Durable FIFO transport for scan work items.
//!
//! Every item travels as a JSON envelope `{"createdAt": <rfc3339>, "payload": <bytes>}`
//! whose payload is the JSON-encoded [`ScanRequest`]. Bytes are carried as a
//! base64 string so the envelope stays plain JSON.
pub mod memory;
pub mod postgres;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::model::ScanRequest;

pub use memory::MemoryQueue;
pub use postgres::PgWorkQueue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEnvelope {
    pub created_at: DateTime<Utc>,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

impl QueueEnvelope {
    pub fn wrap<T: Serialize>(item: &T) -> Result<Self> {
        let payload = serde_json::to_vec(item).context("failed to marshal payload")?;
        Ok(Self {
            created_at: Utc::now(),
            payload,
        })
    }

    pub fn unwrap<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).context("failed to unmarshal payload")
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to marshal queue entry")
    }

    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to unmarshal queue entry")
    }
}

mod payload_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// A dequeued item. Must be acked once its effects are committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub request: ScanRequest,
    pub enqueued_at: DateTime<Utc>,
    /// Number of times this item has been handed out, including this one.
    pub attempts: i32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append to the tail.
    async fn enqueue(&self, request: &ScanRequest) -> Result<()>;

    /// Take the oldest visible item. With `blocking`, waits until one arrives;
    /// otherwise returns `None` immediately when the queue is empty.
    async fn dequeue(&self, blocking: bool) -> Result<Option<Delivery>>;

    /// Remove a delivered item for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Items still held by the queue. Whether a dequeued but unacked item is
    /// included depends on the implementation: the Postgres queue keeps it until
    /// `ack`, the in-memory queue drops it on dequeue.
    async fn len(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ScanRequest {
        ScanRequest {
            batch_id: 12,
            artist_id: 4,
            artist_name: "Clowns".into(),
            retailer_id: 1,
            retailer_name: "Artist First".into(),
        }
    }

    #[test]
    fn envelope_carries_payload_as_base64_json() {
        let env = QueueEnvelope::wrap(&request()).unwrap();
        let raw = env.encode().unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(v["createdAt"].is_string());
        assert!(v["payload"].is_string());

        let back = QueueEnvelope::decode(&raw).unwrap();
        assert_eq!(back, env);
        let req: ScanRequest = back.unwrap().unwrap();
        assert_eq!(req, request());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(QueueEnvelope::decode("not json").is_err());
        let bad = r#"{"createdAt":"2024-01-01T00:00:00Z","payload":"!!!"}"#;
        assert!(QueueEnvelope::decode(bad).is_err());
    }
}
