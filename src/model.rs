//! Row types shared by the scheduler, scan workers and report builder.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved price literal meaning "not currently available". Never notified.
pub const SOLD_OUT: &str = "sold out";

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Artist {
    pub id: i64,
    pub name: String,
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Retailer {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Scraping adapter key, resolved by `retailers::ScraperRegistry`.
    pub adapter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WatchedArtist {
    pub user_id: i64,
    pub artist_id: i64,
    pub artist_name: String,
    pub artist_variants: Vec<String>,
}

/// user id -> artists that user watches.
pub type WatchMap = BTreeMap<i64, Vec<WatchedArtist>>;

/// Flatten a watch map into the distinct artists it covers (id -> name).
pub fn distinct_artists(watches: &WatchMap) -> BTreeMap<i64, String> {
    let mut artists = BTreeMap::new();
    for watched in watches.values() {
        for w in watched {
            artists
                .entry(w.artist_id)
                .or_insert_with(|| w.artist_name.clone());
        }
    }
    artists
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Release {
    pub id: i64,
    pub artist_id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One observation of a release's price at one retailer.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Sku {
    pub id: i64,
    pub release_id: i64,
    pub retailer_id: i64,
    pub artist_id: i64,
    pub item_url: String,
    pub image_url: String,
    pub price: String,
    pub created_at: DateTime<Utc>,
}

impl Sku {
    pub fn is_sold_out(&self) -> bool {
        self.price == SOLD_OUT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSku {
    pub release_id: i64,
    pub retailer_id: i64,
    pub artist_id: i64,
    pub item_url: String,
    pub image_url: String,
    pub price: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Batch {
    pub id: i64,
    #[sqlx(rename = "req_searches")]
    pub required_searches: i64,
    pub completed_searches: i64,
    pub created_at: DateTime<Utc>,
    pub reported_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn is_complete(&self) -> bool {
        self.completed_searches == self.required_searches
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Report {
    pub id: i64,
    pub user_id: i64,
    pub batch_id: i64,
    pub completed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// A report whose batch has finished scanning but which has not been sent.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingReport {
    pub report_id: i64,
    pub batch_id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub user_email: String,
}

/// SKU attached to a report, joined with display names for rendering.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ReportedSku {
    pub sku_id: i64,
    pub artist: String,
    pub title: String,
    pub retailer: String,
    pub retailer_url: String,
    pub item_url: String,
    pub image_url: String,
    pub price: String,
}

/// Queue payload: one artist/retailer pair to scan for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub batch_id: i64,
    pub artist_id: i64,
    pub artist_name: String,
    pub retailer_id: i64,
    pub retailer_name: String,
}

/// A release listing as returned by a scraping adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub title: String,
    pub price: String,
    pub item_url: String,
    pub image_url: String,
}
