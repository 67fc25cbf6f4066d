//! Storefront scraping adapters, resolved by retailer id.
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::model::{Candidate, Retailer};

pub mod shopify;

pub use shopify::ShopifyScraper;

#[async_trait]
pub trait RetailerScraper: Send + Sync {
    /// The storefront search URL used for `artist`.
    fn query_url(&self, artist: &str) -> String;

    async fn scrape(&self, artist: &str) -> Result<Vec<Candidate>>;
}

#[derive(Clone, Default)]
pub struct ScraperRegistry {
    scrapers: HashMap<i64, Arc<dyn RetailerScraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every retailer whose `adapter` key is known.
    /// Retailers with an unknown key are skipped; their scans fail with `UnknownRetailer`.
    pub fn from_retailers(retailers: &[Retailer], http: Client) -> Self {
        let mut registry = Self::new();
        for r in retailers {
            match r.adapter.as_str() {
                "shopify" => {
                    registry.insert(r.id, Arc::new(ShopifyScraper::new(http.clone(), &r.url)));
                }
                other => {
                    warn!(retailer_id = r.id, retailer = %r.name, adapter = other, "no scraper for adapter");
                }
            }
        }
        info!(scrapers = registry.len(), "scraper registry ready");
        registry
    }

    pub fn insert(&mut self, retailer_id: i64, scraper: Arc<dyn RetailerScraper>) {
        self.scrapers.insert(retailer_id, scraper);
    }

    pub fn get(&self, retailer_id: i64) -> Result<Arc<dyn RetailerScraper>, PipelineError> {
        self.scrapers
            .get(&retailer_id)
            .cloned()
            .ok_or(PipelineError::UnknownRetailer(retailer_id))
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }
}

/// Run a scrape, giving up after `timeout`.
pub async fn scrape_with_timeout(
    scraper: &dyn RetailerScraper,
    retailer: &str,
    artist: &str,
    timeout: Duration,
) -> Result<Vec<Candidate>> {
    match tokio::time::timeout(timeout, scraper.scrape(artist)).await {
        Ok(res) => res,
        Err(_) => Err(PipelineError::ScrapeTimeout {
            retailer: retailer.to_string(),
            artist: artist.to_string(),
            secs: timeout.as_secs(),
        }
        .into()),
    }
}
