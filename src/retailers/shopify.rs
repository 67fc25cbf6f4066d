use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::RetailerScraper;
use crate::model::{Candidate, SOLD_OUT};

/// Generic adapter for storefronts exposing the Shopify predictive search endpoint.
pub struct ShopifyScraper {
    http: Client,
    base_url: String,
}

impl ShopifyScraper {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RetailerScraper for ShopifyScraper {
    fn query_url(&self, artist: &str) -> String {
        format!(
            "{}/search/suggest.json?q={}&resources[type]=product",
            self.base_url,
            urlencoding::encode(artist)
        )
    }

    async fn scrape(&self, artist: &str) -> Result<Vec<Candidate>> {
        let url = self.query_url(artist);
        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("storefront search failed: {status} url={url}"));
        }
        let body: Value = resp.json().await?;
        let candidates = parse_suggest(&self.base_url, artist, &body)
            .with_context(|| format!("unexpected search response from {url}"))?;
        debug!(url = %url, candidates = candidates.len(), "scraped storefront");
        Ok(candidates)
    }
}

/// Products from a predictive-search response whose title mentions `artist`.
/// A body without a product list is an error, not an empty storefront.
fn parse_suggest(base_url: &str, artist: &str, body: &Value) -> Result<Vec<Candidate>> {
    let needle = artist.trim().to_lowercase();
    let Some(products) = body
        .get("resources")
        .and_then(|r| r.get("results"))
        .and_then(|r| r.get("products"))
        .and_then(|p| p.as_array())
    else {
        return Err(anyhow!("response has no resources.results.products list"));
    };
    let base = Url::parse(&format!("{base_url}/")).ok();

    let mut out = Vec::new();
    for p in products {
        let Some(title) = p.get("title").and_then(|v| v.as_str()).map(str::trim) else {
            continue;
        };
        if title.is_empty() || !title.to_lowercase().contains(&needle) {
            continue;
        }
        let available = p.get("available").and_then(|v| v.as_bool()).unwrap_or(true);
        let price = if available {
            p.get("price").map(format_price).unwrap_or_default()
        } else {
            SOLD_OUT.to_string()
        };
        let href = p.get("url").and_then(|v| v.as_str()).unwrap_or_default();
        let item_url = match &base {
            Some(b) => b.join(href).map(|u| u.to_string()).unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        };
        let image_url = p
            .get("image")
            .and_then(|v| v.as_str())
            .or_else(|| {
                p.get("featured_image")
                    .and_then(|f| f.get("url"))
                    .and_then(|v| v.as_str())
            })
            .unwrap_or_default()
            .to_string();

        out.push(Candidate {
            title: title.to_string(),
            price,
            item_url,
            image_url,
        });
    }
    Ok(out)
}

fn format_price(v: &Value) -> String {
    let amount = v
        .as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()));
    match amount {
        Some(n) => format!("${n:.2}"),
        None => v.as_str().unwrap_or_default().to_string(),
    }
}
