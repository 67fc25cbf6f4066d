//! Price ledger rules: a sku row is appended only when the observed price differs
//! from the newest row for the same release at the same retailer.
use anyhow::Result;
use std::collections::HashSet;
use tracing::debug;

use crate::model::{NewSku, Sku, SOLD_OUT};
use crate::store::PipelineTx;

/// Prices are free-form storefront text; compare them lower-cased and trimmed.
pub fn normalize_price(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Insert `sku` unless its price matches the pair's current row.
///
/// Returns the current row and `true` when nothing changed, or the new row and
/// `false` when a new observation was appended.
pub async fn upsert_sku(tx: &mut dyn PipelineTx, mut sku: NewSku) -> Result<(Sku, bool)> {
    sku.price = normalize_price(&sku.price);
    if let Some(current) = tx.current_sku(sku.release_id, sku.retailer_id).await? {
        if current.price == sku.price {
            return Ok((current, true));
        }
        debug!(
            release_id = sku.release_id,
            retailer_id = sku.retailer_id,
            from = %current.price,
            to = %sku.price,
            "price changed"
        );
    }
    let inserted = tx.insert_sku(&sku).await?;
    Ok((inserted, false))
}

/// Append a sold-out row for every release this artist had at this retailer that
/// was not part of the latest scrape. Releases already sold out are left alone.
pub async fn sweep_sold_out(
    tx: &mut dyn PipelineTx,
    artist_id: i64,
    retailer_id: i64,
    seen_release_ids: &HashSet<i64>,
) -> Result<Vec<Sku>> {
    let mut swept = Vec::new();
    for current in tx
        .current_skus_for_artist_retailer(artist_id, retailer_id)
        .await?
    {
        if seen_release_ids.contains(&current.release_id) || current.is_sold_out() {
            continue;
        }
        let row = tx
            .insert_sku(&NewSku {
                release_id: current.release_id,
                retailer_id,
                artist_id,
                item_url: current.item_url.clone(),
                image_url: current.image_url.clone(),
                price: SOLD_OUT.to_string(),
            })
            .await?;
        swept.push(row);
    }
    Ok(swept)
}
