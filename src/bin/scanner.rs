use anyhow::{bail, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use vinyl_watch::config::{QueueConfig, WorkerConfig};
use vinyl_watch::queue::PgWorkQueue;
use vinyl_watch::retailers::ScraperRegistry;
use vinyl_watch::store::{PgStore, PipelineStore};
use vinyl_watch::util::{db::Db, env, shutdown::shutdown_signal};
use vinyl_watch::worker::ScanWorker;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env::init_env();
    vinyl_watch::tracing::init_tracing("info,sqlx=warn")?;
    env::preflight_check(
        "scanner",
        &[],
        &["DATABASE_URL", "SCAN_QUEUE_NAME", "WORKER_CONCURRENCY", "SCRAPE_TIMEOUT_SECS"],
    )?;

    let db = Db::connect_from_env().await?;
    let store = PgStore::new(db.pool.clone());
    let cfg = WorkerConfig::from_env();

    let http = Client::builder()
        .user_agent("vinyl-watch/0.1")
        .timeout(cfg.scrape_timeout + Duration::from_secs(1))
        .build()?;
    let retailers = store.retailers().await?;
    let scrapers = ScraperRegistry::from_retailers(&retailers, http);
    if scrapers.is_empty() {
        bail!("no retailer has a usable scraper; nothing to scan");
    }

    let qcfg = QueueConfig::from_env();
    let queue = PgWorkQueue::new(
        db.pool.clone(),
        &qcfg.name,
        qcfg.visibility_timeout_secs,
        qcfg.poll,
    );
    info!(
        queue = %qcfg.name,
        concurrency = cfg.concurrency,
        scrapers = scrapers.len(),
        "scanner starting"
    );

    let worker = Arc::new(ScanWorker::new(Arc::new(store), Arc::new(queue), scrapers, cfg));
    worker.run(shutdown_signal()).await
}
