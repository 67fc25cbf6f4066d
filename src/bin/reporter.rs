use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use vinyl_watch::config::ReporterConfig;
use vinyl_watch::notify::{LogNotifier, Notifier, WebhookNotifier};
use vinyl_watch::reporter::ReportBuilder;
use vinyl_watch::store::PgStore;
use vinyl_watch::util::{db::Db, env, shutdown::shutdown_signal};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env::init_env();
    vinyl_watch::tracing::init_tracing("info,sqlx=warn")?;
    env::preflight_check(
        "reporter",
        &[],
        &["DATABASE_URL", "REPORT_POLL_SECS", "NOTIFY_WEBHOOK_URL", "NOTIFY_WEBHOOK_TOKEN"],
    )?;

    let db = Db::connect_from_env().await?;
    let cfg = ReporterConfig::from_env();
    let notifier: Arc<dyn Notifier> = match cfg.webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url, cfg.webhook_token.clone())?),
        None => {
            warn!("NOTIFY_WEBHOOK_URL not set; digests will only be logged");
            Arc::new(LogNotifier)
        }
    };
    info!(poll_secs = cfg.poll.as_secs(), "report builder starting");

    let builder = ReportBuilder::new(Arc::new(PgStore::new(db.pool.clone())), notifier, cfg);
    builder.run(shutdown_signal()).await
}
