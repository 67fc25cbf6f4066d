use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use vinyl_watch::config::{QueueConfig, SchedulerConfig};
use vinyl_watch::queue::PgWorkQueue;
use vinyl_watch::scheduler::Scheduler;
use vinyl_watch::store::PgStore;
use vinyl_watch::util::{db::Db, env, shutdown::shutdown_signal};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env::init_env();
    vinyl_watch::tracing::init_tracing("info,sqlx=warn")?;
    env::preflight_check(
        "scheduler",
        &[],
        &["DATABASE_URL", "SCAN_QUEUE_NAME", "SCHEDULE_INTERVAL_SECS"],
    )?;

    let db = Db::connect_from_env().await?;
    let qcfg = QueueConfig::from_env();
    let queue = PgWorkQueue::new(
        db.pool.clone(),
        &qcfg.name,
        qcfg.visibility_timeout_secs,
        qcfg.poll,
    );
    let cfg = SchedulerConfig::from_env();
    info!(
        queue = %qcfg.name,
        interval_secs = cfg.interval.as_secs(),
        "scheduler starting"
    );

    let scheduler = Scheduler::new(Arc::new(PgStore::new(db.pool.clone())), Arc::new(queue), cfg);
    scheduler.run(shutdown_signal()).await
}
