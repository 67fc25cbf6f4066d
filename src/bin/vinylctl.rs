use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use vinyl_watch::config::{QueueConfig, ReporterConfig, SchedulerConfig};
use vinyl_watch::notify::{LogNotifier, Notifier, WebhookNotifier};
use vinyl_watch::queue::{PgWorkQueue, WorkQueue};
use vinyl_watch::reporter::ReportBuilder;
use vinyl_watch::scheduler::{CycleOutcome, Scheduler};
use vinyl_watch::store::{PgStore, PipelineStore};
use vinyl_watch::util::{db::Db, env};

#[derive(Parser, Debug)]
#[command(name = "vinylctl", version, about = "vinyl-watch admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Apply pending SQL migrations
    Migrate,
    /// Show progress of the most recent batches
    Batches {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Run a single scheduling cycle and exit
    ScheduleOnce,
    /// Send reports for completed batches once and exit
    DrainOnce,
    /// Print the number of items waiting in the scan queue
    QueueLen,
    /// Delete every item in the scan queue
    QueuePurge,
}

fn scan_queue(db: &Db) -> PgWorkQueue {
    let qcfg = QueueConfig::from_env();
    PgWorkQueue::new(
        db.pool.clone(),
        &qcfg.name,
        qcfg.visibility_timeout_secs,
        qcfg.poll,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    vinyl_watch::tracing::init_tracing("warn,vinyl_watch=info")?;
    let cli = Cli::parse();

    let db = Db::connect_from_env().await?;
    let store = Arc::new(PgStore::new(db.pool.clone()));

    match cli.command {
        Commands::Migrate => {
            let applied = db.run_migrations().await?;
            if applied.is_empty() {
                println!("schema up to date");
            } else {
                println!("applied migrations: {applied:?}");
            }
        }
        Commands::Batches { limit } => {
            let batches = store.recent_batches(limit).await?;
            println!(
                "{:>8}  {:>9}  {:<25}  {}",
                "batch", "progress", "created", "reported"
            );
            for b in batches {
                let reported = b
                    .reported_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>8}  {:>4}/{:<4}  {:<25}  {}",
                    b.id,
                    b.completed_searches,
                    b.required_searches,
                    b.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    reported
                );
            }
        }
        Commands::ScheduleOnce => {
            let scheduler = Scheduler::new(
                store,
                Arc::new(scan_queue(&db)),
                SchedulerConfig::from_env(),
            );
            match scheduler.schedule_cycle().await? {
                CycleOutcome::Idle => println!("nothing to schedule"),
                CycleOutcome::Scheduled { batch_id, required } => {
                    println!("scheduled batch {batch_id} with {required} searches")
                }
            }
        }
        Commands::DrainOnce => {
            let cfg = ReporterConfig::from_env();
            let notifier: Arc<dyn Notifier> = match cfg.webhook_url.as_deref() {
                Some(url) => Arc::new(WebhookNotifier::new(url, cfg.webhook_token.clone())?),
                None => Arc::new(LogNotifier),
            };
            let builder = ReportBuilder::new(store, notifier, cfg);
            let s = builder.drain_completed_batches().await?;
            println!(
                "sent={} deleted={} failed={} batches_finalised={}",
                s.sent, s.deleted, s.failed, s.batches_finalised
            );
            let stalled = builder.check_stalled().await?;
            if !stalled.is_empty() {
                println!("stalled batches: {:?}", stalled.iter().map(|b| b.id).collect::<Vec<_>>());
            }
        }
        Commands::QueueLen => {
            let queue = scan_queue(&db);
            println!("{}: {}", queue.name(), queue.len().await?);
        }
        Commands::QueuePurge => {
            let queue = scan_queue(&db);
            let removed = queue.purge().await?;
            println!("{}: removed {removed} items", queue.name());
        }
    }
    Ok(())
}
