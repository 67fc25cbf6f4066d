use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vinyl_watch::config::{ReporterConfig, SchedulerConfig, WorkerConfig};
use vinyl_watch::ledger::Completion;
use vinyl_watch::model::{Candidate, ScanRequest, SOLD_OUT};
use vinyl_watch::notify::Notifier;
use vinyl_watch::queue::{MemoryQueue, WorkQueue};
use vinyl_watch::reporter::{DrainSummary, ReportBuilder};
use vinyl_watch::retailers::{RetailerScraper, ScraperRegistry};
use vinyl_watch::scheduler::{CycleOutcome, Scheduler};
use vinyl_watch::store::{MemoryStore, PipelineStore};
use vinyl_watch::worker::ScanWorker;
use vinyl_watch::PipelineError;

#[derive(Default)]
struct FakeScraper {
    listings: Mutex<HashMap<String, Vec<Candidate>>>,
    failing: Mutex<bool>,
    delay: Mutex<Duration>,
}

impl FakeScraper {
    fn set(&self, artist: &str, items: &[(&str, &str)]) {
        let candidates = items
            .iter()
            .map(|(title, price)| Candidate {
                title: title.to_string(),
                price: price.to_string(),
                item_url: format!("https://shop.example/products/{}", title.replace(' ', "-")),
                image_url: String::new(),
            })
            .collect();
        self.listings
            .lock()
            .unwrap()
            .insert(artist.to_lowercase(), candidates);
    }

    fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl RetailerScraper for FakeScraper {
    fn query_url(&self, artist: &str) -> String {
        format!("https://shop.example/search?q={artist}")
    }

    async fn scrape(&self, artist: &str) -> Result<Vec<Candidate>> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.lock().unwrap() {
            return Err(anyhow!("storefront returned 503"));
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(artist)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    reject: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(to, _)| to.clone()).collect()
    }

    fn body_for(&self, recipient: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|(to, _)| to == recipient)
            .map(|(_, html)| html.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, recipient: &str, _subject: &str, html: &str) -> Result<()> {
        if self.reject.lock().unwrap().contains(recipient) {
            return Err(PipelineError::Notify {
                recipient: recipient.to_string(),
                reason: "mailbox unavailable".into(),
            }
            .into());
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), html.to_string()));
        Ok(())
    }
}

struct Harness {
    store: MemoryStore,
    queue: Arc<MemoryQueue>,
    scrapers: HashMap<i64, Arc<FakeScraper>>,
    notifier: Arc<RecordingNotifier>,
    scheduler: Scheduler,
    worker: Arc<ScanWorker>,
    reporter: ReportBuilder,
}

impl Harness {
    async fn new(store: MemoryStore, retailer_ids: &[i64]) -> Self {
        let queue = Arc::new(MemoryQueue::new(Duration::from_millis(10)));
        let mut registry = ScraperRegistry::new();
        let mut scrapers = HashMap::new();
        for id in retailer_ids {
            let s = Arc::new(FakeScraper::default());
            registry.insert(*id, s.clone());
            scrapers.insert(*id, s);
        }
        let notifier = Arc::new(RecordingNotifier::default());
        let shared: Arc<dyn PipelineStore> = Arc::new(store.clone());

        let scheduler = Scheduler::new(
            shared.clone(),
            queue.clone(),
            SchedulerConfig {
                interval: Duration::from_secs(3600),
                startup_delay: Duration::ZERO,
            },
        );
        let worker = Arc::new(ScanWorker::new(
            shared.clone(),
            queue.clone(),
            registry,
            WorkerConfig {
                concurrency: 2,
                scrape_timeout: Duration::from_secs(5),
                error_backoff: Duration::from_millis(10),
            },
        ));
        let reporter = ReportBuilder::new(shared, notifier.clone(), ReporterConfig::default());

        Self {
            store,
            queue,
            scrapers,
            notifier,
            scheduler,
            worker,
            reporter,
        }
    }

    fn scraper(&self, retailer_id: i64) -> &FakeScraper {
        &self.scrapers[&retailer_id]
    }

    async fn schedule(&self) -> i64 {
        match self.scheduler.schedule_cycle().await.unwrap() {
            CycleOutcome::Scheduled { batch_id, .. } => batch_id,
            CycleOutcome::Idle => panic!("expected a batch"),
        }
    }

    /// Drain the queue with several workers racing on it.
    async fn run_workers(&self, workers: usize) -> Vec<Completion> {
        let mut handles = Vec::new();
        for _ in 0..workers {
            let worker = self.worker.clone();
            handles.push(tokio::spawn(async move {
                let mut done = Vec::new();
                while let Some(outcome) = worker.work_once(false).await.unwrap() {
                    done.push(outcome.completion);
                }
                done
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all
    }
}

struct World {
    ann: i64,
    bob: i64,
    clowns: i64,
    pixies: i64,
    r1: i64,
    r2: i64,
}

/// Ann watches Clowns; Bob watches Clowns and Pixies; two retailers.
async fn seeded() -> (Harness, World) {
    let store = MemoryStore::new();
    let ann = store.add_user("Ann", "ann@example.com").await;
    let bob = store.add_user("Bob", "bob@example.com").await;
    let clowns = store.add_artist("Clowns").await;
    let pixies = store.add_artist("Pixies").await;
    let r1 = store.add_retailer("Poison City", "https://poisoncity.example", "shopify").await;
    let r2 = store.add_retailer("Greville", "https://greville.example", "shopify").await;
    store.watch(ann, clowns).await;
    store.watch(bob, clowns).await;
    store.watch(bob, pixies).await;
    let h = Harness::new(store, &[r1, r2]).await;
    (
        h,
        World {
            ann,
            bob,
            clowns,
            pixies,
            r1,
            r2,
        },
    )
}

#[tokio::test]
async fn batch_requires_every_artist_retailer_pair() {
    let (h, _) = seeded().await;
    let batch_id = h.schedule().await;

    let batch = h.store.batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.required_searches, 4);
    assert_eq!(batch.completed_searches, 0);
    assert_eq!(h.queue.len().await.unwrap(), 4);
    assert!(h.store.completed_unsent_reports().await.unwrap().is_empty());

    let done = h.run_workers(3).await;
    assert_eq!(done.len(), 4);
    assert!(done.iter().all(|c| *c == Completion::Counted));

    let batch = h.store.batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.completed_searches, 4);
    assert!(batch.is_complete());
    assert_eq!(h.store.completed_unsent_reports().await.unwrap().len(), 2);
}

#[tokio::test]
async fn idle_when_nobody_watches_anything() {
    let store = MemoryStore::new();
    store.add_retailer("Poison City", "https://poisoncity.example", "shopify").await;
    let h = Harness::new(store, &[]).await;
    assert_eq!(h.scheduler.schedule_cycle().await.unwrap(), CycleOutcome::Idle);
    assert_eq!(h.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn new_listing_fans_out_only_to_watchers_of_that_artist() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Clowns", &[("Clowns - Nature/Nurture", "$20")]);
    h.scraper(w.r1).set("Pixies", &[("Pixies - Doolittle", "$35")]);

    let batch_id = h.schedule().await;
    h.run_workers(2).await;

    let ann = h.store.report_for_user(batch_id, w.ann).await.unwrap();
    let bob = h.store.report_for_user(batch_id, w.bob).await.unwrap();
    assert_eq!(h.store.report_sku_ids(ann.id).await.len(), 1);
    assert_eq!(h.store.report_sku_ids(bob.id).await.len(), 2);

    let summary = h.reporter.drain_completed_batches().await.unwrap();
    assert_eq!(
        summary,
        DrainSummary {
            sent: 2,
            deleted: 0,
            failed: 0,
            batches_finalised: 1
        }
    );
    let ann_mail = h.notifier.body_for("ann@example.com").unwrap();
    assert!(ann_mail.contains("Nature/Nurture"));
    assert!(!ann_mail.contains("Doolittle"));
    let bob_mail = h.notifier.body_for("bob@example.com").unwrap();
    assert!(bob_mail.contains("Doolittle"));

    let batch = h.store.batch(batch_id).await.unwrap().unwrap();
    assert!(batch.reported_at.is_some());
}

#[tokio::test]
async fn unchanged_price_is_not_reported_again() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Pixies", &[("Pixies - Doolittle", "$20")]);
    h.schedule().await;
    h.run_workers(1).await;
    h.reporter.drain_completed_batches().await.unwrap();
    assert_eq!(h.notifier.recipients(), vec!["bob@example.com"]);
    let skus_before = h.store.sku_count().await;

    h.scraper(w.r1).set("Pixies", &[("Pixies - Doolittle", " $20 ")]);
    let second = h.schedule().await;
    h.run_workers(1).await;

    assert_eq!(h.store.sku_count().await, skus_before);
    let bob = h.store.report_for_user(second, w.bob).await.unwrap();
    assert!(h.store.report_sku_ids(bob.id).await.is_empty());

    let summary = h.reporter.drain_completed_batches().await.unwrap();
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.batches_finalised, 1);
    assert_eq!(h.notifier.recipients().len(), 1);
    assert!(h.store.reports_for_batch(second).await.is_empty());
}

#[tokio::test]
async fn price_change_appends_and_notifies() {
    let (h, w) = seeded().await;
    h.scraper(w.r2).set("Pixies", &[("Pixies - Doolittle", "$20")]);
    h.schedule().await;
    h.run_workers(2).await;
    h.reporter.drain_completed_batches().await.unwrap();

    h.scraper(w.r2).set("Pixies", &[("Pixies - Doolittle", "$25")]);
    let second = h.schedule().await;
    h.run_workers(2).await;

    let release = h
        .store
        .release_id(w.pixies, "Pixies - Doolittle")
        .await
        .unwrap();
    let history = h.store.sku_history(release, w.r2).await;
    let prices: Vec<&str> = history.iter().map(|s| s.price.as_str()).collect();
    assert_eq!(prices, vec!["$20", "$25"]);

    let bob = h.store.report_for_user(second, w.bob).await.unwrap();
    assert_eq!(h.store.report_sku_ids(bob.id).await, vec![history[1].id]);
}

#[tokio::test]
async fn missing_listing_is_swept_to_sold_out_without_notifying() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set(
        "Clowns",
        &[("Clowns - Bad Blood", "$30"), ("Clowns - Lucid Again", "$32")],
    );
    h.schedule().await;
    h.run_workers(2).await;
    h.reporter.drain_completed_batches().await.unwrap();

    h.scraper(w.r1).set("Clowns", &[("Clowns - Lucid Again", "$32")]);
    let second = h.schedule().await;
    h.run_workers(2).await;

    let release = h.store.release_id(w.clowns, "Clowns - Bad Blood").await.unwrap();
    let history = h.store.sku_history(release, w.r1).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].price, SOLD_OUT);

    for user in [w.ann, w.bob] {
        let report = h.store.report_for_user(second, user).await.unwrap();
        assert!(h.store.report_sku_ids(report.id).await.is_empty());
    }

    // a third pass does not append another sold-out row
    h.schedule().await;
    h.run_workers(2).await;
    assert_eq!(h.store.sku_history(release, w.r1).await.len(), 2);
}

#[tokio::test]
async fn scraped_sold_out_is_recorded_but_not_reported() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Pixies", &[("Pixies - Trompe le Monde", "Sold Out")]);
    let batch_id = h.schedule().await;
    h.run_workers(1).await;

    let release = h
        .store
        .release_id(w.pixies, "Pixies - Trompe le Monde")
        .await
        .unwrap();
    assert_eq!(h.store.sku_history(release, w.r1).await[0].price, SOLD_OUT);
    let bob = h.store.report_for_user(batch_id, w.bob).await.unwrap();
    assert!(h.store.report_sku_ids(bob.id).await.is_empty());
}

#[tokio::test]
async fn failed_scrape_still_counts_towards_the_batch() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Clowns", &[("Clowns - Bad Blood", "$30")]);
    h.scraper(w.r2).fail(true);
    let batch_id = h.schedule().await;

    let mut degraded = 0;
    while let Some(outcome) = h.worker.work_once(false).await.unwrap() {
        if outcome.degraded {
            degraded += 1;
        }
    }
    assert_eq!(degraded, 2);
    assert!(h.store.batch(batch_id).await.unwrap().unwrap().is_complete());
}

#[tokio::test]
async fn failed_reconcile_rolls_back_and_counts_once() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Pixies", &[("Pixies - Doolittle", "$35")]);
    h.store.set_fail_sku_inserts(true).await;
    let batch_id = h.schedule().await;
    h.run_workers(1).await;

    let batch = h.store.batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.completed_searches, 4);
    assert_eq!(h.store.sku_count().await, 0);
    assert!(h.store.release_id(w.pixies, "Pixies - Doolittle").await.is_none());
}

#[tokio::test]
async fn redelivered_request_is_not_counted_twice() {
    let (h, w) = seeded().await;
    let batch_id = h.schedule().await;
    let dup = ScanRequest {
        batch_id,
        artist_id: w.clowns,
        artist_name: "Clowns".into(),
        retailer_id: w.r1,
        retailer_name: "Poison City".into(),
    };
    h.queue.enqueue(&dup).await.unwrap();

    let done = h.run_workers(2).await;
    assert_eq!(done.len(), 5);
    assert_eq!(
        done.iter().filter(|c| **c == Completion::Duplicate).count(),
        1
    );
    let batch = h.store.batch(batch_id).await.unwrap().unwrap();
    assert_eq!(batch.completed_searches, batch.required_searches);
}

#[tokio::test]
async fn scan_for_deleted_batch_is_dropped() {
    let (h, w) = seeded().await;
    let batch_id = h.schedule().await;
    h.store.delete_batch(batch_id).await.unwrap();
    h.scraper(w.r1).set("Clowns", &[("Clowns - Bad Blood", "$30")]);

    let err = h.worker.work_once(false).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::BatchNotFound(id)) if *id == batch_id
    ));
    assert_eq!(h.store.sku_count().await, 0);
}

#[tokio::test]
async fn report_artists_are_frozen_at_schedule_time() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Pixies", &[("Pixies - Doolittle", "$35")]);
    let batch_id = h.schedule().await;
    h.store.unwatch(w.bob, w.pixies).await;
    h.run_workers(2).await;

    let bob = h.store.report_for_user(batch_id, w.bob).await.unwrap();
    assert_eq!(h.store.report_sku_ids(bob.id).await.len(), 1);
}

struct FailingQueue {
    inner: MemoryQueue,
    fail_after: usize,
    pushed: Mutex<usize>,
}

#[async_trait]
impl WorkQueue for FailingQueue {
    async fn enqueue(&self, request: &ScanRequest) -> Result<()> {
        {
            let mut pushed = self.pushed.lock().unwrap();
            if *pushed >= self.fail_after {
                return Err(anyhow!("queue connection reset"));
            }
            *pushed += 1;
        }
        self.inner.enqueue(request).await
    }

    async fn dequeue(&self, blocking: bool) -> Result<Option<vinyl_watch::queue::Delivery>> {
        self.inner.dequeue(blocking).await
    }

    async fn ack(&self, delivery: &vinyl_watch::queue::Delivery) -> Result<()> {
        self.inner.ack(delivery).await
    }

    async fn len(&self) -> Result<i64> {
        self.inner.len().await
    }
}

#[tokio::test]
async fn enqueue_failure_removes_the_batch() {
    let (h, _) = seeded().await;
    let queue = Arc::new(FailingQueue {
        inner: MemoryQueue::default(),
        fail_after: 2,
        pushed: Mutex::new(0),
    });
    let scheduler = Scheduler::new(
        Arc::new(h.store.clone()),
        queue,
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            startup_delay: Duration::ZERO,
        },
    );

    assert!(scheduler.schedule_cycle().await.is_err());
    assert!(h.store.recent_batches(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn send_failure_keeps_batch_open_without_resending() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Clowns", &[("Clowns - Bad Blood", "$30")]);
    h.notifier
        .reject
        .lock()
        .unwrap()
        .insert("bob@example.com".to_string());
    let batch_id = h.schedule().await;
    h.run_workers(2).await;

    let first = h.reporter.drain_completed_batches().await.unwrap();
    assert_eq!(first.sent, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.batches_finalised, 0);
    assert!(h.store.batch(batch_id).await.unwrap().unwrap().reported_at.is_none());

    h.notifier.reject.lock().unwrap().clear();
    let second = h.reporter.drain_completed_batches().await.unwrap();
    assert_eq!(second.sent, 1);
    assert_eq!(second.batches_finalised, 1);
    assert_eq!(
        h.notifier.recipients(),
        vec!["ann@example.com", "bob@example.com"]
    );
    assert!(h.store.batch(batch_id).await.unwrap().unwrap().reported_at.is_some());

    let third = h.reporter.drain_completed_batches().await.unwrap();
    assert_eq!(third, DrainSummary::default());
}

#[tokio::test]
async fn old_incomplete_batches_are_flagged_as_stalled() {
    let (h, _) = seeded().await;
    let batch_id = h.schedule().await;
    assert!(h.reporter.check_stalled().await.unwrap().is_empty());

    h.store
        .backdate_batch(batch_id, Utc::now() - ChronoDuration::hours(7))
        .await;
    let stalled = h.reporter.check_stalled().await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, batch_id);

    h.run_workers(1).await;
    assert!(h.reporter.check_stalled().await.unwrap().is_empty());
}

#[tokio::test]
async fn worker_loops_stop_on_shutdown() {
    let (h, w) = seeded().await;
    h.scraper(w.r2).set("Pixies", &[("Pixies - Bossanova", "$28")]);
    let batch_id = h.schedule().await;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(h.worker.clone().run(rx));
    for _ in 0..200 {
        if h.store.batch(batch_id).await.unwrap().unwrap().is_complete() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert!(h.store.batch(batch_id).await.unwrap().unwrap().is_complete());
}

#[tokio::test]
async fn redelivery_after_report_does_not_touch_the_ledger() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Pixies", &[("Pixies - Doolittle", "$30")]);
    let first = h.schedule().await;
    h.run_workers(2).await;
    h.reporter.drain_completed_batches().await.unwrap();
    assert!(h.store.batch(first).await.unwrap().unwrap().reported_at.is_some());

    // the same item comes back after its batch went out, and the price moved meanwhile
    h.scraper(w.r1).set("Pixies", &[("Pixies - Doolittle", "$35")]);
    let late = ScanRequest {
        batch_id: first,
        artist_id: w.pixies,
        artist_name: "Pixies".into(),
        retailer_id: w.r1,
        retailer_name: "Poison City".into(),
    };
    h.queue.enqueue(&late).await.unwrap();
    let outcome = h.worker.work_once(false).await.unwrap().unwrap();
    assert_eq!(outcome.completion, Completion::Duplicate);

    let release = h
        .store
        .release_id(w.pixies, "Pixies - Doolittle")
        .await
        .unwrap();
    let prices: Vec<String> = h
        .store
        .sku_history(release, w.r1)
        .await
        .into_iter()
        .map(|s| s.price)
        .collect();
    assert_eq!(prices, vec!["$30"]);

    h.schedule().await;
    h.run_workers(2).await;
    let summary = h.reporter.drain_completed_batches().await.unwrap();
    assert_eq!(summary.sent, 1);
    let bob_mails: Vec<String> = h
        .notifier
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|(to, _)| to == "bob@example.com")
        .map(|(_, html)| html.clone())
        .collect();
    assert_eq!(bob_mails.len(), 2);
    assert!(bob_mails[1].contains("$35"));
}

#[tokio::test]
async fn failed_scrape_does_not_sweep_known_listings() {
    let (h, w) = seeded().await;
    h.scraper(w.r1).set("Clowns", &[("Clowns - Bad Blood", "$30")]);
    h.schedule().await;
    h.run_workers(1).await;

    h.scraper(w.r1).fail(true);
    h.schedule().await;
    h.run_workers(1).await;

    let release = h.store.release_id(w.clowns, "Clowns - Bad Blood").await.unwrap();
    let history = h.store.sku_history(release, w.r1).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, "$30");
}

#[tokio::test]
async fn shutdown_lets_the_current_scan_finish() {
    let store = MemoryStore::new();
    let ann = store.add_user("Ann", "ann@example.com").await;
    let pixies = store.add_artist("Pixies").await;
    let shop = store.add_retailer("Poison City", "https://poisoncity.example", "shopify").await;
    store.watch(ann, pixies).await;
    let h = Harness::new(store, &[shop]).await;
    h.scraper(shop).set("Pixies", &[("Pixies - Bossanova", "$28")]);
    h.scraper(shop).slow_down(Duration::from_millis(200));
    let batch_id = h.schedule().await;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(h.worker.clone().run(rx));
    for _ in 0..200 {
        if h.queue.len().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // the only item is now mid-scrape
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let batch = h.store.batch(batch_id).await.unwrap().unwrap();
    assert!(batch.is_complete());
    assert_eq!(h.store.sku_count().await, 1);
}
