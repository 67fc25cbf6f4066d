//! In-process store with the same transactional behaviour as the Postgres one.
//!
//! A transaction holds the state lock for its whole lifetime and works on a
//! staged copy, so concurrent transactions serialise and a rollback (or a
//! dropped transaction) leaves no trace.
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{PipelineStore, PipelineTx};
use crate::error::PipelineError;
use crate::model::{
    Artist, Batch, NewSku, PendingReport, Release, Report, ReportedSku, Retailer, Sku, WatchMap,
    WatchedArtist,
};

#[derive(Debug, Clone)]
struct User {
    name: String,
    email: String,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    users: BTreeMap<i64, User>,
    artists: BTreeMap<i64, Artist>,
    retailers: BTreeMap<i64, Retailer>,
    /// (user_id, artist_id)
    follows: BTreeSet<(i64, i64)>,
    releases: BTreeMap<i64, Release>,
    skus: Vec<Sku>,
    batches: BTreeMap<i64, Batch>,
    reports: BTreeMap<i64, Report>,
    /// (batch_id, report_id, artist_id)
    report_artists: BTreeSet<(i64, i64, i64)>,
    /// (report_id, sku_id)
    report_skus: BTreeSet<(i64, i64)>,
    /// (batch_id, artist_id, retailer_id)
    completions: BTreeSet<(i64, i64, i64)>,
    fail_sku_inserts: bool,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn latest_sku(&self, release_id: i64, retailer_id: i64) -> Option<&Sku> {
        self.skus
            .iter()
            .filter(|s| s.release_id == release_id && s.retailer_id == retailer_id)
            .max_by_key(|s| (s.created_at, s.id))
    }

    fn remove_report(&mut self, report_id: i64) {
        self.reports.remove(&report_id);
        self.report_artists.retain(|(_, r, _)| *r != report_id);
        self.report_skus.retain(|(r, _)| *r != report_id);
    }

    fn has_pending_reports(&self, batch_id: i64) -> bool {
        self.reports
            .values()
            .any(|r| r.batch_id == batch_id && r.completed_at.is_none())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, name: &str, email: &str) -> i64 {
        let mut st = self.state.lock().await;
        let id = st.next_id();
        st.users.insert(
            id,
            User {
                name: name.to_string(),
                email: email.to_string(),
            },
        );
        id
    }

    pub async fn add_artist(&self, name: &str) -> i64 {
        let mut st = self.state.lock().await;
        let id = st.next_id();
        st.artists.insert(
            id,
            Artist {
                id,
                name: name.to_string(),
                variants: vec![],
            },
        );
        id
    }

    pub async fn add_retailer(&self, name: &str, url: &str, adapter: &str) -> i64 {
        let mut st = self.state.lock().await;
        let id = st.next_id();
        st.retailers.insert(
            id,
            Retailer {
                id,
                name: name.to_string(),
                url: url.to_string(),
                adapter: adapter.to_string(),
            },
        );
        id
    }

    pub async fn watch(&self, user_id: i64, artist_id: i64) {
        self.state.lock().await.follows.insert((user_id, artist_id));
    }

    pub async fn unwatch(&self, user_id: i64, artist_id: i64) {
        self.state.lock().await.follows.remove(&(user_id, artist_id));
    }

    /// Every ledger row for the pair, oldest first.
    pub async fn sku_history(&self, release_id: i64, retailer_id: i64) -> Vec<Sku> {
        let st = self.state.lock().await;
        let mut rows: Vec<Sku> = st
            .skus
            .iter()
            .filter(|s| s.release_id == release_id && s.retailer_id == retailer_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.created_at, s.id));
        rows
    }

    pub async fn sku_count(&self) -> usize {
        self.state.lock().await.skus.len()
    }

    pub async fn release_id(&self, artist_id: i64, title: &str) -> Option<i64> {
        let st = self.state.lock().await;
        st.releases
            .values()
            .find(|r| r.artist_id == artist_id && r.title == title)
            .map(|r| r.id)
    }

    pub async fn reports_for_batch(&self, batch_id: i64) -> Vec<Report> {
        let st = self.state.lock().await;
        st.reports
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect()
    }

    pub async fn report_for_user(&self, batch_id: i64, user_id: i64) -> Option<Report> {
        let st = self.state.lock().await;
        st.reports
            .values()
            .find(|r| r.batch_id == batch_id && r.user_id == user_id)
            .cloned()
    }

    pub async fn report_artist_ids(&self, report_id: i64) -> Vec<i64> {
        let st = self.state.lock().await;
        st.report_artists
            .iter()
            .filter(|(_, r, _)| *r == report_id)
            .map(|(_, _, a)| *a)
            .collect()
    }

    pub async fn report_sku_ids(&self, report_id: i64) -> Vec<i64> {
        let st = self.state.lock().await;
        st.report_skus
            .iter()
            .filter(|(r, _)| *r == report_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub async fn backdate_batch(&self, batch_id: i64, created_at: DateTime<Utc>) {
        if let Some(b) = self.state.lock().await.batches.get_mut(&batch_id) {
            b.created_at = created_at;
        }
    }

    /// Make every subsequent `insert_sku` fail until switched off.
    pub async fn set_fail_sku_inserts(&self, fail: bool) {
        self.state.lock().await.fail_sku_inserts = fail;
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn PipelineTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }

    async fn retailers(&self) -> Result<Vec<Retailer>> {
        Ok(self.state.lock().await.retailers.values().cloned().collect())
    }

    async fn watched_artists(&self) -> Result<WatchMap> {
        let st = self.state.lock().await;
        let mut watches = WatchMap::new();
        for (user_id, artist_id) in &st.follows {
            let Some(artist) = st.artists.get(artist_id) else {
                continue;
            };
            watches.entry(*user_id).or_default().push(WatchedArtist {
                user_id: *user_id,
                artist_id: artist.id,
                artist_name: artist.name.clone(),
                artist_variants: artist.variants.clone(),
            });
        }
        Ok(watches)
    }

    async fn delete_batch(&self, batch_id: i64) -> Result<()> {
        let mut st = self.state.lock().await;
        st.batches.remove(&batch_id);
        let report_ids: Vec<i64> = st
            .reports
            .values()
            .filter(|r| r.batch_id == batch_id)
            .map(|r| r.id)
            .collect();
        for id in report_ids {
            st.remove_report(id);
        }
        st.report_artists.retain(|(b, _, _)| *b != batch_id);
        st.completions.retain(|(b, _, _)| *b != batch_id);
        Ok(())
    }

    async fn batch(&self, batch_id: i64) -> Result<Option<Batch>> {
        Ok(self.state.lock().await.batches.get(&batch_id).cloned())
    }

    async fn recent_batches(&self, limit: i64) -> Result<Vec<Batch>> {
        let st = self.state.lock().await;
        let mut rows: Vec<Batch> = st.batches.values().cloned().collect();
        rows.sort_by_key(|b| std::cmp::Reverse((b.created_at, b.id)));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn stalled_batches(&self, cutoff: DateTime<Utc>) -> Result<Vec<Batch>> {
        let st = self.state.lock().await;
        Ok(st
            .batches
            .values()
            .filter(|b| b.reported_at.is_none() && !b.is_complete() && b.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn completed_unsent_reports(&self) -> Result<Vec<PendingReport>> {
        let st = self.state.lock().await;
        let mut pending = Vec::new();
        for r in st.reports.values() {
            let Some(batch) = st.batches.get(&r.batch_id) else {
                continue;
            };
            if batch.reported_at.is_some() || !batch.is_complete() || r.completed_at.is_some() {
                continue;
            }
            let Some(user) = st.users.get(&r.user_id) else {
                continue;
            };
            pending.push(PendingReport {
                report_id: r.id,
                batch_id: r.batch_id,
                user_id: r.user_id,
                user_name: user.name.clone(),
                user_email: user.email.clone(),
            });
        }
        pending.sort_by_key(|p| (p.batch_id, p.report_id));
        Ok(pending)
    }

    async fn skus_for_report(&self, report_id: i64) -> Result<Vec<ReportedSku>> {
        let st = self.state.lock().await;
        let mut rows = Vec::new();
        for (_, sku_id) in st.report_skus.iter().filter(|(r, _)| *r == report_id) {
            let Some(sku) = st.skus.iter().find(|s| s.id == *sku_id) else {
                continue;
            };
            let (Some(release), Some(artist), Some(retailer)) = (
                st.releases.get(&sku.release_id),
                st.artists.get(&sku.artist_id),
                st.retailers.get(&sku.retailer_id),
            ) else {
                continue;
            };
            rows.push(ReportedSku {
                sku_id: sku.id,
                artist: artist.name.clone(),
                title: release.title.clone(),
                retailer: retailer.name.clone(),
                retailer_url: retailer.url.clone(),
                item_url: sku.item_url.clone(),
                image_url: sku.image_url.clone(),
                price: sku.price.clone(),
            });
        }
        rows.sort_by(|a, b| (&a.artist, &a.title, a.sku_id).cmp(&(&b.artist, &b.title, b.sku_id)));
        Ok(rows)
    }

    async fn mark_report_sent(&self, report_id: i64) -> Result<()> {
        let mut st = self.state.lock().await;
        let Some(report) = st.reports.get_mut(&report_id) else {
            return Err(PipelineError::ReportNotFound(report_id).into());
        };
        let now = Utc::now();
        report.sent_at = Some(now);
        report.completed_at = Some(now);
        Ok(())
    }

    async fn delete_report(&self, report_id: i64) -> Result<()> {
        self.state.lock().await.remove_report(report_id);
        Ok(())
    }

    async fn mark_batch_reported(&self, batch_id: i64) -> Result<bool> {
        let mut st = self.state.lock().await;
        match st.batches.get_mut(&batch_id) {
            Some(b) if b.reported_at.is_none() && b.is_complete() => {
                b.reported_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn drained_batches(&self) -> Result<Vec<i64>> {
        let st = self.state.lock().await;
        Ok(st
            .batches
            .values()
            .filter(|b| b.reported_at.is_none() && b.is_complete())
            .filter(|b| !st.has_pending_reports(b.id))
            .map(|b| b.id)
            .collect())
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

#[async_trait]
impl PipelineTx for MemoryTx {
    async fn insert_batch(&mut self, required_searches: i64) -> Result<i64> {
        if required_searches < 0 {
            bail!("batch cannot require {required_searches} searches");
        }
        let id = self.staged.next_id();
        self.staged.batches.insert(
            id,
            Batch {
                id,
                required_searches,
                completed_searches: 0,
                created_at: Utc::now(),
                reported_at: None,
            },
        );
        Ok(id)
    }

    async fn insert_report(&mut self, batch_id: i64, user_id: i64) -> Result<i64> {
        if !self.staged.batches.contains_key(&batch_id) {
            bail!("batch {batch_id} does not exist");
        }
        if self
            .staged
            .reports
            .values()
            .any(|r| r.batch_id == batch_id && r.user_id == user_id)
        {
            bail!("report for user {user_id} already exists in batch {batch_id}");
        }
        let id = self.staged.next_id();
        self.staged.reports.insert(
            id,
            Report {
                id,
                user_id,
                batch_id,
                completed_at: None,
                sent_at: None,
            },
        );
        Ok(id)
    }

    async fn insert_report_artist(
        &mut self,
        batch_id: i64,
        report_id: i64,
        artist_id: i64,
    ) -> Result<()> {
        self.staged
            .report_artists
            .insert((batch_id, report_id, artist_id));
        Ok(())
    }

    async fn upsert_release(&mut self, artist_id: i64, title: &str) -> Result<Release> {
        let now = Utc::now();
        if let Some(existing) = self
            .staged
            .releases
            .values_mut()
            .find(|r| r.artist_id == artist_id && r.title == title)
        {
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let id = self.staged.next_id();
        let release = Release {
            id,
            artist_id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.staged.releases.insert(id, release.clone());
        Ok(release)
    }

    async fn current_sku(&mut self, release_id: i64, retailer_id: i64) -> Result<Option<Sku>> {
        Ok(self.staged.latest_sku(release_id, retailer_id).cloned())
    }

    async fn insert_sku(&mut self, sku: &NewSku) -> Result<Sku> {
        if self.staged.fail_sku_inserts {
            bail!("failed to insert sku");
        }
        let id = self.staged.next_id();
        let row = Sku {
            id,
            release_id: sku.release_id,
            retailer_id: sku.retailer_id,
            artist_id: sku.artist_id,
            item_url: sku.item_url.clone(),
            image_url: sku.image_url.clone(),
            price: sku.price.clone(),
            created_at: Utc::now(),
        };
        self.staged.skus.push(row.clone());
        Ok(row)
    }

    async fn current_skus_for_artist_retailer(
        &mut self,
        artist_id: i64,
        retailer_id: i64,
    ) -> Result<Vec<Sku>> {
        let release_ids: BTreeSet<i64> = self
            .staged
            .skus
            .iter()
            .filter(|s| s.artist_id == artist_id && s.retailer_id == retailer_id)
            .map(|s| s.release_id)
            .collect();
        Ok(release_ids
            .into_iter()
            .filter_map(|rid| self.staged.latest_sku(rid, retailer_id).cloned())
            .collect())
    }

    async fn reports_covering_artist(
        &mut self,
        batch_id: i64,
        artist_id: i64,
    ) -> Result<Vec<i64>> {
        Ok(self
            .staged
            .report_artists
            .iter()
            .filter(|(b, _, a)| *b == batch_id && *a == artist_id)
            .map(|(_, r, _)| *r)
            .collect())
    }

    async fn attach_sku_to_reports(&mut self, sku_id: i64, report_ids: &[i64]) -> Result<u64> {
        let mut added = 0;
        for report_id in report_ids {
            if !self.staged.reports.contains_key(report_id) {
                bail!("report {report_id} does not exist");
            }
            if self.staged.report_skus.insert((*report_id, sku_id)) {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn record_completion(
        &mut self,
        batch_id: i64,
        artist_id: i64,
        retailer_id: i64,
    ) -> Result<bool> {
        if !self.staged.batches.contains_key(&batch_id) {
            bail!("batch {batch_id} does not exist");
        }
        Ok(self
            .staged
            .completions
            .insert((batch_id, artist_id, retailer_id)))
    }

    async fn increment_completed(&mut self, batch_id: i64) -> Result<u64> {
        match self.staged.batches.get_mut(&batch_id) {
            Some(b) if b.completed_searches < b.required_searches => {
                b.completed_searches += 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn batch(&mut self, batch_id: i64) -> Result<Option<Batch>> {
        Ok(self.staged.batches.get(&batch_id).cloned())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
