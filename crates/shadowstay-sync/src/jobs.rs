//! Job manager: one-shot scrapes, resumable batch crawls, staleness sweeps and
//! the compliance queries built on stored matches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use shadowstay_adapters::{adapter_for_platform, Crawler, PlatformAdapter, SelectorCatalog, StopReason};
use shadowstay_core::{
    BatchJob, BatchStatus, DetectedOwner, JobCounters, ListingDraft, MarketMetrics, MatchType,
    NormalizedListing, Platform, RegisteredProperty, ScrapeJob, ScrapedListing, SearchParams,
};
use shadowstay_storage::store::best_matches;
use shadowstay_storage::{BackoffPolicy, ListingFilter, ListingStore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::export::{self, ExportManifest};
use crate::matching::IdentityMatcher;
use crate::metrics::compute_market_metrics;
use crate::normalize::{canonical_city, normalize};
use crate::owners;
use crate::registry::RegistrySource;

/// When a batch gives up on consecutive page errors and how long it waits
/// between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub error_threshold: u32,
    pub backoff: BackoffPolicy,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            backoff: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
            },
        }
    }
}

/// Cooperative pause flag, checked by batch runners between pages.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle(Arc<AtomicBool>);

impl PauseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeRun {
    pub job: ScrapeJob,
    pub pages_visited: u32,
    pub stop: Option<StopReason>,
}

type CandidateCache = HashMap<String, Option<Vec<RegisteredProperty>>>;

pub struct JobManager {
    store: Arc<dyn ListingStore>,
    registry: Arc<dyn RegistrySource>,
    crawler: Crawler,
    catalog: SelectorCatalog,
    matcher: IdentityMatcher,
    policy: BatchPolicy,
    stale_after_days: i64,
    reports_dir: Option<PathBuf>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn ListingStore>,
        registry: Arc<dyn RegistrySource>,
        crawler: Crawler,
        catalog: SelectorCatalog,
    ) -> Self {
        Self {
            store,
            registry,
            crawler,
            catalog,
            matcher: IdentityMatcher::default(),
            policy: BatchPolicy::default(),
            stale_after_days: 14,
            reports_dir: None,
        }
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stale_after_days(mut self, days: i64) -> Self {
        self.stale_after_days = days;
        self
    }

    /// Write `run.json` and `brief.md` per finished job under `dir`.
    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    fn adapter(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>> {
        adapter_for_platform(platform, &self.catalog)
            .ok_or_else(|| anyhow!("no selector profile configured for {platform}"))
    }

    /// Crawl once and persist the results. A navigation failure ends the job
    /// as `failed`; it is not returned as an error.
    pub async fn run_scrape(&self, platform: Platform, params: SearchParams) -> Result<ScrapeRun> {
        let adapter = self.adapter(platform)?;
        let mut job = ScrapeJob::new(platform, params.clone());
        self.store
            .save_scrape_job(&job)
            .await
            .context("saving scrape job")?;
        job.start()?;
        self.store
            .save_scrape_job(&job)
            .await
            .context("saving scrape job")?;

        let span = info_span!("scrape_job", job_id = %job.id, %platform, city = %params.city);
        let (pages_visited, stop) = match self.crawler.crawl(adapter, params.clone()).instrument(span.clone()).await {
            Ok(report) => {
                let mut counters = self
                    .persist_drafts(&params.city, report.listings)
                    .instrument(span.clone())
                    .await;
                counters.detail_failures = report.detail_failures;
                job.complete(counters)?;
                (report.pages_visited, report.stop)
            }
            Err(err) => {
                warn!(job_id = %job.id, %platform, error = %err, "scrape job failed");
                job.fail(err.to_string())?;
                (0, None)
            }
        };
        self.store
            .save_scrape_job(&job)
            .await
            .context("saving scrape job")?;
        info!(
            job_id = %job.id,
            %platform,
            status = job.status.as_str(),
            found = job.counters.listings_found,
            new = job.counters.listings_new,
            updated = job.counters.listings_updated,
            "scrape job finished"
        );

        let run = ScrapeRun {
            job,
            pages_visited,
            stop,
        };
        self.write_report(run.job.id, &run, &export::scrape_brief(&run)).await;
        Ok(run)
    }

    /// Create a batch job and run it until completion, pause or the error
    /// threshold.
    pub async fn start_batch(
        &self,
        platform: Platform,
        params: SearchParams,
        pause: &PauseHandle,
    ) -> Result<BatchJob> {
        let job = BatchJob::new(platform, params);
        self.store
            .save_batch_job(&job)
            .await
            .context("saving batch job")?;
        info!(job_id = %job.id, %platform, city = %job.params.city, pages = job.params.max_pages, "batch job created");
        self.run_batch(job, pause).await
    }

    /// Continue a paused or interrupted batch from its persisted cursor.
    pub async fn resume_batch(&self, id: Uuid, pause: &PauseHandle) -> Result<BatchJob> {
        let mut job = self
            .store
            .load_batch_job(id)
            .await
            .context("loading batch job")?
            .ok_or_else(|| anyhow!("batch job {id} not found"))?;
        if !job.is_resumable() {
            bail!("batch job {id} is {} and cannot be resumed", job.status.as_str());
        }
        self.store
            .set_pause_requested(Some(id), false)
            .await
            .context("clearing pause flag")?;
        job.pause_requested = false;
        job.consecutive_errors = 0;
        info!(job_id = %id, page = job.current_page, found = job.counters.listings_found, "resuming batch job");
        self.run_batch(job, pause).await
    }

    /// Ask running batches to pause after their current page. Returns how many
    /// jobs were flagged.
    pub async fn pause(&self, id: Option<Uuid>) -> Result<u64> {
        let flagged = self
            .store
            .set_pause_requested(id, true)
            .await
            .context("setting pause flag")?;
        info!(flagged, "pause requested");
        Ok(flagged)
    }

    pub async fn running_batches(&self) -> Result<Vec<BatchJob>> {
        Ok(self.store.running_batch_jobs().await?)
    }

    async fn run_batch(&self, job: BatchJob, pause: &PauseHandle) -> Result<BatchJob> {
        let adapter = self.adapter(job.platform)?;
        let span = info_span!(
            "batch_job",
            job_id = %job.id,
            platform = %job.platform,
            city = %job.params.city
        );
        let job = self.drive_batch(job, adapter, pause).instrument(span).await?;
        if job.status == BatchStatus::Completed {
            self.write_report(job.id, &job, &export::batch_brief(&job)).await;
        }
        Ok(job)
    }

    async fn drive_batch(
        &self,
        mut job: BatchJob,
        adapter: Arc<dyn PlatformAdapter>,
        pause: &PauseHandle,
    ) -> Result<BatchJob> {
        job.set_status(BatchStatus::Running);
        self.store
            .save_batch_job(&job)
            .await
            .context("saving batch job")?;

        let mut walk = self.crawler.resume_walk(
            Arc::clone(&adapter),
            job.params.clone(),
            job.current_page,
            job.next_page_url.clone(),
        );

        while job.status == BatchStatus::Running {
            if self.pause_requested(&job, pause).await {
                info!(page = job.current_page, "batch paused on request");
                job.set_status(BatchStatus::Paused);
            } else {
                match walk.next_page().await {
                    Ok(Some(outcome)) => {
                        let mut counters = self.persist_drafts(&job.params.city, outcome.listings).await;
                        counters.detail_failures = outcome.detail_failures;
                        job.record_page(counters, outcome.next_url);
                        info!(
                            page = outcome.page,
                            found = counters.listings_found,
                            new = counters.listings_new,
                            total = job.counters.listings_found,
                            "batch page recorded"
                        );
                        if let Some(stop) = outcome.stop {
                            info!(?stop, "batch finished");
                            job.set_status(BatchStatus::Completed);
                        }
                    }
                    Ok(None) => job.set_status(BatchStatus::Completed),
                    Err(err) => {
                        let errors = job.record_error(err.to_string());
                        warn!(page = job.current_page, errors, error = %err, "batch page failed");
                        if errors >= self.policy.error_threshold {
                            warn!(threshold = self.policy.error_threshold, "consecutive error threshold reached; pausing");
                            job.set_status(BatchStatus::Paused);
                        } else {
                            self.store
                                .save_batch_job(&job)
                                .await
                                .context("saving batch progress")?;
                            let delay = self
                                .policy
                                .backoff
                                .delay_for_attempt(errors.saturating_sub(1) as usize);
                            debug!(?delay, "backing off before retrying page");
                            tokio::time::sleep(delay).await;
                            walk = self.crawler.resume_walk(
                                Arc::clone(&adapter),
                                job.params.clone(),
                                job.current_page,
                                job.next_page_url.clone(),
                            );
                            continue;
                        }
                    }
                }
            }
            self.store
                .save_batch_job(&job)
                .await
                .context("saving batch progress")?;
        }
        Ok(job)
    }

    async fn pause_requested(&self, job: &BatchJob, pause: &PauseHandle) -> bool {
        if pause.is_requested() {
            return true;
        }
        match self.store.load_batch_job(job.id).await {
            Ok(Some(stored)) => stored.pause_requested,
            Ok(None) => false,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "could not reload pause flag");
                false
            }
        }
    }

    /// Normalize, upsert and (on first insert only) match each draft. Store
    /// failures skip the listing and are counted.
    async fn persist_drafts(&self, search_city: &str, drafts: Vec<ListingDraft>) -> JobCounters {
        let mut counters = JobCounters {
            listings_found: drafts.len() as u32,
            ..Default::default()
        };
        let mut cache = CandidateCache::new();
        for draft in drafts {
            let mut normalized = normalize(draft);
            if normalized.listing.city.is_none() {
                normalized.listing.city = canonical_city(search_city);
            }
            let row = ScrapedListing::from_normalized(&normalized, Utc::now());
            let outcome = match self.store.upsert_listing(&row).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        platform = %row.platform,
                        external_id = %row.external_id,
                        error = %err,
                        "listing not persisted"
                    );
                    counters.persist_failures += 1;
                    continue;
                }
            };
            if !outcome.inserted {
                counters.listings_updated += 1;
                continue;
            }
            counters.listings_new += 1;
            // Updates keep their first match set.
            let city = normalized
                .listing
                .city
                .clone()
                .unwrap_or_else(|| resolve_city(search_city));
            self.match_listing(outcome.id, &normalized, &city, &mut cache).await;
        }
        counters
    }

    async fn match_listing(
        &self,
        listing_id: Uuid,
        listing: &NormalizedListing,
        city: &str,
        cache: &mut CandidateCache,
    ) {
        if !cache.contains_key(city) {
            let loaded = match self.registry.active_properties(city).await {
                Ok(rows) => Some(rows),
                Err(err) => {
                    warn!(city, error = %err, "registry unavailable; listings left unmatched");
                    None
                }
            };
            cache.insert(city.to_string(), loaded);
        }
        let Some(Some(candidates)) = cache.get(city) else {
            return;
        };
        for result in self.matcher.match_listing(listing_id, listing, city, candidates) {
            if let Err(err) = self.store.upsert_match(&result).await {
                warn!(listing_id = %listing_id, error = %err, "match not persisted");
            }
        }
    }

    /// Soft-delete listings of `platform` not seen for `days` (default from
    /// configuration).
    pub async fn cleanup(&self, platform: Platform, days: Option<i64>) -> Result<u64> {
        let days = days.unwrap_or(self.stale_after_days).max(0);
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let marked = self
            .store
            .mark_stale(platform, cutoff)
            .await
            .context("marking stale listings")?;
        info!(%platform, days, marked, "staleness sweep finished");
        Ok(marked)
    }

    /// Active listings in `city` whose best match is `no_match` or missing.
    pub async fn list_unregistered(&self, city: &str, limit: Option<usize>) -> Result<Vec<ScrapedListing>> {
        let (listings, best) = self.active_with_best_matches(Some(city)).await?;
        let mut shadow: Vec<ScrapedListing> = listings
            .into_iter()
            .filter(|l| best.get(&l.id).map_or(true, |m| m.match_type == MatchType::NoMatch))
            .collect();
        if let Some(limit) = limit {
            shadow.truncate(limit);
        }
        Ok(shadow)
    }

    /// Recompute and upsert the market aggregate for `city`. The period
    /// defaults to the seven days ending today.
    pub async fn generate_metrics(
        &self,
        city: &str,
        period_start: Option<NaiveDate>,
        period_end: Option<NaiveDate>,
    ) -> Result<MarketMetrics> {
        let period_end = period_end.unwrap_or_else(|| Utc::now().date_naive());
        let period_start = period_start.unwrap_or(period_end - chrono::Duration::days(6));
        if period_start > period_end {
            bail!("period start {period_start} is after period end {period_end}");
        }
        let city = resolve_city(city);
        let (listings, best) = self.active_with_best_matches(Some(&city)).await?;
        let metrics = compute_market_metrics(&city, period_start, period_end, &listings, &best, Utc::now());
        self.store
            .upsert_market_metrics(&metrics)
            .await
            .context("saving market metrics")?;
        info!(
            city = %city,
            %period_start,
            %period_end,
            total = metrics.total_listings,
            compliance_rate = metrics.compliance_rate,
            "market metrics computed"
        );
        Ok(metrics)
    }

    /// Group active listings into owners and upsert them.
    pub async fn detect_owners(&self, city: Option<&str>) -> Result<Vec<DetectedOwner>> {
        let (listings, best) = self.active_with_best_matches(city).await?;
        let owners = owners::detect_owners(&listings, &best);
        for owner in &owners {
            self.store
                .upsert_owner(owner)
                .await
                .with_context(|| format!("saving owner {}", owner.identifier))?;
        }
        info!(
            listings = listings.len(),
            owners = owners.len(),
            multi_property = owners.iter().filter(|o| o.is_multi_property()).count(),
            "owner detection finished"
        );
        Ok(owners)
    }

    /// Parquet snapshot of the active listings in `city` and their matches.
    pub async fn export(&self, city: &str, out_dir: &Path) -> Result<ExportManifest> {
        let (listings, _) = self.active_with_best_matches(Some(city)).await?;
        let ids: Vec<Uuid> = listings.iter().map(|l| l.id).collect();
        let matches = self
            .store
            .matches_for(&ids)
            .await
            .context("loading matches")?;
        export::export_snapshot(out_dir, &listings, &matches).await
    }

    async fn active_with_best_matches(
        &self,
        city: Option<&str>,
    ) -> Result<(Vec<ScrapedListing>, HashMap<Uuid, shadowstay_core::MatchResult>)> {
        let filter = ListingFilter {
            city: city.map(resolve_city),
            active_only: true,
            ..Default::default()
        };
        let listings = self
            .store
            .select_listings(&filter)
            .await
            .context("loading listings")?;
        let ids: Vec<Uuid> = listings.iter().map(|l| l.id).collect();
        let matches = self
            .store
            .matches_for(&ids)
            .await
            .context("loading matches")?;
        Ok((listings, best_matches(matches)))
    }

    async fn write_report<T: Serialize>(&self, id: Uuid, record: &T, brief: &str) {
        let Some(dir) = &self.reports_dir else {
            return;
        };
        if let Err(err) = export::write_run_report(dir, id, record, brief).await {
            warn!(job_id = %id, error = %err, "run report not written");
        }
    }
}

fn resolve_city(city: &str) -> String {
    canonical_city(city).unwrap_or_else(|| city.trim().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::DateTime;
    use shadowstay_adapters::{CrawlerConfig, FixtureRenderer};
    use shadowstay_core::{JobStatus, MatchResult};
    use shadowstay_storage::{MemoryStore, RateLimitConfig, RateLimiter, StoreError, UpsertOutcome};

    use super::*;
    use crate::registry::StaticRegistry;

    /// Memory store that remembers every scrape job status it was handed.
    #[derive(Default)]
    struct JobLog {
        inner: MemoryStore,
        statuses: Mutex<Vec<JobStatus>>,
    }

    #[async_trait]
    impl ListingStore for JobLog {
        async fn upsert_listing(&self, listing: &ScrapedListing) -> Result<UpsertOutcome, StoreError> {
            self.inner.upsert_listing(listing).await
        }

        async fn get_listing(
            &self,
            platform: Platform,
            external_id: &str,
        ) -> Result<Option<ScrapedListing>, StoreError> {
            self.inner.get_listing(platform, external_id).await
        }

        async fn select_listings(&self, filter: &ListingFilter) -> Result<Vec<ScrapedListing>, StoreError> {
            self.inner.select_listings(filter).await
        }

        async fn mark_stale(&self, platform: Platform, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.mark_stale(platform, cutoff).await
        }

        async fn upsert_match(&self, result: &MatchResult) -> Result<(), StoreError> {
            self.inner.upsert_match(result).await
        }

        async fn matches_for(&self, listing_ids: &[Uuid]) -> Result<Vec<MatchResult>, StoreError> {
            self.inner.matches_for(listing_ids).await
        }

        async fn save_scrape_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
            self.statuses.lock().expect("lock").push(job.status);
            self.inner.save_scrape_job(job).await
        }

        async fn get_scrape_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, StoreError> {
            self.inner.get_scrape_job(id).await
        }

        async fn save_batch_job(&self, job: &BatchJob) -> Result<(), StoreError> {
            self.inner.save_batch_job(job).await
        }

        async fn load_batch_job(&self, id: Uuid) -> Result<Option<BatchJob>, StoreError> {
            self.inner.load_batch_job(id).await
        }

        async fn set_pause_requested(&self, id: Option<Uuid>, requested: bool) -> Result<u64, StoreError> {
            self.inner.set_pause_requested(id, requested).await
        }

        async fn running_batch_jobs(&self) -> Result<Vec<BatchJob>, StoreError> {
            self.inner.running_batch_jobs().await
        }

        async fn upsert_market_metrics(&self, metrics: &MarketMetrics) -> Result<(), StoreError> {
            self.inner.upsert_market_metrics(metrics).await
        }

        async fn get_market_metrics(
            &self,
            city: &str,
            period_start: NaiveDate,
            period_end: NaiveDate,
        ) -> Result<Option<MarketMetrics>, StoreError> {
            self.inner.get_market_metrics(city, period_start, period_end).await
        }

        async fn upsert_owner(&self, owner: &DetectedOwner) -> Result<(), StoreError> {
            self.inner.upsert_owner(owner).await
        }
    }

    #[tokio::test]
    async fn scrape_jobs_are_recorded_as_pending_before_they_run() {
        let store = Arc::new(JobLog::default());
        let renderer = FixtureRenderer::builder().build();
        let crawler = Crawler::new(
            Arc::new(renderer),
            Arc::new(RateLimiter::new(RateLimitConfig {
                max_requests: 100,
                window: Duration::from_secs(60),
            })),
            CrawlerConfig {
                nav_attempts: 1,
                retry_delay: Duration::ZERO,
                results_timeout: Duration::from_millis(5),
                ..CrawlerConfig::default()
            },
        );
        let manager = JobManager::new(
            store.clone(),
            Arc::new(StaticRegistry::new(Vec::new())),
            crawler,
            SelectorCatalog::builtin().expect("catalog"),
        );

        let run = manager
            .run_scrape(Platform::ExpatDakar, SearchParams::new("Dakar", 1))
            .await
            .expect("scrape");

        assert_eq!(run.job.status, JobStatus::Failed);
        assert_eq!(
            *store.statuses.lock().expect("lock"),
            vec![JobStatus::Pending, JobStatus::Running, JobStatus::Failed]
        );
    }

    #[test]
    fn pause_handle_is_shared() {
        let handle = PauseHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_requested());
        clone.request();
        assert!(handle.is_requested());
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = BatchPolicy::default();
        assert_eq!(policy.error_threshold, 5);
        assert_eq!(policy.backoff.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.backoff.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.backoff.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn cities_resolve_through_aliases() {
        assert_eq!(resolve_city("saly portudal"), "Saly");
        assert_eq!(resolve_city(" Kédougou "), "Kédougou");
    }
}
