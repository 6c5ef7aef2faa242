//! In-process [`ListingStore`] used by tests and database-less runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use shadowstay_core::{
    BatchJob, BatchStatus, DetectedOwner, MarketMetrics, MatchResult, Platform, ScrapeJob,
    ScrapedListing,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ListingFilter, ListingStore, StoreError, UpsertOutcome};

#[derive(Debug, Default)]
struct Tables {
    listings: HashMap<(Platform, String), ScrapedListing>,
    matches: HashMap<(Uuid, Option<String>), MatchResult>,
    scrape_jobs: HashMap<Uuid, ScrapeJob>,
    batch_jobs: HashMap<Uuid, BatchJob>,
    metrics: HashMap<(NaiveDate, NaiveDate, String), MarketMetrics>,
    owners: HashMap<String, DetectedOwner>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listing_count(&self) -> usize {
        self.tables.read().await.listings.len()
    }

    pub async fn owners(&self) -> Vec<DetectedOwner> {
        let mut owners: Vec<_> = self.tables.read().await.owners.values().cloned().collect();
        owners.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        owners
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn upsert_listing(&self, listing: &ScrapedListing) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        let key = (listing.platform, listing.external_id.clone());
        match tables.listings.get_mut(&key) {
            Some(existing) => {
                let id = existing.id;
                let first_seen_at = existing.first_seen_at;
                *existing = ScrapedListing {
                    id,
                    first_seen_at,
                    is_active: true,
                    ..listing.clone()
                };
                Ok(UpsertOutcome {
                    id,
                    inserted: false,
                })
            }
            None => {
                let row = ScrapedListing {
                    is_active: true,
                    ..listing.clone()
                };
                let id = row.id;
                tables.listings.insert(key, row);
                Ok(UpsertOutcome { id, inserted: true })
            }
        }
    }

    async fn get_listing(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<ScrapedListing>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .listings
            .get(&(platform, external_id.to_string()))
            .cloned())
    }

    async fn select_listings(
        &self,
        filter: &ListingFilter,
    ) -> Result<Vec<ScrapedListing>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ScrapedListing> = tables
            .listings
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn mark_stale(&self, platform: Platform, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let mut marked = 0;
        for listing in tables.listings.values_mut() {
            if listing.platform == platform && listing.is_active && listing.last_seen_at < cutoff {
                listing.is_active = false;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn upsert_match(&self, result: &MatchResult) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let listing_known = tables
            .listings
            .values()
            .any(|l| l.id == result.scraped_listing_id);
        if !listing_known {
            return Err(StoreError::NotFound {
                kind: "listing",
                id: result.scraped_listing_id.to_string(),
            });
        }
        tables.matches.insert(
            (
                result.scraped_listing_id,
                result.registered_property_id.clone(),
            ),
            result.clone(),
        );
        Ok(())
    }

    async fn matches_for(&self, listing_ids: &[Uuid]) -> Result<Vec<MatchResult>, StoreError> {
        let tables = self.tables.read().await;
        let mut out: Vec<MatchResult> = tables
            .matches
            .values()
            .filter(|m| listing_ids.contains(&m.scraped_listing_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.scraped_listing_id
                .cmp(&b.scraped_listing_id)
                .then(b.match_score.total_cmp(&a.match_score))
        });
        Ok(out)
    }

    async fn save_scrape_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .scrape_jobs
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn get_scrape_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, StoreError> {
        Ok(self.tables.read().await.scrape_jobs.get(&id).cloned())
    }

    async fn save_batch_job(&self, job: &BatchJob) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let pause_requested = tables
            .batch_jobs
            .get(&job.id)
            .map(|existing| existing.pause_requested)
            .unwrap_or(job.pause_requested);
        tables.batch_jobs.insert(
            job.id,
            BatchJob {
                pause_requested,
                ..job.clone()
            },
        );
        Ok(())
    }

    async fn load_batch_job(&self, id: Uuid) -> Result<Option<BatchJob>, StoreError> {
        Ok(self.tables.read().await.batch_jobs.get(&id).cloned())
    }

    async fn set_pause_requested(
        &self,
        id: Option<Uuid>,
        requested: bool,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let mut touched = 0;
        for job in tables.batch_jobs.values_mut() {
            let selected = match id {
                Some(id) => job.id == id,
                None => job.status == BatchStatus::Running,
            };
            if selected {
                job.pause_requested = requested;
                job.updated_at = Utc::now();
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn running_batch_jobs(&self) -> Result<Vec<BatchJob>, StoreError> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<BatchJob> = tables
            .batch_jobs
            .values()
            .filter(|j| j.status == BatchStatus::Running)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn upsert_market_metrics(&self, metrics: &MarketMetrics) -> Result<(), StoreError> {
        let key = (
            metrics.period_start,
            metrics.period_end,
            metrics.city.clone(),
        );
        self.tables
            .write()
            .await
            .metrics
            .insert(key, metrics.clone());
        Ok(())
    }

    async fn get_market_metrics(
        &self,
        city: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<MarketMetrics>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .metrics
            .get(&(period_start, period_end, city.to_string()))
            .cloned())
    }

    async fn upsert_owner(&self, owner: &DetectedOwner) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .owners
            .insert(owner.identifier.clone(), owner.clone());
        Ok(())
    }
}
