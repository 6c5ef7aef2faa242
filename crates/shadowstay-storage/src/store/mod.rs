//! Persistent store for listings, matches, jobs and derived aggregates.
//!
//! Every write is an upsert on a natural key, so concurrent crawls over
//! different platform/city pairs can share one store. Concurrent writes to the
//! same key are last-write-wins.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use shadowstay_core::{
    BatchJob, DetectedOwner, MarketMetrics, MatchResult, Platform, ScrapeJob, ScrapedListing,
};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Id of the stored row; the pre-existing id when the key already existed.
    pub id: Uuid,
    pub inserted: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilter {
    /// Case-insensitive city match.
    pub city: Option<String>,
    pub platform: Option<Platform>,
    pub active_only: bool,
    pub limit: Option<usize>,
}

impl ListingFilter {
    pub fn active_in(city: impl Into<String>) -> Self {
        Self {
            city: Some(city.into()),
            active_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, listing: &ScrapedListing) -> bool {
        if self.active_only && !listing.is_active {
            return false;
        }
        if let Some(platform) = self.platform {
            if listing.platform != platform {
                return false;
            }
        }
        match (&self.city, &listing.city) {
            (None, _) => true,
            (Some(wanted), Some(city)) => wanted.trim().eq_ignore_ascii_case(city.trim()),
            (Some(_), None) => false,
        }
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Insert or update by `(platform, external_id)`. On update the stored id and
    /// `first_seen_at` are kept; every other field is replaced and the row is
    /// reactivated.
    async fn upsert_listing(&self, listing: &ScrapedListing) -> Result<UpsertOutcome, StoreError>;

    async fn get_listing(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<ScrapedListing>, StoreError>;

    /// Ordered by `last_seen_at` descending.
    async fn select_listings(&self, filter: &ListingFilter)
        -> Result<Vec<ScrapedListing>, StoreError>;

    /// Soft-delete active listings of `platform` not seen since `cutoff`.
    async fn mark_stale(&self, platform: Platform, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Upsert by `(scraped_listing_id, registered_property_id)`.
    async fn upsert_match(&self, result: &MatchResult) -> Result<(), StoreError>;

    /// All stored matches for the given listings, best score first per listing.
    async fn matches_for(&self, listing_ids: &[Uuid]) -> Result<Vec<MatchResult>, StoreError>;

    async fn save_scrape_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;

    async fn get_scrape_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, StoreError>;

    /// Persist the batch cursor and counters. The stored `pause_requested`
    /// flag is owned by [`ListingStore::set_pause_requested`] and survives.
    async fn save_batch_job(&self, job: &BatchJob) -> Result<(), StoreError>;

    async fn load_batch_job(&self, id: Uuid) -> Result<Option<BatchJob>, StoreError>;

    /// Set the pause flag on one batch job, or on every running one when `id`
    /// is `None`. Returns the number of rows touched.
    async fn set_pause_requested(&self, id: Option<Uuid>, requested: bool)
        -> Result<u64, StoreError>;

    async fn running_batch_jobs(&self) -> Result<Vec<BatchJob>, StoreError>;

    async fn upsert_market_metrics(&self, metrics: &MarketMetrics) -> Result<(), StoreError>;

    async fn get_market_metrics(
        &self,
        city: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<MarketMetrics>, StoreError>;

    async fn upsert_owner(&self, owner: &DetectedOwner) -> Result<(), StoreError>;
}

/// Best stored match per listing id.
pub fn best_matches(matches: Vec<MatchResult>) -> std::collections::HashMap<Uuid, MatchResult> {
    let mut best: std::collections::HashMap<Uuid, MatchResult> = std::collections::HashMap::new();
    for result in matches {
        match best.get(&result.scraped_listing_id) {
            Some(current) if current.match_score >= result.match_score => {}
            _ => {
                best.insert(result.scraped_listing_id, result);
            }
        }
    }
    best
}
