//! Core domain model for shadowstay: listings, registry entries, matches and job records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "shadowstay-core";

/// Free-form platform-specific fields carried alongside the canonical schema.
pub type Extras = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Airbnb,
    Booking,
    ExpatDakar,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Airbnb, Platform::Booking, Platform::ExpatDakar];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Airbnb => "airbnb",
            Platform::Booking => "booking",
            Platform::ExpatDakar => "expat_dakar",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown platform `{0}` (expected airbnb, booking or expat_dakar)")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "airbnb" => Ok(Platform::Airbnb),
            "booking" | "booking.com" | "booking_com" => Ok(Platform::Booking),
            "expat_dakar" | "expatdakar" => Ok(Platform::ExpatDakar),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

/// Billing frequency of an advertised price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePeriod {
    #[default]
    Night,
    Month,
}

impl PricePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricePeriod::Night => "night",
            PricePeriod::Month => "month",
        }
    }
}

/// Scope of one crawl: where to look and how far to paginate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub city: String,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    pub max_pages: u32,
}

impl SearchParams {
    pub fn new(city: impl Into<String>, max_pages: u32) -> Self {
        Self {
            city: city.into(),
            min_price: None,
            max_price: None,
            max_pages: max_pages.max(1),
        }
    }
}

/// Listing card as parsed from a search-results page, before detail enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListingDraft {
    pub platform: Platform,
    pub external_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub location_text: Option<String>,
    pub photo_url: Option<String>,
    pub rating: Option<f64>,
}

/// Full listing record in canonical shape, either fresh from a detail page or normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub platform: Platform,
    pub external_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    #[serde(default)]
    pub price_period: PricePeriod,
    pub location_text: Option<String>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub host_name: Option<String>,
    pub host_id: Option<String>,
    pub phone: Option<String>,
    pub property_type: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub max_guests: Option<u32>,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    #[serde(default)]
    pub extras: Extras,
    pub scraped_at: DateTime<Utc>,
}

impl ListingDraft {
    /// Empty record keyed by platform and external id.
    pub fn new(platform: Platform, external_id: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            platform,
            external_id: external_id.into(),
            url: None,
            title: None,
            description: None,
            price: None,
            currency: None,
            price_period: PricePeriod::Night,
            location_text: None,
            city: None,
            neighborhood: None,
            latitude: None,
            longitude: None,
            host_name: None,
            host_id: None,
            phone: None,
            property_type: None,
            bedrooms: None,
            bathrooms: None,
            max_guests: None,
            photos: Vec::new(),
            amenities: Vec::new(),
            rating: None,
            review_count: None,
            extras: Extras::new(),
            scraped_at,
        }
    }
}

/// Output of the normalization pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub listing: ListingDraft,
    /// Completeness score in 0..=100.
    pub quality_score: u8,
}

/// Canonical persisted listing, unique on `(platform, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub id: Uuid,
    pub platform: Platform,
    pub external_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub location_text: Option<String>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub host_name: Option<String>,
    pub host_id: Option<String>,
    pub property_type: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub max_guests: Option<u32>,
    pub photos: Vec<String>,
    pub amenities: Vec<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub extras: Extras,
    pub quality_score: u8,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
}

impl ScrapedListing {
    /// Build a fresh row from a normalized listing. The store keeps the existing
    /// id and `first_seen_at` when the natural key already exists.
    pub fn from_normalized(normalized: &NormalizedListing, seen_at: DateTime<Utc>) -> Self {
        let l = &normalized.listing;
        let mut extras = l.extras.clone();
        if let Some(phone) = &l.phone {
            extras.insert("phone".to_string(), JsonValue::String(phone.clone()));
        }
        Self {
            id: Uuid::new_v4(),
            platform: l.platform,
            external_id: l.external_id.clone(),
            url: l.url.clone(),
            title: l.title.clone(),
            description: l.description.clone(),
            price: l.price,
            currency: l.currency.clone(),
            location_text: l.location_text.clone(),
            city: l.city.clone(),
            neighborhood: l.neighborhood.clone(),
            latitude: l.latitude,
            longitude: l.longitude,
            host_name: l.host_name.clone(),
            host_id: l.host_id.clone(),
            property_type: l.property_type.clone(),
            bedrooms: l.bedrooms,
            bathrooms: l.bathrooms,
            max_guests: l.max_guests,
            photos: l.photos.clone(),
            amenities: l.amenities.clone(),
            rating: l.rating,
            review_count: l.review_count,
            extras,
            quality_score: normalized.quality_score,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            is_active: true,
        }
    }

    pub fn phone(&self) -> Option<&str> {
        self.extras.get("phone").and_then(JsonValue::as_str)
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

/// Licensed property as exposed by the external registry. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredProperty {
    pub id: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: String,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub room_count: Option<u32>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub owner_company: Option<String>,
}

impl RegisteredProperty {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Probable,
    Possible,
    NoMatch,
}

impl MatchType {
    pub const EXACT_THRESHOLD: f64 = 0.8;
    pub const PROBABLE_THRESHOLD: f64 = 0.6;
    pub const POSSIBLE_THRESHOLD: f64 = 0.4;

    pub fn from_score(score: f64) -> Self {
        if score >= Self::EXACT_THRESHOLD {
            MatchType::Exact
        } else if score >= Self::PROBABLE_THRESHOLD {
            MatchType::Probable
        } else if score >= Self::POSSIBLE_THRESHOLD {
            MatchType::Possible
        } else {
            MatchType::NoMatch
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Probable => "probable",
            MatchType::Possible => "possible",
            MatchType::NoMatch => "no_match",
        }
    }

    /// Whether a match of this type counts the listing as registered.
    pub fn is_registered(&self) -> bool {
        matches!(self, MatchType::Exact | MatchType::Probable)
    }
}

impl FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchType::Exact),
            "probable" => Ok(MatchType::Probable),
            "possible" => Ok(MatchType::Possible),
            "no_match" => Ok(MatchType::NoMatch),
            other => Err(format!("unknown match type `{other}`")),
        }
    }
}

/// Per-factor sub-scores; `None` means the factor was not applicable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub geo: Option<f64>,
    pub distance_m: Option<f64>,
    pub address: Option<f64>,
    pub neighborhood_bonus: bool,
    pub host: Option<f64>,
    pub property_type: Option<f64>,
    pub bedrooms: Option<f64>,
    pub title: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub scraped_listing_id: Uuid,
    pub registered_property_id: Option<String>,
    pub match_type: MatchType,
    pub match_score: f64,
    pub breakdown: ScoreBreakdown,
    pub matched_at: DateTime<Utc>,
}

impl MatchResult {
    /// A listing without any acceptable registry candidate.
    pub fn is_unregistered_signal(&self) -> bool {
        self.match_type == MatchType::NoMatch && self.registered_property_id.is_none()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

/// Counters accumulated while a crawl is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub listings_found: u32,
    pub listings_new: u32,
    pub listings_updated: u32,
    pub detail_failures: u32,
    pub persist_failures: u32,
}

impl JobCounters {
    pub fn absorb(&mut self, other: JobCounters) {
        self.listings_found += other.listings_found;
        self.listings_new += other.listings_new;
        self.listings_updated += other.listings_updated;
        self.detail_failures += other.detail_failures;
        self.persist_failures += other.persist_failures;
    }
}

/// One crawl execution. `pending -> running -> {completed | failed}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub platform: Platform,
    pub params: SearchParams,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScrapeJob {
    pub fn new(platform: Platform, params: SearchParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform,
            params,
            status: JobStatus::Pending,
            counters: JobCounters::default(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, counters: JobCounters) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.counters = counters;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        );
        if !allowed {
            return Err(TransitionError {
                from: self.status.as_str(),
                to: to.as_str(),
            });
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "running" => Ok(BatchStatus::Running),
            "paused" => Ok(BatchStatus::Paused),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status `{other}`")),
        }
    }
}

/// Long-running, resumable crawl persisted after every page.
///
/// `current_page` is the 1-based index of the next page to process; pages
/// before it are done. `next_page_url` is the cursor needed to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub platform: Platform,
    pub params: SearchParams,
    pub status: BatchStatus,
    pub current_page: u32,
    pub next_page_url: Option<String>,
    pub counters: JobCounters,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub pause_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(platform: Platform, params: SearchParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            platform,
            params,
            status: BatchStatus::Pending,
            current_page: 1,
            next_page_url: None,
            counters: JobCounters::default(),
            consecutive_errors: 0,
            last_error: None,
            pause_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn pages_completed(&self) -> u32 {
        self.current_page.saturating_sub(1)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            BatchStatus::Pending | BatchStatus::Paused | BatchStatus::Running
        )
    }

    /// Record a successfully processed page and move the cursor past it.
    pub fn record_page(&mut self, counters: JobCounters, next_page_url: Option<String>) {
        self.counters.absorb(counters);
        self.current_page += 1;
        self.next_page_url = next_page_url;
        self.consecutive_errors = 0;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed page attempt; returns the new consecutive error count.
    pub fn record_error(&mut self, message: impl Into<String>) -> u32 {
        self.consecutive_errors += 1;
        self.last_error = Some(message.into());
        self.updated_at = Utc::now();
        self.consecutive_errors
    }

    pub fn set_status(&mut self, status: BatchStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if matches!(status, BatchStatus::Completed | BatchStatus::Failed) {
            self.finished_at = Some(self.updated_at);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceDistribution {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub p25: Option<f64>,
    pub p75: Option<f64>,
}

/// Aggregate upserted per `(period_start, period_end, city)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketMetrics {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub city: String,
    pub total_listings: u64,
    pub registered_listings: u64,
    pub unregistered_listings: u64,
    pub compliance_rate: f64,
    pub nightly_price: PriceDistribution,
    pub property_types: BTreeMap<String, u64>,
    pub platforms: BTreeMap<String, u64>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKeyKind {
    Phone,
    HostId,
}

impl OwnerKeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKeyKind::Phone => "phone",
            OwnerKeyKind::HostId => "host_id",
        }
    }
}

/// Operator inferred from listings sharing a phone number or platform host id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedOwner {
    pub identifier: String,
    pub key_kind: OwnerKeyKind,
    pub names: Vec<String>,
    pub platforms: Vec<Platform>,
    pub listing_ids: Vec<Uuid>,
    pub listing_count: u32,
    pub unregistered_count: u32,
    pub avg_nightly_price: Option<f64>,
    pub estimated_monthly_revenue: Option<f64>,
    pub last_seen_at: DateTime<Utc>,
}

impl DetectedOwner {
    pub fn is_multi_property(&self) -> bool {
        self.listing_count > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parses_aliases() {
        assert_eq!("Airbnb".parse::<Platform>(), Ok(Platform::Airbnb));
        assert_eq!("booking.com".parse::<Platform>(), Ok(Platform::Booking));
        assert_eq!("expat-dakar".parse::<Platform>(), Ok(Platform::ExpatDakar));
        assert!("vrbo".parse::<Platform>().is_err());
    }

    #[test]
    fn classification_boundaries() {
        assert_eq!(MatchType::from_score(0.80), MatchType::Exact);
        assert_eq!(MatchType::from_score(0.7999), MatchType::Probable);
        assert_eq!(MatchType::from_score(0.60), MatchType::Probable);
        assert_eq!(MatchType::from_score(0.5999), MatchType::Possible);
        assert_eq!(MatchType::from_score(0.40), MatchType::Possible);
        assert_eq!(MatchType::from_score(0.3999), MatchType::NoMatch);
    }

    #[test]
    fn scrape_job_follows_state_machine() {
        let mut job = ScrapeJob::new(Platform::Airbnb, SearchParams::new("Dakar", 2));
        assert!(job.complete(JobCounters::default()).is_err());
        job.start().unwrap();
        job.fail("navigation failed").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("navigation failed"));
        assert!(job.start().is_err());
    }

    #[test]
    fn batch_cursor_advances_and_resets_errors() {
        let mut batch = BatchJob::new(Platform::Booking, SearchParams::new("Saly", 10));
        assert_eq!(batch.record_error("timeout"), 1);
        batch.record_page(
            JobCounters {
                listings_found: 25,
                listings_new: 20,
                listings_updated: 5,
                ..Default::default()
            },
            Some("https://example.test/p2".into()),
        );
        assert_eq!(batch.current_page, 2);
        assert_eq!(batch.pages_completed(), 1);
        assert_eq!(batch.consecutive_errors, 0);
        assert_eq!(batch.counters.listings_found, 25);
    }
}
