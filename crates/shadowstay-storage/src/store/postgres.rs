//! Postgres-backed [`ListingStore`] using runtime-checked sqlx queries.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use shadowstay_core::{
    BatchJob, BatchStatus, DetectedOwner, JobCounters, JobStatus, MarketMetrics, MatchResult,
    MatchType, Platform, ScrapeJob, ScrapedListing, SearchParams,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::{ListingFilter, ListingStore, StoreError, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn opt_i32(value: Option<u32>) -> Option<i32> {
    value.map(to_i32)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn opt_u32(value: Option<i32>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

fn parse_platform(raw: &str) -> Result<Platform, StoreError> {
    raw.parse()
        .map_err(|err: shadowstay_core::UnknownPlatform| StoreError::Corrupt(err.to_string()))
}

fn listing_from_row(row: &PgRow) -> Result<ScrapedListing, StoreError> {
    let platform: String = row.try_get("platform")?;
    let quality: i16 = row.try_get("quality_score")?;
    let Json(photos): Json<Vec<String>> = row.try_get("photos")?;
    let Json(amenities): Json<Vec<String>> = row.try_get("amenities")?;
    let Json(extras): Json<shadowstay_core::Extras> = row.try_get("extras")?;
    Ok(ScrapedListing {
        id: row.try_get("id")?,
        platform: parse_platform(&platform)?,
        external_id: row.try_get("external_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        location_text: row.try_get("location_text")?,
        city: row.try_get("city")?,
        neighborhood: row.try_get("neighborhood")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        host_name: row.try_get("host_name")?,
        host_id: row.try_get("host_id")?,
        property_type: row.try_get("property_type")?,
        bedrooms: opt_u32(row.try_get("bedrooms")?),
        bathrooms: opt_u32(row.try_get("bathrooms")?),
        max_guests: opt_u32(row.try_get("max_guests")?),
        photos,
        amenities,
        rating: row.try_get("rating")?,
        review_count: opt_u32(row.try_get("review_count")?),
        extras,
        quality_score: u8::try_from(quality).unwrap_or(0),
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        is_active: row.try_get("is_active")?,
    })
}

fn counters_from_row(row: &PgRow) -> Result<JobCounters, StoreError> {
    Ok(JobCounters {
        listings_found: to_u32(row.try_get("listings_found")?),
        listings_new: to_u32(row.try_get("listings_new")?),
        listings_updated: to_u32(row.try_get("listings_updated")?),
        detail_failures: to_u32(row.try_get("detail_failures")?),
        persist_failures: to_u32(row.try_get("persist_failures")?),
    })
}

fn batch_from_row(row: &PgRow) -> Result<BatchJob, StoreError> {
    let platform: String = row.try_get("platform")?;
    let status: String = row.try_get("status")?;
    let Json(params): Json<SearchParams> = row.try_get("params")?;
    Ok(BatchJob {
        id: row.try_get("id")?,
        platform: parse_platform(&platform)?,
        params,
        status: status.parse::<BatchStatus>().map_err(StoreError::Corrupt)?,
        current_page: to_u32(row.try_get("current_page")?).max(1),
        next_page_url: row.try_get("next_page_url")?,
        counters: counters_from_row(row)?,
        consecutive_errors: to_u32(row.try_get("consecutive_errors")?),
        last_error: row.try_get("last_error")?,
        pause_requested: row.try_get("pause_requested")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

const BATCH_COLUMNS: &str = "id, platform, params, status, current_page, next_page_url, \
     listings_found, listings_new, listings_updated, detail_failures, persist_failures, \
     consecutive_errors, last_error, pause_requested, created_at, updated_at, finished_at";

#[async_trait]
impl ListingStore for PgStore {
    async fn upsert_listing(&self, l: &ScrapedListing) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scraped_listings (
                id, platform, external_id, url, title, description, price, currency,
                location_text, city, neighborhood, latitude, longitude, host_name, host_id,
                property_type, bedrooms, bathrooms, max_guests, photos, amenities, rating,
                review_count, extras, quality_score, first_seen_at, last_seen_at, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, TRUE)
            ON CONFLICT (platform, external_id) DO UPDATE SET
                url = EXCLUDED.url,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                currency = EXCLUDED.currency,
                location_text = EXCLUDED.location_text,
                city = EXCLUDED.city,
                neighborhood = EXCLUDED.neighborhood,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                host_name = EXCLUDED.host_name,
                host_id = EXCLUDED.host_id,
                property_type = EXCLUDED.property_type,
                bedrooms = EXCLUDED.bedrooms,
                bathrooms = EXCLUDED.bathrooms,
                max_guests = EXCLUDED.max_guests,
                photos = EXCLUDED.photos,
                amenities = EXCLUDED.amenities,
                rating = EXCLUDED.rating,
                review_count = EXCLUDED.review_count,
                extras = EXCLUDED.extras,
                quality_score = EXCLUDED.quality_score,
                last_seen_at = EXCLUDED.last_seen_at,
                is_active = TRUE
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(l.id)
        .bind(l.platform.as_str())
        .bind(&l.external_id)
        .bind(&l.url)
        .bind(&l.title)
        .bind(&l.description)
        .bind(l.price)
        .bind(&l.currency)
        .bind(&l.location_text)
        .bind(&l.city)
        .bind(&l.neighborhood)
        .bind(l.latitude)
        .bind(l.longitude)
        .bind(&l.host_name)
        .bind(&l.host_id)
        .bind(&l.property_type)
        .bind(opt_i32(l.bedrooms))
        .bind(opt_i32(l.bathrooms))
        .bind(opt_i32(l.max_guests))
        .bind(Json(&l.photos))
        .bind(Json(&l.amenities))
        .bind(l.rating)
        .bind(opt_i32(l.review_count))
        .bind(Json(&l.extras))
        .bind(i16::from(l.quality_score))
        .bind(l.first_seen_at)
        .bind(l.last_seen_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertOutcome {
            id: row.try_get("id")?,
            inserted: row.try_get("inserted")?,
        })
    }

    async fn get_listing(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<ScrapedListing>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM scraped_listings WHERE platform = $1 AND external_id = $2",
        )
        .bind(platform.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn select_listings(
        &self,
        filter: &ListingFilter,
    ) -> Result<Vec<ScrapedListing>, StoreError> {
        let limit = filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM scraped_listings
             WHERE ($1::text IS NULL OR lower(city) = lower($1))
               AND ($2::text IS NULL OR platform = $2)
               AND (NOT $3 OR is_active)
             ORDER BY last_seen_at DESC
             LIMIT $4
            "#,
        )
        .bind(filter.city.as_deref().map(str::trim))
        .bind(filter.platform.map(|p| p.as_str()))
        .bind(filter.active_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn mark_stale(&self, platform: Platform, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scraped_listings
               SET is_active = FALSE
             WHERE platform = $1
               AND is_active
               AND last_seen_at < $2
            "#,
        )
        .bind(platform.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_match(&self, m: &MatchResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_matches (
                scraped_listing_id, registered_property_id, match_type, match_score,
                breakdown, matched_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (scraped_listing_id, COALESCE(registered_property_id, '')) DO UPDATE SET
                match_type = EXCLUDED.match_type,
                match_score = EXCLUDED.match_score,
                breakdown = EXCLUDED.breakdown,
                matched_at = EXCLUDED.matched_at
            "#,
        )
        .bind(m.scraped_listing_id)
        .bind(&m.registered_property_id)
        .bind(m.match_type.as_str())
        .bind(m.match_score)
        .bind(Json(&m.breakdown))
        .bind(m.matched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn matches_for(&self, listing_ids: &[Uuid]) -> Result<Vec<MatchResult>, StoreError> {
        if listing_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT scraped_listing_id, registered_property_id, match_type, match_score,
                   breakdown, matched_at
              FROM listing_matches
             WHERE scraped_listing_id = ANY($1)
             ORDER BY scraped_listing_id, match_score DESC
            "#,
        )
        .bind(listing_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let match_type: String = row.try_get("match_type")?;
            let Json(breakdown) = row.try_get("breakdown")?;
            out.push(MatchResult {
                scraped_listing_id: row.try_get("scraped_listing_id")?,
                registered_property_id: row.try_get("registered_property_id")?,
                match_type: match_type.parse::<MatchType>().map_err(StoreError::Corrupt)?,
                match_score: row.try_get("match_score")?,
                breakdown,
                matched_at: row.try_get("matched_at")?,
            });
        }
        Ok(out)
    }

    async fn save_scrape_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let c = job.counters;
        sqlx::query(
            r#"
            INSERT INTO scrape_jobs (
                id, platform, params, status, listings_found, listings_new, listings_updated,
                detail_failures, persist_failures, error_message, created_at, started_at,
                finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                listings_found = EXCLUDED.listings_found,
                listings_new = EXCLUDED.listings_new,
                listings_updated = EXCLUDED.listings_updated,
                detail_failures = EXCLUDED.detail_failures,
                persist_failures = EXCLUDED.persist_failures,
                error_message = EXCLUDED.error_message,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(job.id)
        .bind(job.platform.as_str())
        .bind(Json(&job.params))
        .bind(job.status.as_str())
        .bind(to_i32(c.listings_found))
        .bind(to_i32(c.listings_new))
        .bind(to_i32(c.listings_updated))
        .bind(to_i32(c.detail_failures))
        .bind(to_i32(c.persist_failures))
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_scrape_job(&self, id: Uuid) -> Result<Option<ScrapeJob>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM scrape_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let platform: String = row.try_get("platform")?;
        let status: String = row.try_get("status")?;
        let Json(params): Json<SearchParams> = row.try_get("params")?;
        Ok(Some(ScrapeJob {
            id: row.try_get("id")?,
            platform: parse_platform(&platform)?,
            params,
            status: status.parse::<JobStatus>().map_err(StoreError::Corrupt)?,
            counters: counters_from_row(&row)?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        }))
    }

    async fn save_batch_job(&self, job: &BatchJob) -> Result<(), StoreError> {
        let c = job.counters;
        sqlx::query(
            r#"
            INSERT INTO batch_jobs (
                id, platform, params, status, current_page, next_page_url, listings_found,
                listings_new, listings_updated, detail_failures, persist_failures,
                consecutive_errors, last_error, pause_requested, created_at, updated_at,
                finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                current_page = EXCLUDED.current_page,
                next_page_url = EXCLUDED.next_page_url,
                listings_found = EXCLUDED.listings_found,
                listings_new = EXCLUDED.listings_new,
                listings_updated = EXCLUDED.listings_updated,
                detail_failures = EXCLUDED.detail_failures,
                persist_failures = EXCLUDED.persist_failures,
                consecutive_errors = EXCLUDED.consecutive_errors,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at,
                finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(job.id)
        .bind(job.platform.as_str())
        .bind(Json(&job.params))
        .bind(job.status.as_str())
        .bind(to_i32(job.current_page))
        .bind(&job.next_page_url)
        .bind(to_i32(c.listings_found))
        .bind(to_i32(c.listings_new))
        .bind(to_i32(c.listings_updated))
        .bind(to_i32(c.detail_failures))
        .bind(to_i32(c.persist_failures))
        .bind(to_i32(job.consecutive_errors))
        .bind(&job.last_error)
        .bind(job.pause_requested)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_batch_job(&self, id: Uuid) -> Result<Option<BatchJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batch_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn set_pause_requested(
        &self,
        id: Option<Uuid>,
        requested: bool,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_jobs
               SET pause_requested = $2,
                   updated_at = NOW()
             WHERE ($1::uuid IS NOT NULL AND id = $1)
                OR ($1::uuid IS NULL AND status = 'running')
            "#,
        )
        .bind(id)
        .bind(requested)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn running_batch_jobs(&self) -> Result<Vec<BatchJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM batch_jobs WHERE status = 'running' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn upsert_market_metrics(&self, m: &MarketMetrics) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO market_intelligence (
                period_start, period_end, city, total_listings, registered_listings,
                unregistered_listings, compliance_rate, nightly_price, property_types,
                platforms, computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (period_start, period_end, city) DO UPDATE SET
                total_listings = EXCLUDED.total_listings,
                registered_listings = EXCLUDED.registered_listings,
                unregistered_listings = EXCLUDED.unregistered_listings,
                compliance_rate = EXCLUDED.compliance_rate,
                nightly_price = EXCLUDED.nightly_price,
                property_types = EXCLUDED.property_types,
                platforms = EXCLUDED.platforms,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(m.period_start)
        .bind(m.period_end)
        .bind(&m.city)
        .bind(i64::try_from(m.total_listings).unwrap_or(i64::MAX))
        .bind(i64::try_from(m.registered_listings).unwrap_or(i64::MAX))
        .bind(i64::try_from(m.unregistered_listings).unwrap_or(i64::MAX))
        .bind(m.compliance_rate)
        .bind(Json(&m.nightly_price))
        .bind(Json(&m.property_types))
        .bind(Json(&m.platforms))
        .bind(m.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_market_metrics(
        &self,
        city: &str,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Option<MarketMetrics>, StoreError> {
        let Some(row) = sqlx::query(
            r#"
            SELECT * FROM market_intelligence
             WHERE period_start = $1 AND period_end = $2 AND city = $3
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .bind(city)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let total: i64 = row.try_get("total_listings")?;
        let registered: i64 = row.try_get("registered_listings")?;
        let unregistered: i64 = row.try_get("unregistered_listings")?;
        let Json(nightly_price) = row.try_get("nightly_price")?;
        let Json(property_types) = row.try_get("property_types")?;
        let Json(platforms) = row.try_get("platforms")?;
        Ok(Some(MarketMetrics {
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            city: row.try_get("city")?,
            total_listings: u64::try_from(total).unwrap_or(0),
            registered_listings: u64::try_from(registered).unwrap_or(0),
            unregistered_listings: u64::try_from(unregistered).unwrap_or(0),
            compliance_rate: row.try_get("compliance_rate")?,
            nightly_price,
            property_types,
            platforms,
            computed_at: row.try_get("computed_at")?,
        }))
    }

    async fn upsert_owner(&self, o: &DetectedOwner) -> Result<(), StoreError> {
        let platforms: Vec<JsonValue> = o
            .platforms
            .iter()
            .map(|p| JsonValue::String(p.as_str().to_string()))
            .collect();
        sqlx::query(
            r#"
            INSERT INTO detected_owners (
                identifier, key_kind, names, platforms, listing_ids, listing_count,
                unregistered_count, avg_nightly_price, estimated_monthly_revenue,
                first_seen_at, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ON CONFLICT (identifier) DO UPDATE SET
                names = EXCLUDED.names,
                platforms = EXCLUDED.platforms,
                listing_ids = EXCLUDED.listing_ids,
                listing_count = EXCLUDED.listing_count,
                unregistered_count = EXCLUDED.unregistered_count,
                avg_nightly_price = EXCLUDED.avg_nightly_price,
                estimated_monthly_revenue = EXCLUDED.estimated_monthly_revenue,
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(&o.identifier)
        .bind(o.key_kind.as_str())
        .bind(Json(&o.names))
        .bind(Json(platforms))
        .bind(Json(&o.listing_ids))
        .bind(to_i32(o.listing_count))
        .bind(to_i32(o.unregistered_count))
        .bind(o.avg_nightly_price)
        .bind(o.estimated_monthly_revenue)
        .bind(o.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
