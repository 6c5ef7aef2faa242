//! Normalization, registry matching, job orchestration, scheduling and exports.

use std::sync::Arc;

use anyhow::{Context, Result};
use shadowstay_adapters::{Crawler, HttpRenderer};
use shadowstay_storage::{ArtifactStore, HttpFetcher, ListingStore, MemoryStore, PgStore, RateLimiter};
use tracing::info;

pub mod config;
pub mod export;
pub mod jobs;
pub mod matching;
pub mod metrics;
pub mod normalize;
pub mod owners;
pub mod registry;
pub mod schedule;

pub use config::AppConfig;
pub use export::{ExportManifest, ManifestFile};
pub use jobs::{BatchPolicy, JobManager, PauseHandle, ScrapeRun};
pub use matching::{haversine_m, score_candidate, IdentityMatcher};
pub use normalize::normalize;
pub use registry::{FileRegistry, HttpRegistry, RegistrySource, StaticRegistry};
pub use schedule::{maybe_build_scheduler, Target};

pub const CRATE_NAME: &str = "shadowstay-sync";

/// Postgres when `DATABASE_URL` is set, otherwise an in-process store.
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn ListingStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to database")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Registry API when `REGISTRY_URL` is set, otherwise the JSON file.
pub fn open_registry(config: &AppConfig) -> Result<Arc<dyn RegistrySource>> {
    match &config.registry_url {
        Some(url) => {
            let http = HttpFetcher::new(config.http_client_config()).context("building registry client")?;
            Ok(Arc::new(HttpRegistry::new(url.clone(), http)))
        }
        None => Ok(Arc::new(FileRegistry::new(config.registry_file.clone()))),
    }
}

pub fn build_crawler(config: &AppConfig) -> Crawler {
    let renderer = Arc::new(HttpRenderer::new(config.http_client_config()));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
    let crawler = Crawler::new(renderer, limiter, config.crawler_config());
    match &config.artifacts_dir {
        Some(dir) => crawler.with_snapshots(ArtifactStore::new(dir.clone())),
        None => crawler,
    }
}

pub async fn manager_from_config(config: &AppConfig) -> Result<JobManager> {
    let store = open_store(config).await?;
    let registry = open_registry(config)?;
    let catalog = config.selector_catalog()?;
    Ok(JobManager::new(store, registry, build_crawler(config), catalog)
        .with_policy(config.batch_policy())
        .with_stale_after_days(config.stale_after_days)
        .with_reports_dir(config.reports_dir.clone()))
}
