//! Shared crawl loop.
//!
//! Every platform runs through the same steps: load a results page, parse its
//! cards, locate the next page, then enrich the cards from their detail pages
//! through a bounded worker pool. Platform differences stay behind
//! [`PlatformAdapter`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use shadowstay_core::{ListingDraft, Platform, RawListingDraft, SearchParams};
use shadowstay_storage::{ArtifactStore, RateLimiter};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::driver::{DriverError, PageRenderer, PageSession};
use crate::platforms::{card_listing, page_has_match, NextPage, PlatformAdapter};
use crate::AdapterError;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("navigation to {url} failed after {attempts} attempts: {last_error}")]
    Navigation {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("selector configuration error: {0}")]
    Selector(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl From<AdapterError> for CrawlError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Driver(err) => CrawlError::Driver(err),
            other => CrawlError::Selector(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Detail pages fetched concurrently.
    pub concurrency: usize,
    /// Navigation attempts in one browsing context before a fresh one is tried.
    pub nav_attempts: u32,
    /// Base delay between navigation attempts; each wait is jittered.
    pub retry_delay: Duration,
    pub results_timeout: Duration,
    pub fetch_details: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            nav_attempts: 3,
            retry_delay: Duration::from_secs(2),
            results_timeout: Duration::from_secs(15),
            fetch_details: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoNextPage,
    PageCap,
    EmptyPage,
}

/// One processed results page.
#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub page: u32,
    pub listings: Vec<ListingDraft>,
    pub cards_seen: usize,
    pub detail_failures: u32,
    /// Where the following page lives, for resuming a walk later.
    pub next_url: Option<String>,
    pub stop: Option<StopReason>,
}

#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub listings: Vec<ListingDraft>,
    pub pages_visited: u32,
    pub cards_seen: usize,
    pub detail_failures: u32,
    pub stop: Option<StopReason>,
}

#[derive(Clone)]
pub struct Crawler {
    renderer: Arc<dyn PageRenderer>,
    limiter: Arc<RateLimiter>,
    config: CrawlerConfig,
    snapshots: Option<ArtifactStore>,
}

fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}

impl Crawler {
    pub fn new(renderer: Arc<dyn PageRenderer>, limiter: Arc<RateLimiter>, config: CrawlerConfig) -> Self {
        Self {
            renderer,
            limiter,
            config,
            snapshots: None,
        }
    }

    /// Store every results page under `store`.
    pub fn with_snapshots(mut self, store: ArtifactStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Walk from the first results page.
    pub fn walk(&self, adapter: Arc<dyn PlatformAdapter>, params: SearchParams) -> SearchWalk {
        self.resume_walk(adapter, params, 1, None)
    }

    /// Walk from `page`, loading `cursor` when the page URL is already known.
    pub fn resume_walk(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        params: SearchParams,
        page: u32,
        cursor: Option<String>,
    ) -> SearchWalk {
        SearchWalk {
            crawler: self.clone(),
            adapter,
            params,
            session: None,
            page: page.max(1),
            cursor,
            loaded: false,
            seen: HashSet::new(),
            finished: None,
        }
    }

    /// Every page up to a stop condition. Nothing is persisted.
    pub async fn crawl(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        params: SearchParams,
    ) -> Result<CrawlReport, CrawlError> {
        let platform = adapter.platform();
        let city = params.city.clone();
        let mut walk = self.walk(adapter, params);
        let mut report = CrawlReport::default();
        while let Some(outcome) = walk.next_page().await? {
            report.pages_visited += 1;
            report.cards_seen += outcome.cards_seen;
            report.detail_failures += outcome.detail_failures;
            report.listings.extend(outcome.listings);
            report.stop = outcome.stop;
        }
        info!(
            %platform,
            city = %city,
            pages = report.pages_visited,
            listings = report.listings.len(),
            detail_failures = report.detail_failures,
            stop = ?report.stop,
            "crawl finished"
        );
        Ok(report)
    }

    async fn open_session(&self, adapter: &dyn PlatformAdapter) -> Result<Box<dyn PageSession>, CrawlError> {
        let mut session = self.renderer.open().await?;
        session.block_resources(&adapter.profile().blocked_resources);
        Ok(session)
    }

    /// Load `url`, retrying in the same context and then once in a fresh one.
    async fn navigate_with_retry(
        &self,
        adapter: &dyn PlatformAdapter,
        session: &mut Option<Box<dyn PageSession>>,
        url: &str,
    ) -> Result<(), CrawlError> {
        let attempts = self.config.nav_attempts.max(1);
        let mut last_error = String::new();

        let mut current = match session.take() {
            Some(existing) => existing,
            None => self.open_session(adapter).await?,
        };
        for attempt in 1..=attempts {
            self.limiter.acquire().await;
            match current.navigate(url).await {
                Ok(()) => {
                    *session = Some(current);
                    return Ok(());
                }
                Err(err) => {
                    warn!(platform = %adapter.platform(), url, attempt, error = %err, "navigation failed");
                    last_error = err.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(jittered(self.config.retry_delay)).await;
            }
        }

        debug!(platform = %adapter.platform(), url, "retrying in a fresh browsing context");
        let mut fresh = self.open_session(adapter).await?;
        self.limiter.acquire().await;
        match fresh.navigate(url).await {
            Ok(()) => {
                *session = Some(fresh);
                Ok(())
            }
            Err(err) => Err(CrawlError::Navigation {
                url: url.to_string(),
                attempts: attempts + 1,
                last_error: if last_error.is_empty() { err.to_string() } else { format!("{last_error}; {err}") },
            }),
        }
    }

    async fn snapshot(&self, platform: Platform, html: &str) {
        let Some(store) = &self.snapshots else {
            return;
        };
        match store.store_page(Utc::now(), platform, "html", html.as_bytes()).await {
            Ok(stored) => debug!(
                %platform,
                path = %stored.relative_path.display(),
                deduplicated = stored.deduplicated,
                "results page stored"
            ),
            Err(err) => warn!(%platform, error = %err, "results page snapshot failed"),
        }
    }

    /// Detail records in card order. A card whose detail page fails keeps its
    /// card-level data.
    async fn enrich(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        cards: Vec<RawListingDraft>,
    ) -> (Vec<ListingDraft>, u32) {
        let scraped_at = Utc::now();
        let mut slots: Vec<ListingDraft> = cards.iter().map(|c| card_listing(c, scraped_at)).collect();
        if !self.config.fetch_details {
            return (slots, 0);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, card) in cards.into_iter().enumerate() {
            let Some(url) = adapter.detail_url(&card) else {
                continue;
            };
            let crawler = self.clone();
            let adapter = Arc::clone(adapter);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = crawler.fetch_detail(adapter.as_ref(), &card, &url).await;
                (index, card.external_id, result)
            });
        }

        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(listing))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = listing;
                    }
                }
                Ok((_, external_id, Err(reason))) => {
                    failures += 1;
                    warn!(platform = %adapter.platform(), external_id, reason, "detail page skipped");
                }
                Err(err) => {
                    failures += 1;
                    warn!(platform = %adapter.platform(), error = %err, "detail worker aborted");
                }
            }
        }
        (slots, failures)
    }

    async fn fetch_detail(
        &self,
        adapter: &dyn PlatformAdapter,
        card: &RawListingDraft,
        url: &str,
    ) -> Result<ListingDraft, String> {
        let mut session = self.open_session(adapter).await.map_err(|e| e.to_string())?;
        self.limiter.acquire().await;
        session.navigate(url).await.map_err(|e| e.to_string())?;
        let html = session.html().map_err(|e| e.to_string())?;
        adapter
            .parse_detail(card, &html, Utc::now())
            .map_err(|e| e.to_string())
    }
}

/// Sequential walk over results pages. Page N+1 is only known after page N
/// has been parsed, so pages are produced one at a time.
pub struct SearchWalk {
    crawler: Crawler,
    adapter: Arc<dyn PlatformAdapter>,
    params: SearchParams,
    session: Option<Box<dyn PageSession>>,
    page: u32,
    cursor: Option<String>,
    /// The session already shows `cursor` (pagination moved it there).
    loaded: bool,
    seen: HashSet<String>,
    finished: Option<StopReason>,
}

impl SearchWalk {
    /// Number of the next page to process.
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn finished(&self) -> Option<StopReason> {
        self.finished
    }

    pub async fn next_page(&mut self) -> Result<Option<PageOutcome>, CrawlError> {
        if self.finished.is_some() {
            return Ok(None);
        }
        if self.params.max_pages > 0 && self.page > self.params.max_pages {
            self.finished = Some(StopReason::PageCap);
            return Ok(None);
        }
        let span = info_span!(
            "crawl_page",
            platform = %self.adapter.platform(),
            city = %self.params.city,
            page = self.page
        );
        self.step().instrument(span).await.map(Some)
    }

    async fn step(&mut self) -> Result<PageOutcome, CrawlError> {
        let page = self.page;
        let adapter = Arc::clone(&self.adapter);
        let url = self
            .cursor
            .clone()
            .unwrap_or_else(|| adapter.build_search_url(&self.params, page));

        if !(self.loaded && self.session.is_some()) {
            self.crawler
                .navigate_with_retry(adapter.as_ref(), &mut self.session, &url)
                .await?;
        }
        self.loaded = false;
        let Some(session) = self.session.as_mut() else {
            return Err(CrawlError::Driver(DriverError::NothingLoaded));
        };

        if let Err(err) = adapter.dismiss_popups(session.as_mut()).await {
            debug!(error = %err, "popup dismissal failed");
        }
        if !adapter
            .wait_for_results(session.as_mut(), self.crawler.config.results_timeout)
            .await?
        {
            debug!(url = %url, "results marker never appeared");
        }
        let html = session.html()?;
        let page_url = session.current_url().unwrap_or_else(|| url.clone());
        self.crawler.snapshot(adapter.platform(), &html).await;

        let cards = adapter.parse_results(&html, &page_url)?;
        let cards_seen = cards.len();
        if cards_seen == 0 {
            info!("results page is empty");
            self.finished = Some(StopReason::EmptyPage);
            self.cursor = None;
            return Ok(PageOutcome {
                page,
                listings: Vec::new(),
                cards_seen,
                detail_failures: 0,
                next_url: None,
                stop: self.finished,
            });
        }
        let fresh: Vec<RawListingDraft> = cards
            .into_iter()
            .filter(|card| self.seen.insert(card.external_id.clone()))
            .collect();

        // The next page is located before enrichment; detail workers use
        // their own contexts.
        let stop = if self.params.max_pages > 0 && page >= self.params.max_pages {
            self.cursor = None;
            Some(StopReason::PageCap)
        } else {
            if adapter.paginates_by_click() && page_has_match(&html, &adapter.profile().next_page)? {
                self.crawler.limiter.acquire().await;
            }
            match adapter.go_to_next_page(session.as_mut(), &self.params, page).await {
                Ok(Some(NextPage::Navigate(next))) => {
                    self.cursor = Some(next);
                    None
                }
                Ok(Some(NextPage::Clicked)) => {
                    self.cursor = session.current_url();
                    self.loaded = self.cursor.is_some();
                    None
                }
                Ok(None) => {
                    self.cursor = None;
                    Some(StopReason::NoNextPage)
                }
                Err(err) => {
                    warn!(error = %err, "pagination failed, falling back to the page url");
                    self.cursor = Some(adapter.build_search_url(&self.params, page + 1));
                    None
                }
            }
        };

        let (listings, detail_failures) = self.crawler.enrich(&adapter, fresh).await;
        info!(
            cards = cards_seen,
            listings = listings.len(),
            detail_failures,
            "results page processed"
        );

        self.page += 1;
        self.finished = stop;
        Ok(PageOutcome {
            page,
            listings,
            cards_seen,
            detail_failures,
            next_url: self.cursor.clone(),
            stop,
        })
    }
}
