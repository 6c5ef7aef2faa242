//! Page-rendering capability used by the crawler.
//!
//! A [`PageRenderer`] hands out independent browsing contexts
//! ([`PageSession`]s). Two renderers ship: [`HttpRenderer`] fetches and parses
//! static HTML, [`FixtureRenderer`] replays canned pages for tests and offline
//! runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use shadowstay_storage::{FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to open browsing context: {0}")]
    Open(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("no page has been loaded in this session")]
    NothingLoaded,
    #[error("invalid selector `{0}`")]
    Selector(String),
}

/// One browsing context: cookies and the currently loaded document.
#[async_trait]
pub trait PageSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError>;

    /// Wait until `selector` matches in the current document or `timeout`
    /// elapses. Returns whether the selector matched.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration)
        -> Result<bool, DriverError>;

    /// Serialized DOM of the current document.
    fn html(&self) -> Result<String, DriverError>;

    fn current_url(&self) -> Option<String>;

    /// Activate the first element matching `selector`. Returns `false` when
    /// nothing matched or the element does nothing when activated.
    async fn click(&mut self, selector: &str) -> Result<bool, DriverError>;

    /// Skip loading the given resource types (`image`, `font`, `media`, ...).
    fn block_resources(&mut self, kinds: &[String]);
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// A fresh browsing context sharing nothing with earlier ones.
    async fn open(&self) -> Result<Box<dyn PageSession>, DriverError>;
}

fn parse_selector(selector: &str) -> Result<Selector, DriverError> {
    Selector::parse(selector).map_err(|_| DriverError::Selector(selector.to_string()))
}

fn document_matches(html: &str, selector: &str) -> Result<bool, DriverError> {
    let sel = parse_selector(selector)?;
    Ok(Html::parse_document(html).select(&sel).next().is_some())
}

/// `href` of the first element matching `selector`, resolved against `base`.
fn link_target(html: &str, base: &str, selector: &str) -> Result<Option<String>, DriverError> {
    let sel = parse_selector(selector)?;
    let document = Html::parse_document(html);
    let Some(href) = document
        .select(&sel)
        .find_map(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"))
    else {
        return Ok(None);
    };
    Ok(resolve_url(base, href))
}

/// Markup only served by bot-challenge interstitials.
const CHALLENGE_SELECTORS: &[&str] = &[
    "form#challenge-form",
    "#challenge-running",
    "#cf-challenge-running",
    "#px-captcha",
    "form#captcha-form",
    "iframe[src*=\"captcha-delivery.com\"]",
    "meta[name=\"aws-waf-token\"]",
];

fn is_challenge_page(html: &str) -> bool {
    let document = Html::parse_document(html);
    CHALLENGE_SELECTORS
        .iter()
        .filter_map(|selector| Selector::parse(selector).ok())
        .any(|sel| document.select(&sel).next().is_some())
}

pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    match Url::parse(href) {
        Ok(url) => Some(url.to_string()),
        Err(_) => Url::parse(base).ok()?.join(href).ok().map(|u| u.to_string()),
    }
}

#[derive(Debug, Clone)]
struct LoadedPage {
    url: String,
    html: String,
}

/// Static-HTML renderer on top of [`HttpFetcher`]. Each session gets its own
/// cookie jar; scripts are not executed, so waits resolve immediately.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    config: HttpClientConfig,
}

impl HttpRenderer {
    pub fn new(config: HttpClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    async fn open(&self) -> Result<Box<dyn PageSession>, DriverError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            cookie_store: true,
            ..self.config.clone()
        })
        .map_err(|err| DriverError::Open(err.to_string()))?;
        Ok(Box::new(HttpSession {
            fetcher,
            page: None,
            blocked: Vec::new(),
        }))
    }
}

struct HttpSession {
    fetcher: HttpFetcher,
    page: Option<LoadedPage>,
    blocked: Vec<String>,
}

#[async_trait]
impl PageSession for HttpSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        let response = self.fetcher.fetch_bytes(url).await?;
        let html = response.text();
        if is_challenge_page(&html) {
            return Err(DriverError::Navigation {
                url: url.to_string(),
                reason: "challenge page served".to_string(),
            });
        }
        self.page = Some(LoadedPage {
            url: response.final_url,
            html,
        });
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, DriverError> {
        let page = self.page.as_ref().ok_or(DriverError::NothingLoaded)?;
        document_matches(&page.html, selector)
    }

    fn html(&self) -> Result<String, DriverError> {
        self.page
            .as_ref()
            .map(|p| p.html.clone())
            .ok_or(DriverError::NothingLoaded)
    }

    fn current_url(&self) -> Option<String> {
        self.page.as_ref().map(|p| p.url.clone())
    }

    async fn click(&mut self, selector: &str) -> Result<bool, DriverError> {
        let page = self.page.as_ref().ok_or(DriverError::NothingLoaded)?;
        match link_target(&page.html, &page.url, selector)? {
            Some(target) => {
                self.navigate(&target).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn block_resources(&mut self, kinds: &[String]) {
        // Subresources are never fetched over plain HTTP.
        self.blocked = kinds.to_vec();
        debug!(kinds = ?self.blocked, "resource blocking requested");
    }
}

#[derive(Debug, Default)]
struct FixtureState {
    pages: HashMap<String, String>,
    failures: Mutex<HashMap<String, u32>>,
    visits: Mutex<Vec<String>>,
    sessions_opened: AtomicUsize,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Replays registered pages by exact URL. Failures can be injected per URL
/// to exercise navigation retries.
#[derive(Debug, Clone, Default)]
pub struct FixtureRenderer {
    state: Arc<FixtureState>,
}

impl FixtureRenderer {
    pub fn builder() -> FixtureRendererBuilder {
        FixtureRendererBuilder::default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    /// Most navigations that were ever in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every navigation attempt, in order, including failed ones.
    pub fn visits(&self) -> Vec<String> {
        self.state
            .visits
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
pub struct FixtureRendererBuilder {
    pages: HashMap<String, String>,
    failures: HashMap<String, u32>,
    latency: Duration,
}

impl FixtureRendererBuilder {
    pub fn page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    /// Fail the next `times` navigations to `url`.
    pub fn fail(mut self, url: impl Into<String>, times: u32) -> Self {
        self.failures.insert(url.into(), times);
        self
    }

    /// Time every navigation takes to complete.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn build(self) -> FixtureRenderer {
        FixtureRenderer {
            state: Arc::new(FixtureState {
                pages: self.pages,
                failures: Mutex::new(self.failures),
                visits: Mutex::new(Vec::new()),
                sessions_opened: AtomicUsize::new(0),
                latency: self.latency,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }
}

#[async_trait]
impl PageRenderer for FixtureRenderer {
    async fn open(&self) -> Result<Box<dyn PageSession>, DriverError> {
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixtureSession {
            state: Arc::clone(&self.state),
            page: None,
        }))
    }
}

struct FixtureSession {
    state: Arc<FixtureState>,
    page: Option<LoadedPage>,
}

impl FixtureSession {
    fn take_failure(&self, url: &str) -> bool {
        let Ok(mut failures) = self.state.failures.lock() else {
            return false;
        };
        match failures.get_mut(url) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PageSession for FixtureSession {
    async fn navigate(&mut self, url: &str) -> Result<(), DriverError> {
        if let Ok(mut visits) = self.state.visits.lock() {
            visits.push(url.to_string());
        }
        let concurrent = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_in_flight.fetch_max(concurrent, Ordering::SeqCst);
        if !self.state.latency.is_zero() {
            tokio::time::sleep(self.state.latency).await;
        }
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.take_failure(url) {
            return Err(DriverError::Navigation {
                url: url.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let html = self
            .state
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| DriverError::Navigation {
                url: url.to_string(),
                reason: "404 no fixture registered".to_string(),
            })?;
        self.page = Some(LoadedPage {
            url: url.to_string(),
            html,
        });
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, DriverError> {
        let page = self.page.as_ref().ok_or(DriverError::NothingLoaded)?;
        let matched = document_matches(&page.html, selector)?;
        if !matched {
            // A real browser would keep polling until the deadline.
            tokio::time::sleep(timeout).await;
        }
        Ok(matched)
    }

    fn html(&self) -> Result<String, DriverError> {
        self.page
            .as_ref()
            .map(|p| p.html.clone())
            .ok_or(DriverError::NothingLoaded)
    }

    fn current_url(&self) -> Option<String> {
        self.page.as_ref().map(|p| p.url.clone())
    }

    async fn click(&mut self, selector: &str) -> Result<bool, DriverError> {
        let page = self.page.as_ref().ok_or(DriverError::NothingLoaded)?;
        match link_target(&page.html, &page.url, selector)? {
            Some(target) => {
                self.navigate(&target).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn block_resources(&mut self, _kinds: &[String]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixture_session_follows_links_on_click() {
        let renderer = FixtureRenderer::builder()
            .page(
                "https://site.test/list?page=1",
                r#"<a class="next" href="/list?page=2">next</a>"#,
            )
            .page("https://site.test/list?page=2", "<p>two</p>")
            .build();

        let mut session = renderer.open().await.expect("open");
        session
            .navigate("https://site.test/list?page=1")
            .await
            .expect("navigate");
        assert!(session.click("a.next").await.expect("click"));
        assert_eq!(
            session.current_url().as_deref(),
            Some("https://site.test/list?page=2")
        );
        assert!(!session.click("a.next").await.expect("no link"));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let renderer = FixtureRenderer::builder()
            .page("https://site.test/", "<html></html>")
            .fail("https://site.test/", 1)
            .build();
        let mut session = renderer.open().await.expect("open");

        assert!(session.navigate("https://site.test/").await.is_err());
        assert!(session.navigate("https://site.test/").await.is_ok());
        assert_eq!(renderer.visits().len(), 2);
    }

    #[test]
    fn challenge_pages_are_told_apart_from_recaptcha_forms() {
        let listing = r#"<html><head>
            <script src="https://www.google.com/recaptcha/api.js" async defer></script>
          </head><body><div class="g-recaptcha" data-sitekey="x"></div>
          <div data-testid="card-container">Villa</div></body></html>"#;
        assert!(!is_challenge_page(listing));

        let challenge = r#"<html><body><div id="challenge-running">Checking your browser</div>
          <form id="challenge-form" action="/cdn-cgi/challenge"></form></body></html>"#;
        assert!(is_challenge_page(challenge));
        assert!(is_challenge_page(
            r#"<iframe src="https://geo.captcha-delivery.com/captcha/?cid=1"></iframe>"#
        ));
    }

    #[test]
    fn relative_links_resolve_against_base() {
        assert_eq!(
            resolve_url("https://www.expat-dakar.com/immobilier?page=1", "/immobilier?page=2")
                .as_deref(),
            Some("https://www.expat-dakar.com/immobilier?page=2")
        );
        assert_eq!(
            resolve_url("https://a.test/x", "https://b.test/y").as_deref(),
            Some("https://b.test/y")
        );
    }
}
