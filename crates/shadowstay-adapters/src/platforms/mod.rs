//! Per-platform drivers behind one small capability trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::Html;
use serde_json::Value as JsonValue;
use shadowstay_core::{ListingDraft, Platform, PricePeriod, RawListingDraft, SearchParams};
use tracing::{debug, warn};

use crate::driver::{DriverError, PageSession};
use crate::selectors::{SelectorCatalog, SelectorProfile};
use crate::{
    any_match, extract_numbers, parse_selector, select_first_attr, select_first_text, AdapterError,
};

pub mod airbnb;
pub mod booking;
pub mod expat_dakar;

pub use airbnb::AirbnbAdapter;
pub use booking::BookingAdapter;
pub use expat_dakar::ExpatDakarAdapter;

/// How the next results page was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPage {
    /// The crawler must navigate here.
    Navigate(String),
    /// The driver already moved the session onto the next page.
    Clicked,
}

/// The five platform-specific steps of a crawl. Everything else is shared.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn profile(&self) -> &SelectorProfile;

    /// URL of results page `page` (1-based).
    fn build_search_url(&self, params: &SearchParams, page: u32) -> String;

    async fn wait_for_results(
        &self,
        session: &mut dyn PageSession,
        timeout: Duration,
    ) -> Result<bool, DriverError> {
        session
            .wait_for_selector(&self.profile().results_ready, timeout)
            .await
    }

    /// Listing cards on one results page. Cards that fail to parse are logged
    /// and skipped; only a broken selector fails the page.
    fn parse_results(&self, html: &str, page_url: &str) -> Result<Vec<RawListingDraft>, AdapterError>;

    /// Locate the pagination control on the current page. `None` ends the crawl.
    async fn go_to_next_page(
        &self,
        session: &mut dyn PageSession,
        params: &SearchParams,
        current_page: u32,
    ) -> Result<Option<NextPage>, DriverError>;

    /// Full record from a detail page, seeded with the card data.
    fn parse_detail(
        &self,
        card: &RawListingDraft,
        html: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<ListingDraft, AdapterError>;

    async fn dismiss_popups(&self, session: &mut dyn PageSession) -> Result<(), DriverError> {
        for selector in &self.profile().popup_dismiss {
            if session.click(selector).await? {
                debug!(platform = %self.platform(), selector = %selector, "dismissed popup");
            }
        }
        Ok(())
    }

    fn detail_url(&self, card: &RawListingDraft) -> Option<String> {
        card.url.clone()
    }

    /// `go_to_next_page` loads the next page itself by activating a control.
    fn paginates_by_click(&self) -> bool {
        false
    }
}

/// Driver for `platform` configured from `catalog`.
pub fn adapter_for_platform(
    platform: Platform,
    catalog: &SelectorCatalog,
) -> Option<Arc<dyn PlatformAdapter>> {
    let profile = catalog.profile(platform)?.clone();
    let adapter: Arc<dyn PlatformAdapter> = match platform {
        Platform::Airbnb => Arc::new(AirbnbAdapter::new(profile)),
        Platform::Booking => Arc::new(BookingAdapter::new(profile)),
        Platform::ExpatDakar => Arc::new(ExpatDakarAdapter::new(profile)),
    };
    Some(adapter)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPrice {
    pub amount: f64,
    pub currency: Option<String>,
    /// `None` when the label does not say how often the price is charged.
    pub period: Option<PricePeriod>,
}

/// Billing period a platform quotes when the price label does not say.
pub fn default_price_period(platform: Platform) -> PricePeriod {
    match platform {
        Platform::ExpatDakar => PricePeriod::Month,
        Platform::Airbnb | Platform::Booking => PricePeriod::Night,
    }
}

fn mentions(text: &str, pattern: &str) -> bool {
    Regex::new(pattern).is_ok_and(|re| re.is_match(text))
}

/// Amount, currency and billing period from a price label such as `$123`,
/// `123 €`, `30 000 FCFA / mois` or `XOF 12,345 par nuit`.
pub fn parse_price_text(text: &str) -> Option<ParsedPrice> {
    let amount = extract_numbers(text)
        .into_iter()
        .find(|v| *v > 0.0)?;

    let currency = if mentions(text, r"(?i)(?:\bxof|cfa\b)") {
        Some("XOF")
    } else if text.contains('€') || mentions(text, r"(?i)\beuros?\b|\beur\b") {
        Some("EUR")
    } else if text.contains('$') || mentions(text, r"(?i)\busd\b") {
        Some("USD")
    } else {
        None
    };

    let period = if mentions(text, r"(?i)\b(?:mois|mensuel(?:le)?|months?|monthly)\b") {
        Some(PricePeriod::Month)
    } else if mentions(text, r"(?i)\b(?:nuits?|nuitée|nights?|nightly)\b") {
        Some(PricePeriod::Night)
    } else {
        None
    };

    Some(ParsedPrice {
        amount,
        currency: currency.map(str::to_string),
        period,
    })
}

/// Listing built from card data alone, used when no detail page is available.
pub fn card_listing(card: &RawListingDraft, scraped_at: DateTime<Utc>) -> ListingDraft {
    let mut listing = ListingDraft::new(card.platform, card.external_id.clone(), scraped_at);
    listing.url = card.url.clone();
    listing.title = card.title.clone();
    listing.location_text = card.location_text.clone();
    listing.rating = card.rating;
    listing.photos = card.photo_url.iter().cloned().collect();
    if let Some(price_text) = &card.price_text {
        listing
            .extras
            .insert("price_text".to_string(), JsonValue::String(price_text.clone()));
        if let Some(price) = parse_price_text(price_text) {
            listing.price = Some(price.amount);
            listing.currency = price.currency;
            listing.price_period = price
                .period
                .unwrap_or_else(|| default_price_period(card.platform));
        }
    }
    listing
}

/// Whether any of `selectors` matches somewhere in `html`.
pub(crate) fn page_has_match(html: &str, selectors: &[String]) -> Result<bool, AdapterError> {
    let document = Html::parse_document(html);
    any_match(document.root_element(), selectors)
}

/// Split `"Neighborhood, City[, Country]"` into its first two parts.
pub(crate) fn split_location(text: &str) -> (Option<String>, Option<String>) {
    let mut parts = text
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty());
    let first = parts.next().map(str::to_string);
    match parts.next() {
        Some(second) => (first, Some(second.to_string())),
        None => (None, first),
    }
}

/// Cards matched by the first card selector that finds any, each handed to
/// `parse_card`. Per-card failures and cards without an id are dropped;
/// duplicate ids on the page are kept once.
pub(crate) fn collect_cards<F>(
    platform: Platform,
    profile: &SelectorProfile,
    html: &str,
    mut parse_card: F,
) -> Result<Vec<RawListingDraft>, AdapterError>
where
    F: FnMut(scraper::ElementRef<'_>) -> Result<Option<RawListingDraft>, AdapterError>,
{
    let document = Html::parse_document(html);
    let mut out: Vec<RawListingDraft> = Vec::new();
    for selector in &profile.card {
        let sel = parse_selector(selector)?;
        let cards: Vec<_> = document.select(&sel).collect();
        if cards.is_empty() {
            continue;
        }
        for card in cards {
            match parse_card(card) {
                Ok(Some(draft)) => {
                    if !out.iter().any(|d| d.external_id == draft.external_id) {
                        out.push(draft);
                    }
                }
                Ok(None) => debug!(%platform, "card without external id skipped"),
                Err(err @ AdapterError::Selector { .. }) => return Err(err),
                Err(err) => warn!(%platform, error = %err, "card parse failed"),
            }
        }
        break;
    }
    Ok(out)
}

/// Card fields shared by every platform; the caller supplies the id.
pub(crate) fn card_fields(
    platform: Platform,
    profile: &SelectorProfile,
    card: scraper::ElementRef<'_>,
    external_id: String,
    url: Option<String>,
) -> Result<RawListingDraft, AdapterError> {
    let rating = match select_first_attr(card, &profile.card_rating, &["aria-label"])? {
        Some(label) => extract_numbers(&label.replace(',', ".")).into_iter().next(),
        None => select_first_text(card, &profile.card_rating)?
            .and_then(|t| extract_numbers(&t.replace(',', ".")).into_iter().next()),
    };
    Ok(RawListingDraft {
        platform,
        external_id,
        url,
        title: select_first_text(card, &profile.card_title)?
            .or(select_first_attr(card, &profile.card_title, &["alt", "title"])?),
        price_text: select_first_text(card, &profile.card_price)?,
        location_text: select_first_text(card, &profile.card_location)?,
        photo_url: select_first_attr(card, &profile.card_photo, &["src", "data-src"])?
            .filter(|src| !src.starts_with("data:")),
        rating,
    })
}

/// Replace `slot` only when the detail page produced a value.
pub(crate) fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if let Some(value) = value {
        *slot = Some(value);
    }
}

/// Coarse property type from a listing title.
pub(crate) fn detect_property_type(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let table: [(&[&str], &'static str); 6] = [
        (&["villa"], "villa"),
        (&["studio"], "studio"),
        (&["appartement", "apartment", "condo"], "apartment"),
        (&["maison", "house"], "house"),
        (&["chambre", "room"], "room"),
        (&["hotel", "hôtel", "auberge", "guesthouse"], "hotel"),
    ];
    table
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, kind)| *kind)
}

/// JSON-LD blocks embedded in a page.
pub(crate) fn json_ld_blocks(document: &Html) -> Vec<JsonValue> {
    let Ok(sel) = parse_selector(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|el| serde_json::from_str::<JsonValue>(&el.text().collect::<String>()).ok())
        .flat_map(|value| match value {
            JsonValue::Array(items) => items,
            other => vec![other],
        })
        .collect()
}
