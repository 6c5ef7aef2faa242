use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::Html;
use serde_json::Value as JsonValue;
use shadowstay_core::{ListingDraft, Platform, RawListingDraft, SearchParams};
use tracing::debug;
use url::form_urlencoded;

use super::{
    card_fields, card_listing, collect_cards, default_price_period, detect_property_type, overlay,
    parse_price_text, split_location, NextPage, PlatformAdapter,
};
use crate::driver::{resolve_url, DriverError, PageSession};
use crate::selectors::SelectorProfile;
use crate::{
    count_before, select_all_attrs, select_all_texts, select_first_attr, select_first_text,
    AdapterError,
};

const BASE_URL: &str = "https://www.expat-dakar.com";

/// Classifieds: rents are quoted per month and sellers publish phone numbers.
#[derive(Debug, Clone)]
pub struct ExpatDakarAdapter {
    profile: SelectorProfile,
}

impl ExpatDakarAdapter {
    pub fn new(profile: SelectorProfile) -> Self {
        Self { profile }
    }

    /// Ad id is the trailing number of the ad slug: `/annonce/villa-saly-5521`.
    fn ad_id(url: &str) -> Option<String> {
        let path = url.split(['?', '#']).next()?.trim_end_matches('/');
        let re = Regex::new(r"-(\d+)$").ok()?;
        Some(re.captures(path)?.get(1)?.as_str().to_string())
    }
}

#[async_trait]
impl PlatformAdapter for ExpatDakarAdapter {
    fn platform(&self) -> Platform {
        Platform::ExpatDakar
    }

    fn profile(&self) -> &SelectorProfile {
        &self.profile
    }

    fn build_search_url(&self, params: &SearchParams, page: u32) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("q", params.city.trim());
        if let Some(min) = params.min_price {
            query.append_pair("price_min", &format!("{min:.0}"));
        }
        if let Some(max) = params.max_price {
            query.append_pair("price_max", &format!("{max:.0}"));
        }
        if page > 1 {
            query.append_pair("page", &page.to_string());
        }
        format!("{BASE_URL}/immobilier?{}", query.finish())
    }

    fn parse_results(&self, html: &str, page_url: &str) -> Result<Vec<RawListingDraft>, AdapterError> {
        let base = if page_url.is_empty() { BASE_URL } else { page_url };
        collect_cards(Platform::ExpatDakar, &self.profile, html, |card| {
            let Some(href) = select_first_attr(card, &self.profile.card_link, &["href"])? else {
                return Ok(None);
            };
            let Some(url) = resolve_url(base, &href) else {
                return Ok(None);
            };
            let Some(id) = Self::ad_id(&url) else {
                return Ok(None);
            };
            card_fields(Platform::ExpatDakar, &self.profile, card, id, Some(url)).map(Some)
        })
    }

    fn paginates_by_click(&self) -> bool {
        true
    }

    /// Pagination is a plain link; following it moves the session.
    async fn go_to_next_page(
        &self,
        session: &mut dyn PageSession,
        _params: &SearchParams,
        current_page: u32,
    ) -> Result<Option<NextPage>, DriverError> {
        for selector in &self.profile.next_page {
            if session.click(selector).await? {
                debug!(page = current_page + 1, "followed pagination link");
                return Ok(Some(NextPage::Clicked));
            }
        }
        Ok(None)
    }

    fn parse_detail(
        &self,
        card: &RawListingDraft,
        html: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<ListingDraft, AdapterError> {
        let document = Html::parse_document(html);
        let root = document.root_element();
        let detail = &self.profile.detail;
        let mut listing = card_listing(card, scraped_at);

        let title = select_first_text(root, &detail.title)?;
        let description = select_first_text(root, &detail.description)?;
        if title.is_none() && description.is_none() {
            return Err(AdapterError::parse(
                Platform::ExpatDakar,
                format!("ad {} detail page carried no listing data", card.external_id),
            ));
        }
        overlay(&mut listing.title, title);
        overlay(&mut listing.description, description);

        if let Some(location) = select_first_text(root, &detail.location)? {
            let (neighborhood, city) = split_location(&location);
            overlay(&mut listing.neighborhood, neighborhood);
            overlay(&mut listing.city, city);
            listing.location_text = Some(location);
        }
        overlay(&mut listing.host_name, select_first_text(root, &detail.host_name)?);

        let phone = match select_first_attr(root, &detail.phone, &["href"])? {
            Some(href) if href.starts_with("tel:") => Some(href.trim_start_matches("tel:").trim().to_string()),
            _ => select_first_text(root, &detail.phone)?,
        };
        overlay(&mut listing.phone, phone);

        if let Some(price) = select_first_text(root, &detail.price)?.and_then(|t| parse_price_text(&t)) {
            listing.price = Some(price.amount);
            listing.currency = price.currency.or(listing.currency.take());
            listing.price_period = price
                .period
                .unwrap_or_else(|| default_price_period(Platform::ExpatDakar));
        }
        if listing.price.is_some() && listing.currency.is_none() {
            listing.currency = Some("XOF".to_string());
        }

        let property_type = match select_first_text(root, &detail.property_type)? {
            Some(kind) => Some(kind),
            None => listing
                .title
                .as_deref()
                .and_then(detect_property_type)
                .map(str::to_string),
        };
        overlay(&mut listing.property_type, property_type);

        let features = select_all_texts(root, &detail.amenities)?;
        let text = root.text().collect::<Vec<_>>().join(" ");
        overlay(&mut listing.bedrooms, count_before(&text, &["chambre", "pièce"]));
        overlay(&mut listing.bathrooms, count_before(&text, &["salle de bain", "salles de bain", "salle d'eau"]));
        if let Some(surface) = Regex::new(r"(\d{2,4})\s*m(?:²|2\b)")
            .ok()
            .and_then(|re| re.captures(&text)?.get(1)?.as_str().parse::<u64>().ok())
        {
            listing
                .extras
                .insert("surface_m2".to_string(), JsonValue::from(surface));
        }
        if !features.is_empty() {
            listing.amenities = features;
        }

        let photos = select_all_attrs(root, &detail.photos, &["src", "data-src"])?;
        if !photos.is_empty() {
            listing.photos = photos;
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use shadowstay_core::PricePeriod;

    use super::*;
    use crate::driver::{FixtureRenderer, PageRenderer};
    use crate::selectors::SelectorCatalog;

    fn adapter() -> ExpatDakarAdapter {
        let catalog = SelectorCatalog::builtin().expect("catalog");
        ExpatDakarAdapter::new(catalog.profile(Platform::ExpatDakar).expect("profile").clone())
    }

    #[test]
    fn search_url_pages_by_query() {
        let a = adapter();
        let params = SearchParams::new("Dakar", 5);
        assert_eq!(a.build_search_url(&params, 1), "https://www.expat-dakar.com/immobilier?q=Dakar");
        assert_eq!(
            a.build_search_url(&params, 3),
            "https://www.expat-dakar.com/immobilier?q=Dakar&page=3"
        );
    }

    #[test]
    fn ad_ids_from_slugs() {
        assert_eq!(
            ExpatDakarAdapter::ad_id("https://www.expat-dakar.com/annonce/villa-meublee-almadies-5521?ref=x").as_deref(),
            Some("5521")
        );
        assert_eq!(ExpatDakarAdapter::ad_id("https://www.expat-dakar.com/annonce/"), None);
    }

    #[test]
    fn cards_resolve_relative_links() {
        let html = r#"
        <div class="listing-card">
          <a class="listing-card__inner" href="/annonce/appartement-f3-mermoz-88120">
            <img src="https://img.expat-dakar.com/1.jpg" alt="Appartement F3 Mermoz">
            <span class="listing-card__price__value">450 000 F Cfa</span>
            <span class="listing-card__header__location">Mermoz, Dakar</span>
          </a>
        </div>"#;
        let cards = adapter()
            .parse_results(html, "https://www.expat-dakar.com/immobilier?q=Dakar")
            .expect("parse");
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].external_id, "88120");
        assert_eq!(
            cards[0].url.as_deref(),
            Some("https://www.expat-dakar.com/annonce/appartement-f3-mermoz-88120")
        );
        assert_eq!(cards[0].title.as_deref(), Some("Appartement F3 Mermoz"));
        assert_eq!(cards[0].location_text.as_deref(), Some("Mermoz, Dakar"));
    }

    #[test]
    fn detail_carries_phone_and_monthly_rent() {
        let card = RawListingDraft {
            platform: Platform::ExpatDakar,
            external_id: "88120".into(),
            url: Some("https://www.expat-dakar.com/annonce/appartement-f3-mermoz-88120".into()),
            title: Some("Appartement F3 Mermoz".into()),
            price_text: Some("450 000 F Cfa".into()),
            location_text: Some("Mermoz, Dakar".into()),
            photo_url: None,
            rating: None,
        };
        let html = r#"<html><body>
          <h1 class="listing-item__header__title">Appartement F3 meublé Mermoz</h1>
          <div class="listing-item__description">2 chambres, 1 salle de bain, 95 m² avec balcon.</div>
          <span class="listing-item__address-location">Mermoz, Dakar</span>
          <span class="listing-item__seller__name">Agence Teranga</span>
          <a href="tel:+221 77 123 45 67">Appeler</a>
          <ul class="listing-item__features"><li>Climatisation</li><li>Gardien</li></ul>
        </body></html>"#;
        let listing = adapter().parse_detail(&card, html, Utc::now()).expect("detail");
        assert_eq!(listing.phone.as_deref(), Some("+221 77 123 45 67"));
        assert_eq!(listing.host_name.as_deref(), Some("Agence Teranga"));
        assert_eq!(listing.price, Some(450_000.0));
        assert_eq!(listing.currency.as_deref(), Some("XOF"));
        assert_eq!(listing.price_period, PricePeriod::Month);
        assert_eq!(listing.bedrooms, Some(2));
        assert_eq!(listing.bathrooms, Some(1));
        assert_eq!(listing.neighborhood.as_deref(), Some("Mermoz"));
        assert_eq!(listing.property_type.as_deref(), Some("apartment"));
        assert_eq!(listing.amenities.len(), 2);
        assert_eq!(listing.extras.get("surface_m2"), Some(&JsonValue::from(95_u64)));
    }

    fn card_priced(price_text: &str) -> RawListingDraft {
        RawListingDraft {
            platform: Platform::ExpatDakar,
            external_id: "90412".into(),
            url: Some("https://www.expat-dakar.com/annonce/studio-ngor-90412".into()),
            title: Some("Studio Ngor".into()),
            price_text: Some(price_text.into()),
            location_text: Some("Ngor, Dakar".into()),
            photo_url: None,
            rating: None,
        }
    }

    #[test]
    fn nightly_detail_price_stays_nightly() {
        let card = card_priced("25 000 F Cfa / nuit");
        let html = r#"<html><body>
          <h1 class="listing-item__header__title">Studio meublé Ngor, location courte durée</h1>
          <span class="listing-item__price">25 000 F Cfa / nuit</span>
        </body></html>"#;
        let from_card = card_listing(&card, Utc::now());
        let from_detail = adapter().parse_detail(&card, html, Utc::now()).expect("detail");
        assert_eq!(from_card.price_period, PricePeriod::Night);
        assert_eq!(from_detail.price_period, PricePeriod::Night);
        assert_eq!(from_detail.price, Some(25_000.0));
        assert_eq!(from_detail.currency.as_deref(), Some("XOF"));
    }

    #[test]
    fn detail_price_without_currency_keeps_the_card_currency() {
        let card = card_priced("600 EUR / mois");
        let html = r#"<html><body>
          <h1 class="listing-item__header__title">Studio Ngor</h1>
          <span class="listing-item__price">650</span>
        </body></html>"#;
        let listing = adapter().parse_detail(&card, html, Utc::now()).expect("detail");
        assert_eq!(listing.price, Some(650.0));
        assert_eq!(listing.currency.as_deref(), Some("EUR"));
        assert_eq!(listing.price_period, PricePeriod::Month);
    }

    #[tokio::test]
    async fn next_page_follows_the_link() {
        let renderer = FixtureRenderer::builder()
            .page(
                "https://www.expat-dakar.com/immobilier?q=Dakar",
                r#"<div class="listing-card"></div><a class="pagination-next" href="/immobilier?q=Dakar&page=2">»</a>"#,
            )
            .page("https://www.expat-dakar.com/immobilier?q=Dakar&page=2", "<p>2</p>")
            .build();
        let mut session = renderer.open().await.expect("open");
        session
            .navigate("https://www.expat-dakar.com/immobilier?q=Dakar")
            .await
            .expect("navigate");
        let params = SearchParams::new("Dakar", 5);
        let a = adapter();
        assert_eq!(
            a.go_to_next_page(session.as_mut(), &params, 1).await.expect("next"),
            Some(NextPage::Clicked)
        );
        assert_eq!(a.go_to_next_page(session.as_mut(), &params, 2).await.expect("last"), None);
    }
}
