use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::Html;
use serde_json::Value as JsonValue;
use shadowstay_core::{ListingDraft, Platform, RawListingDraft, SearchParams};
use url::form_urlencoded;

use super::{
    card_fields, card_listing, collect_cards, default_price_period, detect_property_type,
    json_ld_blocks, overlay, parse_price_text, NextPage, PlatformAdapter,
};
use crate::driver::{DriverError, PageSession};
use crate::selectors::SelectorProfile;
use crate::{
    any_match, count_before, embedded_json_value, select_all_attrs, select_all_texts,
    select_first_attr, select_first_text, AdapterError,
};

const BASE_URL: &str = "https://www.airbnb.com";
pub const PAGE_SIZE: u32 = 18;
const COUNTRY: &str = "Senegal";
const AMENITY_NOISE: [&str; 8] = ["report", "show", "more", "less", "view", "close", "back", "next"];

#[derive(Debug, Clone)]
pub struct AirbnbAdapter {
    profile: SelectorProfile,
}

impl AirbnbAdapter {
    pub fn new(profile: SelectorProfile) -> Self {
        Self { profile }
    }

    fn room_id(href: &str) -> Option<String> {
        let re = Regex::new(r"/rooms/(\d+)").ok()?;
        Some(re.captures(href)?.get(1)?.as_str().to_string())
    }

    fn has_next_control(&self, html: &str) -> Result<bool, AdapterError> {
        let document = Html::parse_document(html);
        any_match(document.root_element(), &self.profile.next_page)
    }
}

fn embedded_f64(html: &str, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|k| embedded_json_value(html, k))
        .and_then(|v| v.parse().ok())
}

fn embedded_u32(html: &str, key: &str) -> Option<u32> {
    embedded_json_value(html, key).and_then(|v| v.parse().ok())
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_u32(value: &JsonValue) -> Option<u32> {
    match value {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

/// Amenity titles from the embedded amenity list, minus UI labels.
fn embedded_amenities(html: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r#""title":"([^"]+)","icon":"[A-Z_]+""#) else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for caps in re.captures_iter(html) {
        let Some(title) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let lower = title.to_lowercase();
        if title.len() < 50
            && !AMENITY_NOISE.iter().any(|w| lower.contains(w))
            && !out.iter().any(|a| a == title)
        {
            out.push(title.to_string());
        }
    }
    out
}

#[async_trait]
impl PlatformAdapter for AirbnbAdapter {
    fn platform(&self) -> Platform {
        Platform::Airbnb
    }

    fn profile(&self) -> &SelectorProfile {
        &self.profile
    }

    fn build_search_url(&self, params: &SearchParams, page: u32) -> String {
        let place = format!("{}--{COUNTRY}", params.city.trim().replace(' ', "-"));
        let place: String = form_urlencoded::byte_serialize(place.as_bytes()).collect();
        let mut query = form_urlencoded::Serializer::new(String::new());
        let offset = page.saturating_sub(1) * PAGE_SIZE;
        if offset > 0 {
            query.append_pair("items_offset", &offset.to_string());
        }
        if let Some(min) = params.min_price {
            query.append_pair("price_min", &format!("{min:.0}"));
        }
        if let Some(max) = params.max_price {
            query.append_pair("price_max", &format!("{max:.0}"));
        }
        let query = query.finish();
        if query.is_empty() {
            format!("{BASE_URL}/s/{place}/homes")
        } else {
            format!("{BASE_URL}/s/{place}/homes?{query}")
        }
    }

    fn parse_results(&self, html: &str, _page_url: &str) -> Result<Vec<RawListingDraft>, AdapterError> {
        collect_cards(Platform::Airbnb, &self.profile, html, |card| {
            let Some(href) = select_first_attr(card, &self.profile.card_link, &["href"])? else {
                return Ok(None);
            };
            let Some(id) = Self::room_id(&href) else {
                return Ok(None);
            };
            let url = format!("{BASE_URL}/rooms/{id}");
            card_fields(Platform::Airbnb, &self.profile, card, id, Some(url)).map(Some)
        })
    }

    async fn go_to_next_page(
        &self,
        session: &mut dyn PageSession,
        params: &SearchParams,
        current_page: u32,
    ) -> Result<Option<NextPage>, DriverError> {
        let html = session.html()?;
        let has_next = self
            .has_next_control(&html)
            .map_err(|err| DriverError::Selector(err.to_string()))?;
        Ok(has_next.then(|| NextPage::Navigate(self.build_search_url(params, current_page + 1))))
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
        let mut found_structured = false;
        let mut ld_name = None;
        let mut ld_description = None;

        if let Some(ld) = json_ld_blocks(&document)
            .into_iter()
            .find(|v| v.get("name").is_some())
        {
            found_structured = true;
            ld_name = ld.get("name").and_then(JsonValue::as_str).map(str::to_string);
            ld_description = ld.get("description").and_then(JsonValue::as_str).map(str::to_string);
            if let Some(images) = ld.get("image").and_then(JsonValue::as_array) {
                let photos: Vec<String> = images
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
                if !photos.is_empty() {
                    listing.photos = photos;
                }
            }
            overlay(
                &mut listing.rating,
                json_path(&ld, &["aggregateRating", "ratingValue"]).and_then(json_f64),
            );
            overlay(
                &mut listing.review_count,
                json_path(&ld, &["aggregateRating", "ratingCount"]).and_then(json_u32),
            );
            overlay(
                &mut listing.max_guests,
                json_path(&ld, &["containsPlace", "occupancy", "value"]).and_then(json_u32),
            );
            overlay(
                &mut listing.neighborhood,
                json_path(&ld, &["address", "addressLocality"])
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            );
        }

        let title = match ld_name {
            Some(name) => Some(name),
            None => select_first_text(root, &detail.title)?,
        };
        overlay(&mut listing.title, title);
        let description = match ld_description {
            Some(text) => Some(text),
            None => select_first_text(root, &detail.description)?,
        };
        overlay(&mut listing.description, description);
        overlay(&mut listing.location_text, select_first_text(root, &detail.location)?);

        let property_type = match embedded_json_value(html, "roomType") {
            Some(kind) => Some(kind),
            None => select_first_text(root, &detail.property_type)?,
        };
        overlay(&mut listing.property_type, property_type);
        overlay(
            &mut listing.bedrooms,
            embedded_u32(html, "bedrooms").or_else(|| count_before(html, &["bedroom", "chambre"])),
        );
        overlay(
            &mut listing.bathrooms,
            embedded_u32(html, "bathrooms").or_else(|| count_before(html, &["bath", "salle de bain"])),
        );
        if listing.max_guests.is_none() {
            listing.max_guests =
                embedded_u32(html, "personCapacity").or_else(|| count_before(html, &["guest", "voyageur"]));
        }
        overlay(&mut listing.latitude, embedded_f64(html, &["lat", "latitude"]));
        overlay(&mut listing.longitude, embedded_f64(html, &["lng", "longitude"]));
        overlay(&mut listing.city, embedded_json_value(html, "city"));
        overlay(&mut listing.host_id, embedded_json_value(html, "hostId"));

        let host = embedded_json_value(html, "hostDisplayName")
            .or(select_first_text(root, &detail.host_name)?)
            .or_else(|| {
                let re = Regex::new(r"(?:Hosted by|Hôte\s*:|Logement proposé par)\s+([^<\x22]+)").ok()?;
                Some(re.captures(html)?.get(1)?.as_str().trim().to_string())
            });
        overlay(&mut listing.host_name, host);

        if let Some(price) = select_first_text(root, &detail.price)?.and_then(|t| parse_price_text(&t)) {
            listing.price = Some(price.amount);
            listing.currency = price.currency.or(listing.currency.take());
            listing.price_period = price.period.unwrap_or_else(|| default_price_period(Platform::Airbnb));
        }
        if listing.price.is_some() && listing.currency.is_none() {
            listing.currency = Some("USD".to_string());
        }

        let mut amenities = embedded_amenities(html);
        if amenities.is_empty() {
            amenities = select_all_texts(root, &detail.amenities)?;
        }
        if !amenities.is_empty() {
            listing.amenities = amenities;
        }
        if !found_structured {
            let photos = select_all_attrs(root, &detail.photos, &["src", "data-original-uri"])?;
            if !photos.is_empty() {
                listing.photos = photos;
            }
        }
        if listing.property_type.is_none() {
            listing.property_type = listing
                .title
                .as_deref()
                .and_then(detect_property_type)
                .map(str::to_string);
        }
        if html.contains("Superhost") {
            listing
                .extras
                .insert("is_superhost".to_string(), JsonValue::Bool(true));
        }

        if !found_structured && listing.description.is_none() && listing.host_name.is_none() {
            return Err(AdapterError::parse(
                Platform::Airbnb,
                format!("room {} detail page carried no listing data", card.external_id),
            ));
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::SelectorCatalog;

    fn adapter() -> AirbnbAdapter {
        let catalog = SelectorCatalog::builtin().expect("catalog");
        AirbnbAdapter::new(catalog.profile(Platform::Airbnb).expect("profile").clone())
    }

    #[test]
    fn search_urls_page_by_offset() {
        let a = adapter();
        let params = SearchParams::new("Saint Louis", 3);
        assert_eq!(
            a.build_search_url(&params, 1),
            "https://www.airbnb.com/s/Saint-Louis--Senegal/homes"
        );
        assert_eq!(
            a.build_search_url(&params, 3),
            "https://www.airbnb.com/s/Saint-Louis--Senegal/homes?items_offset=36"
        );
    }

    #[test]
    fn cards_are_parsed_and_deduplicated() {
        let html = r#"
        <div data-testid="card-container">
          <a href="/rooms/123456?check_in=2026-10-01">link</a>
          <div data-testid="listing-card-title">Apartment in Ouakam</div>
          <div data-testid="listing-card-subtitle">Ouakam, Dakar</div>
          <div data-testid="price-availability-row">$45 night</div>
          <span aria-label="4.92 out of 5 average rating">4.92</span>
          <img src="https://a0.muscache.com/im/pictures/1.jpg">
        </div>
        <div data-testid="card-container">
          <a href="/rooms/123456">dup</a>
        </div>
        <div data-testid="card-container"><span>sponsored, no link</span></div>
        "#;
        let cards = adapter().parse_results(html, "https://www.airbnb.com/s/Dakar--Senegal/homes").expect("parse");
        assert_eq!(cards.len(), 1);
        let card = &cards[0];
        assert_eq!(card.external_id, "123456");
        assert_eq!(card.url.as_deref(), Some("https://www.airbnb.com/rooms/123456"));
        assert_eq!(card.title.as_deref(), Some("Apartment in Ouakam"));
        assert_eq!(card.price_text.as_deref(), Some("$45 night"));
        assert_eq!(card.rating, Some(4.92));
    }

    #[test]
    fn detail_page_merges_structured_data() {
        let card = RawListingDraft {
            platform: Platform::Airbnb,
            external_id: "123456".into(),
            url: Some("https://www.airbnb.com/rooms/123456".into()),
            title: Some("Apartment in Ouakam".into()),
            price_text: Some("$45 night".into()),
            location_text: None,
            photo_url: None,
            rating: None,
        };
        let html = r#"<html><head>
          <script type="application/ld+json">{"name":"Sea view flat","description":"Bright flat near the corniche",
            "image":["https://a0.muscache.com/a.jpg","https://a0.muscache.com/b.jpg"],
            "aggregateRating":{"ratingValue":"4.8","ratingCount":"31"},
            "containsPlace":{"occupancy":{"value":4}}}</script>
          </head><body>
          <script>{"roomType":"Entire home","bedrooms":2,"bathrooms":1,"lat":14.7451,"lng":-17.5123,
            "hostId":"991","hostDisplayName":"Moussa",
            "title":"Wifi","icon":"SYSTEM_WI_FI","title":"Show all amenities","icon":"SYSTEM_MORE"}</script>
          </body></html>"#;
        let listing = adapter().parse_detail(&card, html, Utc::now()).expect("detail");
        assert_eq!(listing.title.as_deref(), Some("Sea view flat"));
        assert_eq!(listing.photos.len(), 2);
        assert_eq!(listing.review_count, Some(31));
        assert_eq!(listing.max_guests, Some(4));
        assert_eq!(listing.bedrooms, Some(2));
        assert_eq!(listing.latitude, Some(14.7451));
        assert_eq!(listing.longitude, Some(-17.5123));
        assert_eq!(listing.host_id.as_deref(), Some("991"));
        assert_eq!(listing.host_name.as_deref(), Some("Moussa"));
        assert_eq!(listing.property_type.as_deref(), Some("Entire home"));
        assert_eq!(listing.amenities, vec!["Wifi".to_string()]);
        assert_eq!(listing.price, Some(45.0));
        assert_eq!(listing.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn empty_detail_page_is_a_parse_error() {
        let card = RawListingDraft {
            platform: Platform::Airbnb,
            external_id: "1".into(),
            url: None,
            title: None,
            price_text: None,
            location_text: None,
            photo_url: None,
            rating: None,
        };
        assert!(adapter().parse_detail(&card, "<html><body>blocked</body></html>", Utc::now()).is_err());
    }
}
