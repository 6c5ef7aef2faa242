use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use regex::Regex;
use scraper::Html;
use shadowstay_core::{ListingDraft, Platform, RawListingDraft, SearchParams};
use url::form_urlencoded;

use super::{
    card_fields, card_listing, collect_cards, detect_property_type, overlay, split_location,
    NextPage, PlatformAdapter,
};
use crate::driver::{DriverError, PageSession};
use crate::selectors::SelectorProfile;
use crate::{
    any_match, count_before, embedded_json_value, select_all_attrs, select_all_texts,
    select_first_attr, select_first_text, AdapterError,
};

const SEARCH_URL: &str = "https://www.booking.com/searchresults.fr.html";
const HOTEL_URL: &str = "https://www.booking.com/hotel/sn";
pub const PAGE_SIZE: u32 = 25;
const DEFAULT_LEAD_DAYS: u64 = 7;
const DEFAULT_NIGHTS: u32 = 5;
const MAX_DESCRIPTION: usize = 2000;
const MAX_AMENITIES: usize = 30;
const MAX_PHOTOS: usize = 15;

/// Booking destination ids for the cities we crawl. Unknown cities fall back
/// to a free-text search.
const DESTINATIONS: [(&str, &str); 8] = [
    ("dakar", "-2271854"),
    ("saint-louis", "-2280036"),
    ("saly", "-2279538"),
    ("mbour", "-2275689"),
    ("cap skirring", "-2269855"),
    ("ziguinchor", "-2282912"),
    ("thies", "-2281143"),
    ("senegal", "-2271854"),
];

pub fn destination_id(city: &str) -> Option<&'static str> {
    let key = city
        .trim()
        .to_lowercase()
        .replace('è', "e")
        .replace('ï', "i")
        .replace("saint louis", "saint-louis");
    DESTINATIONS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, id)| *id)
}

/// Search results need a stay window; by default a five-night stay starting a
/// week from today.
#[derive(Debug, Clone)]
pub struct BookingAdapter {
    profile: SelectorProfile,
    check_in: NaiveDate,
    nights: u32,
}

impl BookingAdapter {
    pub fn new(profile: SelectorProfile) -> Self {
        let today = Utc::now().date_naive();
        let check_in = today
            .checked_add_days(Days::new(DEFAULT_LEAD_DAYS))
            .unwrap_or(today);
        Self::with_stay(profile, check_in, DEFAULT_NIGHTS)
    }

    pub fn with_stay(profile: SelectorProfile, check_in: NaiveDate, nights: u32) -> Self {
        Self {
            profile,
            check_in,
            nights: nights.max(1),
        }
    }

    fn check_out(&self) -> NaiveDate {
        self.check_in
            .checked_add_days(Days::new(u64::from(self.nights)))
            .unwrap_or(self.check_in)
    }

    fn hotel_id(card: scraper::ElementRef<'_>, href: Option<&str>) -> Option<String> {
        if let Some(id) = card.value().attr("data-hotelid").filter(|v| !v.trim().is_empty()) {
            return Some(id.trim().to_string());
        }
        let href = href?;
        let slug = Regex::new(r"/hotel/sn/([^/.?]+)").ok()?;
        if let Some(caps) = slug.captures(href) {
            return caps.get(1).map(|m| m.as_str().to_string());
        }
        let numeric = Regex::new(r"hotel_id=(\d+)").ok()?;
        Some(numeric.captures(href)?.get(1)?.as_str().to_string())
    }
}

fn coordinate(html: &str, map_key: &str, json_key: &str) -> Option<f64> {
    let pattern = format!(r#"{}["\s:=]+(-?\d+\.?\d*)"#, regex::escape(map_key));
    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(html)?.get(1)?.as_str().parse().ok())
        .or_else(|| embedded_json_value(html, json_key)?.parse().ok())
}

#[async_trait]
impl PlatformAdapter for BookingAdapter {
    fn platform(&self) -> Platform {
        Platform::Booking
    }

    fn profile(&self) -> &SelectorProfile {
        &self.profile
    }

    fn build_search_url(&self, params: &SearchParams, page: u32) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("ss", &format!("{}, Senegal", params.city.trim()));
        if let Some(dest) = destination_id(&params.city) {
            query.append_pair("dest_id", dest);
            query.append_pair("dest_type", "city");
        }
        query.append_pair("checkin", &self.check_in.format("%Y-%m-%d").to_string());
        query.append_pair("checkout", &self.check_out().format("%Y-%m-%d").to_string());
        query.append_pair("group_adults", "2");
        query.append_pair("no_rooms", "1");
        query.append_pair("group_children", "0");

        let mut filters = String::from("ht_id=201;ht_id=220");
        if params.min_price.is_some() || params.max_price.is_some() {
            let min = params.min_price.map(|v| format!("{v:.0}")).unwrap_or_else(|| "0".to_string());
            let max = params.max_price.map(|v| format!("{v:.0}")).unwrap_or_else(|| "max".to_string());
            filters.push_str(&format!(";price=XOF-{min}-{max}-1"));
        }
        query.append_pair("nflt", &filters);
        query.append_pair("order", "popularity");
        query.append_pair("selected_currency", "XOF");
        let offset = page.saturating_sub(1) * PAGE_SIZE;
        if offset > 0 {
            query.append_pair("offset", &offset.to_string());
        }
        format!("{SEARCH_URL}?{}", query.finish())
    }

    fn parse_results(&self, html: &str, _page_url: &str) -> Result<Vec<RawListingDraft>, AdapterError> {
        collect_cards(Platform::Booking, &self.profile, html, |card| {
            let href = select_first_attr(card, &self.profile.card_link, &["href"])?;
            let Some(id) = Self::hotel_id(card, href.as_deref()) else {
                return Ok(None);
            };
            let url = format!("{HOTEL_URL}/{id}.fr.html");
            card_fields(Platform::Booking, &self.profile, card, id, Some(url)).map(Some)
        })
    }

    async fn go_to_next_page(
        &self,
        session: &mut dyn PageSession,
        params: &SearchParams,
        current_page: u32,
    ) -> Result<Option<NextPage>, DriverError> {
        let html = session.html()?;
        let document = Html::parse_document(&html);
        let has_next = any_match(document.root_element(), &self.profile.next_page)
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

        let title = select_first_text(root, &detail.title)?;
        let description = select_first_text(root, &detail.description)?
            .map(|text| text.chars().take(MAX_DESCRIPTION).collect::<String>());
        if title.is_none() && description.is_none() {
            return Err(AdapterError::parse(
                Platform::Booking,
                format!("hotel {} detail page carried no listing data", card.external_id),
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
        overlay(&mut listing.latitude, coordinate(html, "b_map_center_latitude", "latitude"));
        overlay(&mut listing.longitude, coordinate(html, "b_map_center_longitude", "longitude"));
        overlay(&mut listing.host_name, select_first_text(root, &detail.host_name)?);

        let mut amenities: Vec<String> = Vec::new();
        for amenity in select_all_texts(root, &detail.amenities)? {
            if amenity.len() < 100 && !amenities.contains(&amenity) {
                amenities.push(amenity);
            }
        }
        amenities.truncate(MAX_AMENITIES);
        if !amenities.is_empty() {
            listing.amenities = amenities;
        }

        let photos: Vec<String> = select_all_attrs(root, &detail.photos, &["src", "data-src"])?
            .into_iter()
            .map(|src| src.replace("max200", "max1024"))
            .take(MAX_PHOTOS)
            .collect();
        if !photos.is_empty() {
            listing.photos = photos;
        }

        let text = root.text().collect::<Vec<_>>().join(" ");
        overlay(&mut listing.bedrooms, count_before(&text, &["chambre", "bedroom"]));
        overlay(&mut listing.bathrooms, count_before(&text, &["salle de bain", "salles de bain", "bathroom"]));
        overlay(&mut listing.max_guests, count_before(&text, &["personne", "guest", "voyageur"]));

        if listing.property_type.is_none() {
            listing.property_type = listing
                .title
                .as_deref()
                .and_then(detect_property_type)
                .map(str::to_string);
        }
        if listing.price.is_some() && listing.currency.is_none() {
            listing.currency = Some("XOF".to_string());
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::SelectorCatalog;

    fn adapter() -> BookingAdapter {
        let catalog = SelectorCatalog::builtin().expect("catalog");
        let profile = catalog.profile(Platform::Booking).expect("profile").clone();
        let check_in = NaiveDate::from_ymd_opt(2026, 11, 2).expect("date");
        BookingAdapter::with_stay(profile, check_in, 5)
    }

    #[test]
    fn destination_ids_cover_known_cities() {
        assert_eq!(destination_id("Dakar"), Some("-2271854"));
        assert_eq!(destination_id("Saint Louis"), Some("-2280036"));
        assert_eq!(destination_id("Thiès"), Some("-2281143"));
        assert_eq!(destination_id("Kaolack"), None);
    }

    #[test]
    fn search_url_carries_stay_and_offset() {
        let url = adapter().build_search_url(&SearchParams::new("Saly", 2), 2);
        assert!(url.starts_with("https://www.booking.com/searchresults.fr.html?ss=Saly%2C+Senegal"));
        assert!(url.contains("dest_id=-2279538"));
        assert!(url.contains("checkin=2026-11-02"));
        assert!(url.contains("checkout=2026-11-07"));
        assert!(url.contains("selected_currency=XOF"));
        assert!(url.ends_with("offset=25"));
    }

    #[test]
    fn hotel_ids_come_from_attribute_or_link() {
        let html = r#"
        <div data-testid="property-card" data-hotelid="778812">
          <a href="/hotel/sn/residence-ngor.fr.html?aid=1">x</a>
          <div data-testid="title">Résidence Ngor</div>
          <div data-testid="price-and-discounted-price">XOF 45 000</div>
          <div data-testid="review-score"><div>8,6</div><div>Très bien</div></div>
        </div>
        <div data-testid="property-card">
          <a href="https://www.booking.com/hotel/sn/villa-saly.fr.html">y</a>
          <div data-testid="title">Villa Saly</div>
        </div>"#;
        let cards = adapter().parse_results(html, SEARCH_URL).expect("parse");
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].external_id, "778812");
        assert_eq!(cards[0].rating, Some(8.6));
        assert_eq!(cards[1].external_id, "villa-saly");
        assert_eq!(
            cards[1].url.as_deref(),
            Some("https://www.booking.com/hotel/sn/villa-saly.fr.html")
        );
    }

    #[test]
    fn detail_page_fields() {
        let card = RawListingDraft {
            platform: Platform::Booking,
            external_id: "villa-saly".into(),
            url: Some("https://www.booking.com/hotel/sn/villa-saly.fr.html".into()),
            title: Some("Villa Saly".into()),
            price_text: Some("XOF 95 000".into()),
            location_text: None,
            photo_url: None,
            rating: Some(9.1),
        };
        let html = r#"<html><body>
          <h2 class="pp-header__title">Villa Saly Plage</h2>
          <div data-testid="property-description">Villa de 3 chambres avec piscine, 6 personnes.</div>
          <span data-testid="address">Saly Portudal, Mbour, Sénégal</span>
          <script>var b_map_center_latitude = 14.4412; var b_map_center_longitude = -17.0099;</script>
          <div data-testid="property-most-popular-facilities-wrapper"><ul><li>Piscine</li><li>WiFi gratuit</li><li>Piscine</li></ul></div>
          <div class="bh-photo-grid"><img src="https://cf.bstatic.com/max200/1.jpg"></div>
        </body></html>"#;
        let listing = adapter().parse_detail(&card, html, Utc::now()).expect("detail");
        assert_eq!(listing.title.as_deref(), Some("Villa Saly Plage"));
        assert_eq!(listing.neighborhood.as_deref(), Some("Saly Portudal"));
        assert_eq!(listing.city.as_deref(), Some("Mbour"));
        assert_eq!(listing.latitude, Some(14.4412));
        assert_eq!(listing.longitude, Some(-17.0099));
        assert_eq!(listing.amenities, vec!["Piscine".to_string(), "WiFi gratuit".to_string()]);
        assert_eq!(listing.photos, vec!["https://cf.bstatic.com/max1024/1.jpg".to_string()]);
        assert_eq!(listing.bedrooms, Some(3));
        assert_eq!(listing.max_guests, Some(6));
        assert_eq!(listing.property_type.as_deref(), Some("villa"));
        assert_eq!(listing.rating, Some(9.1));
        assert_eq!(listing.price, Some(95_000.0));
        assert_eq!(listing.currency.as_deref(), Some("XOF"));
    }
}
