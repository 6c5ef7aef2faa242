//! Normalization pipeline: platform drafts into one canonical shape.
//!
//! [`normalize`] is pure and idempotent. Lookups fold case, accents and
//! separators, and every canonical value maps back to itself.

use serde_json::Value as JsonValue;
use shadowstay_core::{ListingDraft, NormalizedListing, Platform, PricePeriod};

pub const MAX_PHOTOS: usize = 20;
pub const MAX_AMENITIES: usize = 30;
const DAYS_PER_MONTH: f64 = 30.0;

/// `(canonical city, region, aliases)`.
const CITIES: &[(&str, &str, &[&str])] = &[
    ("Dakar", "Dakar", &["dakar", "dkr", "dakar senegal"]),
    ("Rufisque", "Dakar", &["rufisque"]),
    ("Saint-Louis", "Saint-Louis", &["saint louis", "st louis", "ndar"]),
    ("Saly", "Thiès", &["saly", "saly portudal", "saly niakhniakhal"]),
    ("Mbour", "Thiès", &["mbour", "m bour"]),
    ("Somone", "Thiès", &["somone", "la somone"]),
    ("Popenguine", "Thiès", &["popenguine"]),
    ("Thiès", "Thiès", &["thies"]),
    ("Ziguinchor", "Ziguinchor", &["ziguinchor"]),
    ("Cap Skirring", "Ziguinchor", &["cap skirring"]),
    ("Kaolack", "Kaolack", &["kaolack"]),
    ("Touba", "Diourbel", &["touba"]),
];

/// Neighborhoods folded into their parent city: `(neighborhood, city)`.
const NEIGHBORHOODS: &[(&str, &str)] = &[
    ("Almadies", "Dakar"),
    ("Ngor", "Dakar"),
    ("Ouakam", "Dakar"),
    ("Yoff", "Dakar"),
    ("Mermoz", "Dakar"),
    ("Sacré-Coeur", "Dakar"),
    ("Plateau", "Dakar"),
    ("Médina", "Dakar"),
    ("Fann", "Dakar"),
    ("Point E", "Dakar"),
    ("Mamelles", "Dakar"),
    ("Liberté", "Dakar"),
    ("Sicap", "Dakar"),
    ("Hann", "Dakar"),
    ("Parcelles Assainies", "Dakar"),
    ("Grand Dakar", "Dakar"),
    ("HLM", "Dakar"),
    ("Virage", "Dakar"),
    ("Hydrobase", "Saint-Louis"),
    ("Île de Saint-Louis", "Saint-Louis"),
];

/// `(canonical type, synonyms)`; canonical names are their own synonyms.
const PROPERTY_TYPES: &[(&str, &[&str])] = &[
    ("apartment", &[
        "apartment", "appartement", "appart", "flat", "condo", "condominium", "loft",
        "entire home", "entire rental unit", "entire apartment", "entire condo",
        "logement entier", "serviced apartment", "appartement meuble", "f2", "f3", "f4",
    ]),
    ("villa", &["villa", "entire villa", "villa entiere"]),
    ("house", &["house", "maison", "home", "entire house", "cottage", "bungalow", "townhouse", "case"]),
    ("studio", &["studio", "studette"]),
    ("room", &["room", "chambre", "private room", "chambre privee", "shared room", "chambre partagee"]),
    ("hotel", &["hotel", "boutique hotel", "resort", "aparthotel", "residence hoteliere"]),
    ("guesthouse", &[
        "guesthouse", "guest house", "maison d hotes", "auberge", "bed and breakfast", "b b",
        "lodge", "campement", "hostel",
    ]),
];

/// Types that may describe the same physical property.
const COMPATIBLE_TYPES: &[(&str, &str)] = &[
    ("apartment", "studio"),
    ("house", "villa"),
    ("hotel", "guesthouse"),
];

const AMENITIES: &[(&str, &[&str])] = &[
    ("wifi", &["wifi", "wi fi", "internet", "free wifi", "wifi gratuit", "connexion wifi", "wireless internet"]),
    ("air_conditioning", &["air conditioning", "climatisation", "clim", "air conditionne", "ac"]),
    ("pool", &["pool", "piscine", "swimming pool", "private pool", "piscine privee", "piscine exterieure"]),
    ("parking", &["parking", "free parking", "parking gratuit", "garage", "free parking on premises"]),
    ("kitchen", &["kitchen", "cuisine", "cuisine equipee", "kitchenette"]),
    ("washer", &["washer", "washing machine", "lave linge", "machine a laver"]),
    ("tv", &["tv", "television", "smart tv", "hdtv"]),
    ("hot_water", &["hot water", "eau chaude"]),
    ("security", &["security", "gardien", "securite", "guard", "24h security", "gardiennage"]),
    ("generator", &["generator", "groupe electrogene"]),
    ("balcony", &["balcony", "balcon", "terrace", "terrasse", "patio"]),
    ("sea_view", &["sea view", "ocean view", "vue mer", "vue sur la mer", "vue sur mer"]),
    ("beach_access", &["beach access", "beachfront", "acces plage", "pieds dans l eau", "bord de mer"]),
    ("garden", &["garden", "jardin"]),
    ("breakfast", &["breakfast", "petit dejeuner", "petit dejeuner inclus"]),
    ("elevator", &["elevator", "lift", "ascenseur"]),
];

/// UI fragments scraped alongside amenity lists.
const AMENITY_NOISE: &[&str] = &[
    "show all", "afficher", "voir", "unavailable", "indisponible", "non disponible",
    "not included", "report", "signaler", "more", "plus d",
];

/// Lowercase, strip French accents and fold separators to single spaces.
pub fn fold(text: &str) -> String {
    let mapped: String = text
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'à' | 'â' | 'ä' | 'á' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' | 'í' => 'i',
            'ô' | 'ö' | 'ó' => 'o',
            'ù' | 'û' | 'ü' | 'ú' => 'u',
            'ç' => 'c',
            '-' | '_' | '\'' | '’' | '&' | '/' | '.' => ' ',
            other => other,
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapse(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut start = true;
    for c in text.chars() {
        if start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        start = c == ' ' || c == '-';
    }
    out
}

fn lookup_city(text: &str) -> Option<(&'static str, &'static str)> {
    let key = fold(text);
    CITIES
        .iter()
        .find(|(name, _, aliases)| fold(name) == key || aliases.contains(&key.as_str()))
        .map(|(name, region, _)| (*name, *region))
}

fn lookup_neighborhood(text: &str) -> Option<(&'static str, &'static str)> {
    let key = fold(text);
    NEIGHBORHOODS
        .iter()
        .find(|(name, _)| fold(name) == key)
        .copied()
}

/// Region of a canonical or aliased city.
pub fn region_for(city: &str) -> Option<&'static str> {
    lookup_city(city).map(|(_, region)| region)
}

/// Canonical city name, or the title-cased input when the city is unknown.
pub fn canonical_city(city: &str) -> Option<String> {
    let trimmed = collapse(city)?;
    if let Some((name, _)) = lookup_city(&trimmed) {
        return Some(name.to_string());
    }
    if let Some((_, parent)) = lookup_neighborhood(&trimmed) {
        return Some(parent.to_string());
    }
    Some(title_case(&trimmed))
}

/// Canonical property type; unknown labels come back folded.
pub fn canonical_property_type(label: &str) -> Option<String> {
    let key = fold(label);
    if key.is_empty() {
        return None;
    }
    if let Some((kind, _)) = PROPERTY_TYPES
        .iter()
        .find(|(kind, synonyms)| *kind == key || synonyms.contains(&key.as_str()))
    {
        return Some(kind.to_string());
    }
    // Longest synonym contained in the label, e.g. "private room in villa".
    let padded = format!(" {key} ");
    PROPERTY_TYPES
        .iter()
        .flat_map(|(kind, synonyms)| synonyms.iter().map(move |s| (*kind, *s)))
        .filter(|(_, synonym)| padded.contains(&format!(" {synonym} ")))
        .max_by_key(|(_, synonym)| synonym.len())
        .map(|(kind, _)| kind.to_string())
        .or(Some(key))
}

/// Whether two property-type labels may describe the same property.
pub fn property_types_compatible(a: &str, b: &str) -> bool {
    let (Some(a), Some(b)) = (canonical_property_type(a), canonical_property_type(b)) else {
        return false;
    };
    a == b
        || COMPATIBLE_TYPES
            .iter()
            .any(|(x, y)| (a == *x && b == *y) || (a == *y && b == *x))
}

/// `+221XXXXXXXXX`, or `None` when the number is not a Senegalese mobile or
/// landline (9 national digits starting with 7 or 3).
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let national = if let Some(rest) = digits.strip_prefix("00221") {
        rest
    } else if let Some(rest) = digits.strip_prefix("221") {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits.as_str()
    };
    if national.len() == 9 && (national.starts_with('7') || national.starts_with('3')) {
        Some(format!("+221{national}"))
    } else {
        None
    }
}

fn canonical_amenity(raw: &str) -> Option<String> {
    let key = fold(raw);
    if key.is_empty() || key.len() > 60 {
        return None;
    }
    let padded = format!(" {key} ");
    if AMENITY_NOISE.iter().any(|noise| padded.contains(&format!(" {noise}"))) {
        return None;
    }
    let canonical = AMENITIES
        .iter()
        .find(|(name, synonyms)| fold(name) == key || synonyms.contains(&key.as_str()))
        .map(|(name, _)| name.to_string());
    Some(canonical.unwrap_or(key))
}

pub fn normalize_amenities(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for amenity in raw.iter().filter_map(|a| canonical_amenity(a)) {
        if !out.contains(&amenity) {
            out.push(amenity);
        }
        if out.len() == MAX_AMENITIES {
            break;
        }
    }
    out
}

fn valid_coordinates(lat: Option<f64>, lng: Option<f64>) -> (Option<f64>, Option<f64>) {
    match (lat, lng) {
        (Some(lat), Some(lng))
            if lat.is_finite()
                && lng.is_finite()
                && (-90.0..=90.0).contains(&lat)
                && (-180.0..=180.0).contains(&lng)
                && !(lat == 0.0 && lng == 0.0) =>
        {
            (Some(lat), Some(lng))
        }
        _ => (None, None),
    }
}

fn canonical_currency(currency: &str) -> Option<String> {
    let upper = currency.trim().to_uppercase();
    match upper.as_str() {
        "" => None,
        "FCFA" | "CFA" | "F CFA" | "XOF" => Some("XOF".to_string()),
        "€" | "EUR" => Some("EUR".to_string()),
        "$" | "USD" => Some("USD".to_string()),
        _ => Some(upper),
    }
}

const QUALITY_WEIGHTS: &[(&str, u8)] = &[
    ("title", 10),
    ("description", 10),
    ("price", 15),
    ("city", 5),
    ("neighborhood", 5),
    ("coordinates", 15),
    ("host", 10),
    ("property_type", 5),
    ("bedrooms", 5),
    ("photos", 10),
    ("amenities", 5),
    ("rating", 5),
];

/// Completeness score in 0..=100 from a fixed field-weight table.
pub fn quality_score(listing: &ListingDraft) -> u8 {
    let present = |field: &str| match field {
        "title" => listing.title.is_some(),
        "description" => listing.description.is_some(),
        "price" => listing.price.is_some(),
        "city" => listing.city.is_some(),
        "neighborhood" => listing.neighborhood.is_some(),
        "coordinates" => listing.latitude.is_some() && listing.longitude.is_some(),
        "host" => listing.host_name.is_some() || listing.host_id.is_some() || listing.phone.is_some(),
        "property_type" => listing.property_type.is_some(),
        "bedrooms" => listing.bedrooms.is_some(),
        "photos" => !listing.photos.is_empty(),
        "amenities" => !listing.amenities.is_empty(),
        "rating" => listing.rating.is_some(),
        _ => false,
    };
    let score: u32 = QUALITY_WEIGHTS
        .iter()
        .filter(|(field, _)| present(field))
        .map(|(_, weight)| u32::from(*weight))
        .sum();
    score.min(100) as u8
}

fn resolve_location(listing: &mut ListingDraft) {
    let mut candidates: Vec<String> = Vec::new();
    candidates.extend(listing.city.clone());
    if let Some(text) = &listing.location_text {
        candidates.extend(text.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string));
    }
    candidates.extend(listing.neighborhood.clone());

    let known_city = candidates.iter().find_map(|c| lookup_city(c));
    let known_neighborhood = candidates.iter().find_map(|c| lookup_neighborhood(c));

    match (known_city, known_neighborhood) {
        (Some((city, _)), _) => listing.city = Some(city.to_string()),
        (None, Some((_, parent))) => listing.city = Some(parent.to_string()),
        (None, None) => listing.city = listing.city.as_deref().and_then(canonical_city),
    }
    if let Some((name, parent)) = known_neighborhood {
        if listing.city.as_deref() == Some(parent) && listing.neighborhood.is_none() {
            listing.neighborhood = Some(name.to_string());
        }
    }
    if let Some(name) = listing.neighborhood.take() {
        listing.neighborhood = match lookup_neighborhood(&name) {
            Some((canonical, _)) => Some(canonical.to_string()),
            None => collapse(&name),
        };
    }
    if let Some(region) = listing.city.as_deref().and_then(region_for) {
        listing
            .extras
            .insert("region".to_string(), JsonValue::String(region.to_string()));
    }
}

fn normalize_price(listing: &mut ListingDraft) {
    listing.currency = listing.currency.as_deref().and_then(canonical_currency);
    match listing.price {
        Some(price) if price.is_finite() && price > 0.0 => {
            if listing.price_period == PricePeriod::Month {
                listing
                    .extras
                    .insert("price_frequency".to_string(), JsonValue::String("monthly".to_string()));
                listing
                    .extras
                    .insert("original_price".to_string(), JsonValue::from(price));
                let nightly = (price / DAYS_PER_MONTH).round();
                // A rent that rounds to nothing per night is not a price.
                listing.price = (nightly >= 1.0).then_some(nightly);
                listing.price_period = PricePeriod::Night;
            }
        }
        _ => listing.price = None,
    }
}

fn normalize_rating(listing: &mut ListingDraft) {
    let Some(rating) = listing.rating.filter(|r| r.is_finite() && *r >= 0.0) else {
        listing.rating = None;
        return;
    };
    let ten_point = !listing.extras.contains_key("rating_scale")
        && (listing.platform == Platform::Booking || rating > 5.0);
    if ten_point {
        listing.rating = Some(((rating / 2.0) * 100.0).round() / 100.0);
        listing
            .extras
            .insert("rating_scale".to_string(), JsonValue::from(10));
    } else {
        listing.rating = Some(rating.min(5.0));
    }
}

pub fn normalize(draft: ListingDraft) -> NormalizedListing {
    let mut listing = draft;
    listing.external_id = listing.external_id.trim().to_string();
    listing.title = listing.title.as_deref().and_then(collapse);
    listing.description = listing.description.as_deref().and_then(collapse);
    listing.location_text = listing.location_text.as_deref().and_then(collapse);
    listing.host_name = listing.host_name.as_deref().and_then(collapse);
    listing.host_id = listing.host_id.as_deref().and_then(collapse);
    listing.city = listing.city.as_deref().and_then(collapse);
    listing.neighborhood = listing.neighborhood.as_deref().and_then(collapse);

    resolve_location(&mut listing);
    listing.property_type = listing.property_type.as_deref().and_then(canonical_property_type);
    normalize_price(&mut listing);
    listing.phone = listing.phone.as_deref().and_then(normalize_phone);
    listing.amenities = normalize_amenities(&listing.amenities);

    let mut photos: Vec<String> = Vec::new();
    for photo in listing.photos.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if photos.len() == MAX_PHOTOS {
            break;
        }
        if !photos.iter().any(|p| p == photo) {
            photos.push(photo.to_string());
        }
    }
    listing.photos = photos;

    let (lat, lng) = valid_coordinates(listing.latitude, listing.longitude);
    listing.latitude = lat;
    listing.longitude = lng;
    normalize_rating(&mut listing);

    let quality_score = quality_score(&listing);
    NormalizedListing {
        listing,
        quality_score,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn draft() -> ListingDraft {
        let mut d = ListingDraft::new(Platform::Booking, " 778812 ", Utc::now());
        d.title = Some("  Villa   Saly Plage ".into());
        d.city = Some("saly portudal".into());
        d.location_text = Some("Saly Portudal, Mbour, Sénégal".into());
        d.property_type = Some("Entire villa".into());
        d.price = Some(90_000.0);
        d.currency = Some("fcfa".into());
        d.price_period = PricePeriod::Month;
        d.phone = Some("077 123 45 67".into());
        d.amenities = vec![
            "Piscine".into(),
            "Pool".into(),
            "WiFi gratuit".into(),
            "Show all 34 amenities".into(),
            "Groupe électrogène".into(),
        ];
        d.rating = Some(8.6);
        d.latitude = Some(14.44);
        d.longitude = Some(-17.01);
        d
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize(draft());
        let twice = normalize(once.listing.clone());
        assert_eq!(once, twice);

        let mut sparse = ListingDraft::new(Platform::ExpatDakar, "1", Utc::now());
        sparse.neighborhood = Some("almadies".into());
        sparse.property_type = Some("chambre privée dans villa".into());
        let once = normalize(sparse);
        assert_eq!(normalize(once.listing.clone()), once);
    }

    #[test]
    fn normalization_is_idempotent_for_price_edge_cases() {
        let prices = [
            None,
            Some(0.0),
            Some(-250.0),
            Some(0.4),
            Some(10.0),
            Some(14.9),
            Some(15.0),
            Some(29_999.0),
            Some(1.0e15),
            Some(f64::NAN),
            Some(f64::INFINITY),
        ];
        let currencies = [None, Some("fcfa"), Some("F CFA"), Some("€"), Some(" usd "), Some("gbp"), Some("")];
        for platform in Platform::ALL {
            for price in prices {
                for period in [PricePeriod::Night, PricePeriod::Month] {
                    for currency in currencies {
                        let mut d = ListingDraft::new(platform, "edge", Utc::now());
                        d.price = price;
                        d.price_period = period;
                        d.currency = currency.map(str::to_string);
                        d.rating = Some(8.0);
                        let once = normalize(d);
                        let twice = normalize(once.listing.clone());
                        assert_eq!(
                            once, twice,
                            "{platform} price={price:?} period={period:?} currency={currency:?}"
                        );
                        if let Some(p) = once.listing.price {
                            assert!(p.is_finite() && p > 0.0, "{platform} kept price {p}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn monthly_rent_under_half_a_night_is_dropped() {
        let mut d = ListingDraft::new(Platform::ExpatDakar, "6", Utc::now());
        d.price = Some(10.0);
        d.currency = Some("EUR".into());
        d.price_period = PricePeriod::Month;
        let once = normalize(d);
        assert_eq!(once.listing.price, None);
        assert_eq!(once.listing.price_period, PricePeriod::Night);
        assert_eq!(
            once.listing.extras.get("price_frequency").and_then(JsonValue::as_str),
            Some("monthly")
        );
        assert_eq!(normalize(once.listing.clone()).quality_score, once.quality_score);
    }

    #[test]
    fn canonical_fields() {
        let n = normalize(draft()).listing;
        assert_eq!(n.external_id, "778812");
        assert_eq!(n.title.as_deref(), Some("Villa Saly Plage"));
        assert_eq!(n.city.as_deref(), Some("Saly"));
        assert_eq!(n.extras.get("region").and_then(JsonValue::as_str), Some("Thiès"));
        assert_eq!(n.property_type.as_deref(), Some("villa"));
        assert_eq!(n.currency.as_deref(), Some("XOF"));
        assert_eq!(n.price, Some(3_000.0));
        assert_eq!(n.price_period, PricePeriod::Night);
        assert_eq!(n.extras.get("price_frequency").and_then(JsonValue::as_str), Some("monthly"));
        assert_eq!(n.phone.as_deref(), Some("+221771234567"));
        assert_eq!(n.amenities, vec!["pool", "wifi", "generator"]);
        assert_eq!(n.rating, Some(4.3));
    }

    #[test]
    fn monthly_price_becomes_nightly() {
        let mut d = ListingDraft::new(Platform::ExpatDakar, "2", Utc::now());
        d.price = Some(30_000.0);
        d.price_period = PricePeriod::Month;
        assert_eq!(normalize(d).listing.price, Some(1_000.0));
    }

    #[test]
    fn phone_shapes() {
        for raw in ["221771234567", "+221 77 123 45 67", "077 123 45 67"] {
            assert_eq!(normalize_phone(raw).as_deref(), Some("+221771234567"), "{raw}");
        }
        assert_eq!(normalize_phone("00221 33 821 00 00").as_deref(), Some("+221338210000"));
        assert_eq!(normalize_phone("+33 6 12 34 56 78"), None);
        assert_eq!(normalize_phone("12345"), None);
    }

    #[test]
    fn neighborhoods_fold_into_their_city() {
        let mut d = ListingDraft::new(Platform::Airbnb, "3", Utc::now());
        d.city = Some("Almadies".into());
        let n = normalize(d).listing;
        assert_eq!(n.city.as_deref(), Some("Dakar"));
        assert_eq!(n.neighborhood.as_deref(), Some("Almadies"));
        assert_eq!(canonical_city("kaffrine").as_deref(), Some("Kaffrine"));
    }

    #[test]
    fn out_of_range_coordinates_are_dropped() {
        let mut d = ListingDraft::new(Platform::Airbnb, "4", Utc::now());
        d.latitude = Some(114.7);
        d.longitude = Some(-17.4);
        let n = normalize(d).listing;
        assert_eq!((n.latitude, n.longitude), (None, None));
    }

    #[test]
    fn property_type_synonyms() {
        assert_eq!(canonical_property_type("Entire rental unit").as_deref(), Some("apartment"));
        assert_eq!(canonical_property_type("Private room in villa").as_deref(), Some("room"));
        assert!(property_types_compatible("Appartement", "studio"));
        assert!(property_types_compatible("Maison", "Villa"));
        assert!(!property_types_compatible("hotel", "apartment"));
    }

    #[test]
    fn quality_score_weights() {
        let empty = ListingDraft::new(Platform::Airbnb, "5", Utc::now());
        assert_eq!(quality_score(&empty), 0);
        assert_eq!(normalize(draft()).quality_score, 10 + 15 + 5 + 15 + 10 + 5 + 5 + 5);
    }
}
