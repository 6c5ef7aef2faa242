//! Identity matching against the licensed-property registry.
//!
//! Each factor only counts when both sides carry the data it needs; the score
//! is the weighted sum of applicable factors over the sum of their weights.

use chrono::Utc;
use shadowstay_core::{ListingDraft, MatchResult, MatchType, NormalizedListing, RegisteredProperty, ScoreBreakdown};
use strsim::{jaro_winkler, normalized_levenshtein};
use uuid::Uuid;

use crate::normalize::{canonical_city, fold, property_types_compatible};

pub const WEIGHT_GEO: f64 = 0.30;
pub const WEIGHT_ADDRESS: f64 = 0.25;
pub const NEIGHBORHOOD_BONUS: f64 = 0.10;
pub const WEIGHT_HOST: f64 = 0.20;
pub const WEIGHT_PROPERTY_TYPE: f64 = 0.10;
pub const WEIGHT_BEDROOMS: f64 = 0.10;
pub const WEIGHT_TITLE: f64 = 0.05;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const GEO_FULL_CREDIT_M: f64 = 100.0;
const GEO_ZERO_CREDIT_M: f64 = 1_000.0;
const CONTAINMENT_FLOOR: f64 = 0.7;
const NEIGHBORHOOD_THRESHOLD: f64 = 0.7;
const TITLE_THRESHOLD: f64 = 0.5;

/// Great-circle distance in meters.
pub fn haversine_m(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lng1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lng2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlng = lng2 - lng1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// 1.0 within 100 m, falling linearly to 0.0 at 1 km.
pub fn geo_score(distance_m: f64) -> f64 {
    if distance_m <= GEO_FULL_CREDIT_M {
        1.0
    } else if distance_m >= GEO_ZERO_CREDIT_M {
        0.0
    } else {
        1.0 - (distance_m - GEO_FULL_CREDIT_M) / (GEO_ZERO_CREDIT_M - GEO_FULL_CREDIT_M)
    }
}

/// `1 - levenshtein / max_len` over folded text; one string containing the
/// other scores at least 0.7.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (fold(a), fold(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let score = normalized_levenshtein(&a, &b);
    if a.contains(&b) || b.contains(&a) {
        score.max(CONTAINMENT_FLOOR)
    } else {
        score
    }
}

fn name_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (fold(a), fold(b));
    if a.is_empty() || b.is_empty() {
        0.0
    } else {
        jaro_winkler(&a, &b)
    }
}

fn bedroom_score(listing: u32, registry: u32) -> f64 {
    match listing.abs_diff(registry) {
        0 => 1.0,
        1 => 0.5,
        _ => 0.0,
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    numerator: f64,
    weights: f64,
}

impl Accumulator {
    fn add(&mut self, weight: f64, score: f64) {
        self.numerator += weight * score;
        self.weights += weight;
    }

    fn score(&self) -> f64 {
        if self.weights <= 0.0 {
            0.0
        } else {
            (self.numerator / self.weights).clamp(0.0, 1.0)
        }
    }
}

/// Score one listing against one registry candidate.
pub fn score_candidate(listing: &ListingDraft, candidate: &RegisteredProperty) -> (f64, ScoreBreakdown) {
    let mut acc = Accumulator::default();
    let mut breakdown = ScoreBreakdown::default();

    if let (Some(lat), Some(lng), Some(there)) = (listing.latitude, listing.longitude, candidate.coordinates()) {
        let distance = haversine_m((lat, lng), there);
        let score = geo_score(distance);
        breakdown.distance_m = Some(distance);
        breakdown.geo = Some(score);
        acc.add(WEIGHT_GEO, score);
    }

    let listing_address = listing.location_text.as_deref().or(listing.neighborhood.as_deref());
    if let (Some(ours), Some(theirs)) = (listing_address, candidate.address.as_deref()) {
        let score = text_similarity(ours, theirs);
        breakdown.address = Some(score);
        acc.add(WEIGHT_ADDRESS, score);
    }
    if let (Some(ours), Some(theirs)) = (listing.neighborhood.as_deref(), candidate.neighborhood.as_deref()) {
        if text_similarity(ours, theirs) > NEIGHBORHOOD_THRESHOLD {
            breakdown.neighborhood_bonus = true;
            acc.numerator += NEIGHBORHOOD_BONUS;
        }
    }

    if let Some(host) = listing.host_name.as_deref() {
        let best = [candidate.owner_name.as_deref(), candidate.owner_company.as_deref()]
            .into_iter()
            .flatten()
            .map(|name| name_similarity(host, name))
            .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));
        if let Some(score) = best {
            breakdown.host = Some(score);
            acc.add(WEIGHT_HOST, score);
        }
    }

    if let (Some(ours), Some(theirs)) = (listing.property_type.as_deref(), candidate.property_type.as_deref()) {
        let score = if property_types_compatible(ours, theirs) { 1.0 } else { 0.0 };
        breakdown.property_type = Some(score);
        acc.add(WEIGHT_PROPERTY_TYPE, score);
    }

    if let (Some(ours), Some(theirs)) = (listing.bedrooms, candidate.room_count) {
        let score = bedroom_score(ours, theirs);
        breakdown.bedrooms = Some(score);
        acc.add(WEIGHT_BEDROOMS, score);
    }

    if let (Some(title), Some(name)) = (listing.title.as_deref(), candidate.name.as_deref()) {
        let score = text_similarity(title, name);
        if score > TITLE_THRESHOLD {
            breakdown.title = Some(score);
            acc.add(WEIGHT_TITLE, score);
        }
    }

    (acc.score(), breakdown)
}

#[derive(Debug, Clone)]
pub struct IdentityMatcher {
    /// Candidates at or below this score are discarded.
    pub floor: f64,
    pub max_results: usize,
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self {
            floor: 0.2,
            max_results: 5,
        }
    }
}

impl IdentityMatcher {
    /// Up to `max_results` matches, best first, among registry candidates in
    /// `city`. When no candidate classifies above `no_match` the result is a
    /// single `no_match` without a property id.
    pub fn match_listing(
        &self,
        listing_id: Uuid,
        listing: &NormalizedListing,
        city: &str,
        candidates: &[RegisteredProperty],
    ) -> Vec<MatchResult> {
        let matched_at = Utc::now();
        let wanted = canonical_city(city);
        let mut scored: Vec<(f64, ScoreBreakdown, &RegisteredProperty)> = candidates
            .iter()
            .filter(|c| wanted.is_some() && canonical_city(&c.city) == wanted)
            .map(|c| {
                let (score, breakdown) = score_candidate(&listing.listing, c);
                (score, breakdown, c)
            })
            .filter(|(score, _, _)| *score > self.floor)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.max_results);

        let best_score = scored.first().map(|(s, _, _)| *s).unwrap_or(0.0);
        if MatchType::from_score(best_score) == MatchType::NoMatch {
            let breakdown = scored.into_iter().next().map(|(_, b, _)| b).unwrap_or_default();
            return vec![MatchResult {
                scraped_listing_id: listing_id,
                registered_property_id: None,
                match_type: MatchType::NoMatch,
                match_score: best_score,
                breakdown,
                matched_at,
            }];
        }

        scored
            .into_iter()
            .map(|(score, breakdown, candidate)| MatchResult {
                scraped_listing_id: listing_id,
                registered_property_id: Some(candidate.id.clone()),
                match_type: MatchType::from_score(score),
                match_score: score,
                breakdown,
                matched_at,
            })
            .collect()
    }
}
