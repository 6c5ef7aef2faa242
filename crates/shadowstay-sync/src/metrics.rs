//! Market rollup over active listings and their best registry match.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use shadowstay_core::{MarketMetrics, MatchResult, MatchType, PriceDistribution, ScrapedListing};
use uuid::Uuid;

/// Fixed XOF/EUR parity.
pub const XOF_PER_EUR: f64 = 655.957;

/// Nightly price in XOF; `None` for other currencies.
pub fn nightly_price_xof(listing: &ScrapedListing) -> Option<f64> {
    let price = listing.price.filter(|p| p.is_finite() && *p > 0.0)?;
    match listing.currency.as_deref() {
        Some("XOF") | None => Some(price),
        Some("EUR") => Some((price * XOF_PER_EUR).round()),
        Some(_) => None,
    }
}

fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Linear-interpolated quartiles over positive finite prices.
pub fn price_distribution(prices: impl IntoIterator<Item = f64>) -> PriceDistribution {
    let mut sorted: Vec<f64> = prices
        .into_iter()
        .filter(|p| p.is_finite() && *p > 0.0)
        .collect();
    sorted.sort_by(f64::total_cmp);
    if sorted.is_empty() {
        return PriceDistribution::default();
    }
    let sum: f64 = sorted.iter().sum();
    PriceDistribution {
        count: sorted.len() as u64,
        min: sorted.first().copied(),
        max: sorted.last().copied(),
        mean: Some(sum / sorted.len() as f64),
        median: percentile(&sorted, 0.5),
        p25: percentile(&sorted, 0.25),
        p75: percentile(&sorted, 0.75),
    }
}

/// A listing counts toward the period when it was live at some point inside
/// it: first seen on or before the end, last seen on or after the start.
pub fn live_during(listing: &ScrapedListing, start: NaiveDate, end: NaiveDate) -> bool {
    listing.is_active
        && listing.first_seen_at.date_naive() <= end
        && listing.last_seen_at.date_naive() >= start
}

pub fn compute_market_metrics(
    city: &str,
    period_start: NaiveDate,
    period_end: NaiveDate,
    listings: &[ScrapedListing],
    best: &HashMap<Uuid, MatchResult>,
    computed_at: DateTime<Utc>,
) -> MarketMetrics {
    let live: Vec<&ScrapedListing> = listings
        .iter()
        .filter(|l| live_during(l, period_start, period_end))
        .collect();

    let mut registered = 0u64;
    let mut unregistered = 0u64;
    let mut property_types: BTreeMap<String, u64> = BTreeMap::new();
    let mut platforms: BTreeMap<String, u64> = BTreeMap::new();
    for listing in &live {
        match best.get(&listing.id).map(|m| m.match_type) {
            Some(kind) if kind.is_registered() => registered += 1,
            Some(MatchType::NoMatch) | None => unregistered += 1,
            Some(_) => {}
        }
        let kind = listing.property_type.clone().unwrap_or_else(|| "unknown".to_string());
        *property_types.entry(kind).or_default() += 1;
        *platforms.entry(listing.platform.as_str().to_string()).or_default() += 1;
    }

    let total = live.len() as u64;
    MarketMetrics {
        period_start,
        period_end,
        city: city.to_string(),
        total_listings: total,
        registered_listings: registered,
        unregistered_listings: unregistered,
        compliance_rate: if total == 0 {
            0.0
        } else {
            registered as f64 / total as f64
        },
        nightly_price: price_distribution(live.iter().filter_map(|l| nightly_price_xof(l))),
        property_types,
        platforms,
        computed_at,
    }
}
