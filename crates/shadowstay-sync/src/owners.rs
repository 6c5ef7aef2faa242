//! Multi-property operator detection.
//!
//! Listings are grouped by canonical phone number first; the rest are grouped
//! by `platform:host_id` on platforms that expose stable host ids.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use shadowstay_core::{DetectedOwner, MatchResult, MatchType, OwnerKeyKind, Platform, ScrapedListing};
use uuid::Uuid;

use crate::metrics::nightly_price_xof;
use crate::normalize::normalize_phone;

/// Occupied nights assumed per month (50 % occupancy).
pub const OCCUPIED_NIGHTS_PER_MONTH: f64 = 15.0;

fn host_key(listing: &ScrapedListing) -> Option<String> {
    if !matches!(listing.platform, Platform::Airbnb | Platform::Booking) {
        return None;
    }
    let host_id = listing.host_id.as_deref().map(str::trim).filter(|h| !h.is_empty())?;
    Some(format!("{}:{host_id}", listing.platform))
}

fn build_owner(
    identifier: String,
    key_kind: OwnerKeyKind,
    group: &[&ScrapedListing],
    best: &HashMap<Uuid, MatchResult>,
) -> Option<DetectedOwner> {
    let last_seen_at = group.iter().map(|l| l.last_seen_at).max()?;
    let names: BTreeSet<String> = group
        .iter()
        .filter_map(|l| l.host_name.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    let platforms: BTreeSet<Platform> = group.iter().map(|l| l.platform).collect();
    let unregistered_count = group
        .iter()
        .filter(|l| best.get(&l.id).map_or(true, |m| m.match_type == MatchType::NoMatch))
        .count() as u32;

    let prices: Vec<f64> = group.iter().filter_map(|l| nightly_price_xof(l)).collect();
    let avg_nightly_price = if prices.is_empty() {
        None
    } else {
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    };
    let listing_count = group.len() as u32;

    Some(DetectedOwner {
        identifier,
        key_kind,
        names: names.into_iter().collect(),
        platforms: platforms.into_iter().collect(),
        listing_ids: group.iter().map(|l| l.id).collect(),
        listing_count,
        unregistered_count,
        avg_nightly_price,
        estimated_monthly_revenue: avg_nightly_price
            .map(|avg| (avg * f64::from(listing_count) * OCCUPIED_NIGHTS_PER_MONTH).round()),
        last_seen_at,
    })
}

/// Every phone or host-id group, largest first. Single-listing groups are
/// kept so operators can be tracked before they scale.
pub fn detect_owners(listings: &[ScrapedListing], best: &HashMap<Uuid, MatchResult>) -> Vec<DetectedOwner> {
    let mut by_phone: BTreeMap<String, Vec<&ScrapedListing>> = BTreeMap::new();
    for listing in listings {
        if let Some(phone) = listing.phone().and_then(normalize_phone) {
            by_phone.entry(phone).or_default().push(listing);
        }
    }
    let grouped: HashSet<Uuid> = by_phone.values().flatten().map(|l| l.id).collect();

    let mut by_host: BTreeMap<String, Vec<&ScrapedListing>> = BTreeMap::new();
    for listing in listings.iter().filter(|l| !grouped.contains(&l.id)) {
        if let Some(key) = host_key(listing) {
            by_host.entry(key).or_default().push(listing);
        }
    }

    let mut owners: Vec<DetectedOwner> = by_phone
        .into_iter()
        .filter_map(|(phone, group)| build_owner(phone, OwnerKeyKind::Phone, &group, best))
        .chain(
            by_host
                .into_iter()
                .filter_map(|(key, group)| build_owner(key, OwnerKeyKind::HostId, &group, best)),
        )
        .collect();
    owners.sort_by(|a, b| {
        b.listing_count
            .cmp(&a.listing_count)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
    owners
}
