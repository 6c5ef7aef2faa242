//! Platform drivers and the shared crawl loop.

use scraper::{ElementRef, Selector};
use shadowstay_core::Platform;
use thiserror::Error;

pub mod crawler;
pub mod driver;
pub mod platforms;
pub mod selectors;

pub use crawler::{CrawlError, CrawlReport, Crawler, CrawlerConfig, PageOutcome, SearchWalk, StopReason};
pub use driver::{DriverError, FixtureRenderer, HttpRenderer, PageRenderer, PageSession};
pub use platforms::{
    adapter_for_platform, card_listing, default_price_period, parse_price_text, NextPage, ParsedPrice,
    PlatformAdapter,
};
pub use selectors::{SelectorCatalog, SelectorProfile};

pub const CRATE_NAME: &str = "shadowstay-adapters";

/// Failure to extract one card or one detail page. Scoped to that item.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("{platform}: {message}")]
    Parse { platform: Platform, message: String },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl AdapterError {
    pub fn parse(platform: Platform, message: impl Into<String>) -> Self {
        AdapterError::Parse {
            platform,
            message: message.into(),
        }
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

/// Text of the first element matched by the first selector in the chain that
/// yields non-empty text.
pub(crate) fn select_first_text(
    scope: ElementRef<'_>,
    selectors: &[String],
) -> Result<Option<String>, AdapterError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        if let Some(text) = scope.select(&sel).find_map(element_text) {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

pub(crate) fn select_first_attr(
    scope: ElementRef<'_>,
    selectors: &[String],
    attrs: &[&str],
) -> Result<Option<String>, AdapterError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        for el in scope.select(&sel) {
            if let Some(value) = attrs
                .iter()
                .find_map(|attr| el.value().attr(attr))
                .and_then(|v| text_or_none(v.to_string()))
            {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

/// All texts matched by the first selector in the chain that matches anything.
pub(crate) fn select_all_texts(
    scope: ElementRef<'_>,
    selectors: &[String],
) -> Result<Vec<String>, AdapterError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        let texts: Vec<String> = scope.select(&sel).filter_map(element_text).collect();
        if !texts.is_empty() {
            return Ok(texts);
        }
    }
    Ok(Vec::new())
}

pub(crate) fn select_all_attrs(
    scope: ElementRef<'_>,
    selectors: &[String],
    attrs: &[&str],
) -> Result<Vec<String>, AdapterError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        let values: Vec<String> = scope
            .select(&sel)
            .filter_map(|el| attrs.iter().find_map(|attr| el.value().attr(attr)))
            .filter(|v| !v.trim().is_empty() && !v.starts_with("data:"))
            .map(|v| v.trim().to_string())
            .collect();
        if !values.is_empty() {
            return Ok(values);
        }
    }
    Ok(Vec::new())
}

pub(crate) fn any_match(scope: ElementRef<'_>, selectors: &[String]) -> Result<bool, AdapterError> {
    for selector in selectors {
        let sel = parse_selector(selector)?;
        if scope.select(&sel).next().is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Numbers in `text`. A space, non-breaking space or comma followed by exactly
/// three digits is a thousands separator (`30 000`, `12,345`).
pub(crate) fn extract_numbers(text: &str) -> Vec<f64> {
    let Ok(re) = regex::Regex::new(
        r"[0-9]{1,3}(?:[ \x{A0}\x{202F},][0-9]{3}\b)+(?:\.[0-9]+)?|[0-9]+(?:\.[0-9]+)?",
    ) else {
        return Vec::new();
    };
    re.find_iter(text)
        .filter_map(|m| {
            m.as_str()
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect::<String>()
                .parse()
                .ok()
        })
        .collect()
}

/// First unsigned integer directly followed by one of `units`, e.g.
/// `"2 chambres"` for `["chambre"]`.
pub(crate) fn count_before(text: &str, units: &[&str]) -> Option<u32> {
    let pattern = format!(
        r"(?i)(\d{{1,3}})\s*(?:{})",
        units
            .iter()
            .map(|u| regex::escape(u))
            .collect::<Vec<_>>()
            .join("|")
    );
    let re = regex::Regex::new(&pattern).ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Scalar value of `"key": value` inside embedded page JSON.
pub(crate) fn embedded_json_value(html: &str, key: &str) -> Option<String> {
    let pattern = format!(
        r#""{}"\s*:\s*(?:"([^"]*)"|(-?\d+(?:\.\d+)?))"#,
        regex::escape(key)
    );
    let re = regex::Regex::new(&pattern).ok()?;
    let caps = re.captures(html)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_with_thousands_separators() {
        assert_eq!(extract_numbers("30 000 FCFA"), vec![30_000.0]);
        assert_eq!(extract_numbers("XOF 12,345 / nuit"), vec![12_345.0]);
        assert_eq!(extract_numbers("$45.50 night, 2 guests"), vec![45.5, 2.0]);
        assert_eq!(extract_numbers("4.92 (18)"), vec![4.92, 18.0]);
        assert_eq!(extract_numbers("4.92 118 avis"), vec![4.92, 118.0]);
        assert_eq!(extract_numbers("1 250 000 F"), vec![1_250_000.0]);
        assert_eq!(extract_numbers("12 3456 m"), vec![12.0, 3456.0]);
        assert_eq!(extract_numbers("EUR 1,250.50"), vec![1_250.5]);
        assert!(extract_numbers("sur demande").is_empty());
    }

    #[test]
    fn counts_before_units() {
        assert_eq!(count_before("Villa 3 chambres, 2 salles de bain", &["chambre"]), Some(3));
        assert_eq!(count_before("2 Bedrooms", &["bedroom"]), Some(2));
        assert_eq!(count_before("no rooms here", &["bedroom"]), None);
    }

    #[test]
    fn embedded_json_values() {
        let html = r#"{"bedrooms":2,"lat":14.7167,"hostDisplayName":"Awa","hostId":"8812"}"#;
        assert_eq!(embedded_json_value(html, "bedrooms").as_deref(), Some("2"));
        assert_eq!(embedded_json_value(html, "lat").as_deref(), Some("14.7167"));
        assert_eq!(embedded_json_value(html, "hostDisplayName").as_deref(), Some("Awa"));
        assert_eq!(embedded_json_value(html, "hostId").as_deref(), Some("8812"));
        assert_eq!(embedded_json_value(html, "missing"), None);
    }
}
