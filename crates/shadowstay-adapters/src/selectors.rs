//! Versioned per-platform selector profiles.
//!
//! Selectors live in YAML so markup changes on a target site are a config edit.
//! The built-in catalog is compiled in; `SHADOWSTAY_SELECTORS` may point at an
//! override file with the same shape.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use shadowstay_core::Platform;

const BUILTIN_CATALOG: &str = include_str!("../../../config/selectors.yaml");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailSelectors {
    pub title: Vec<String>,
    pub description: Vec<String>,
    pub location: Vec<String>,
    pub host_name: Vec<String>,
    pub amenities: Vec<String>,
    pub photos: Vec<String>,
    pub price: Vec<String>,
    pub phone: Vec<String>,
    pub property_type: Vec<String>,
}

/// Each list is a fallback chain: the first selector that matches wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorProfile {
    pub results_ready: String,
    pub card: Vec<String>,
    pub card_link: Vec<String>,
    pub card_title: Vec<String>,
    pub card_price: Vec<String>,
    pub card_location: Vec<String>,
    pub card_photo: Vec<String>,
    pub card_rating: Vec<String>,
    pub next_page: Vec<String>,
    pub popup_dismiss: Vec<String>,
    pub blocked_resources: Vec<String>,
    pub detail: DetailSelectors,
}

impl SelectorProfile {
    fn all_selectors(&self) -> Vec<(&'static str, &str)> {
        let lists: [(&'static str, &Vec<String>); 18] = [
            ("card", &self.card),
            ("card_link", &self.card_link),
            ("card_title", &self.card_title),
            ("card_price", &self.card_price),
            ("card_location", &self.card_location),
            ("card_photo", &self.card_photo),
            ("card_rating", &self.card_rating),
            ("next_page", &self.next_page),
            ("popup_dismiss", &self.popup_dismiss),
            ("detail.title", &self.detail.title),
            ("detail.description", &self.detail.description),
            ("detail.location", &self.detail.location),
            ("detail.host_name", &self.detail.host_name),
            ("detail.amenities", &self.detail.amenities),
            ("detail.photos", &self.detail.photos),
            ("detail.price", &self.detail.price),
            ("detail.phone", &self.detail.phone),
            ("detail.property_type", &self.detail.property_type),
        ];
        let mut out = vec![("results_ready", self.results_ready.as_str())];
        for (field, list) in lists {
            out.extend(list.iter().map(|s| (field, s.as_str())));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorCatalog {
    pub version: u32,
    #[serde(default)]
    pub updated: Option<String>,
    pub platforms: BTreeMap<Platform, SelectorProfile>,
}

impl SelectorCatalog {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_yaml(BUILTIN_CATALOG).context("parsing built-in selector catalog")
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let catalog: SelectorCatalog = serde_yaml::from_str(yaml)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading selector catalog {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    /// Built-in catalog, or the file at `path` when given.
    pub fn load_or_builtin(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn profile(&self, platform: Platform) -> Option<&SelectorProfile> {
        self.platforms.get(&platform)
    }

    /// Every selector must parse; a typo should fail at startup, not mid-crawl.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (platform, profile) in &self.platforms {
            if profile.results_ready.trim().is_empty() {
                anyhow::bail!("{platform}: results_ready selector is empty");
            }
            if profile.card.is_empty() {
                anyhow::bail!("{platform}: no card selector configured");
            }
            for (field, selector) in profile.all_selectors() {
                Selector::parse(selector).map_err(|err| {
                    anyhow::anyhow!("{platform}.{field}: invalid selector `{selector}`: {err}")
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_covers_every_platform() {
        let catalog = SelectorCatalog::builtin().expect("builtin catalog");
        assert!(catalog.version >= 1);
        for platform in Platform::ALL {
            let profile = catalog.profile(platform).expect("profile");
            assert!(!profile.card.is_empty(), "{platform} has cards");
        }
    }

    #[test]
    fn invalid_selector_is_rejected() {
        let yaml = r#"
version: 1
platforms:
  airbnb:
    results_ready: "div"
    card: ["div[["]
"#;
        let err = SelectorCatalog::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("airbnb.card"));
    }
}
