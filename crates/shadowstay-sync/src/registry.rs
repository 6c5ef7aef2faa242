//! Read-only access to the licensed-property registry.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shadowstay_core::RegisteredProperty;
use shadowstay_storage::HttpFetcher;
use tokio::fs;
use tracing::debug;
use url::form_urlencoded;

use crate::normalize::canonical_city;

#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Active registered properties whose city canonicalizes to `city`.
    async fn active_properties(&self, city: &str) -> Result<Vec<RegisteredProperty>>;
}

fn same_city(property: &RegisteredProperty, wanted: Option<&str>) -> bool {
    match wanted {
        Some(wanted) => canonical_city(&property.city).as_deref() == Some(wanted),
        None => false,
    }
}

/// `GET {base}/properties?city=<city>&status=active` returning a JSON array.
pub struct HttpRegistry {
    base_url: String,
    http: HttpFetcher,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn properties_url(&self, city: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("city", city)
            .append_pair("status", "active")
            .finish();
        format!("{}/properties?{query}", self.base_url)
    }
}

#[async_trait]
impl RegistrySource for HttpRegistry {
    async fn active_properties(&self, city: &str) -> Result<Vec<RegisteredProperty>> {
        let url = self.properties_url(city);
        let rows: Vec<RegisteredProperty> = self
            .http
            .fetch_json(&url)
            .await
            .with_context(|| format!("querying registry for {city}"))?;
        let wanted = canonical_city(city);
        let rows: Vec<_> = rows
            .into_iter()
            .filter(|p| same_city(p, wanted.as_deref()))
            .collect();
        debug!(city, candidates = rows.len(), "registry candidates loaded");
        Ok(rows)
    }
}

/// A JSON array of registered properties on disk, re-read on every query.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RegistrySource for FileRegistry {
    async fn active_properties(&self, city: &str) -> Result<Vec<RegisteredProperty>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "registry file missing; treating registry as empty");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", self.path.display())),
        };
        let rows: Vec<RegisteredProperty> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))?;
        let wanted = canonical_city(city);
        Ok(rows
            .into_iter()
            .filter(|p| same_city(p, wanted.as_deref()))
            .collect())
    }
}

/// In-memory registry for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    properties: Vec<RegisteredProperty>,
}

impl StaticRegistry {
    pub fn new(properties: Vec<RegisteredProperty>) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl RegistrySource for StaticRegistry {
    async fn active_properties(&self, city: &str) -> Result<Vec<RegisteredProperty>> {
        let wanted = canonical_city(city);
        Ok(self
            .properties
            .iter()
            .filter(|p| same_city(p, wanted.as_deref()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use shadowstay_storage::HttpClientConfig;

    use super::*;

    fn property(id: &str, city: &str) -> RegisteredProperty {
        RegisteredProperty {
            id: id.to_string(),
            name: None,
            address: None,
            city: city.to_string(),
            neighborhood: None,
            latitude: None,
            longitude: None,
            property_type: None,
            room_count: None,
            owner_name: None,
            owner_company: None,
        }
    }

    #[tokio::test]
    async fn static_registry_filters_on_canonical_city() {
        let registry = StaticRegistry::new(vec![
            property("R1", "Dakar"),
            property("R2", "dakar"),
            property("R3", "Saly Portudal"),
        ]);
        let dakar = registry.active_properties("DAKAR").await.expect("dakar");
        assert_eq!(dakar.len(), 2);
        let saly = registry.active_properties("Saly").await.expect("saly");
        assert_eq!(saly[0].id, "R3");
    }

    #[tokio::test]
    async fn file_registry_reads_json_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = FileRegistry::new(dir.path().join("none.json"));
        assert!(missing.active_properties("Dakar").await.expect("missing").is_empty());

        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"[{"id":"R1","name":"Villa Teranga","address":"Route des Almadies","city":"Dakar","room_count":4},
                {"id":"R2","name":null,"address":null,"city":"Mbour"}]"#,
        )
        .expect("write");
        let rows = FileRegistry::new(&path).active_properties("Dakar").await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].room_count, Some(4));
    }

    #[test]
    fn http_registry_builds_query() {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let registry = HttpRegistry::new("https://registry.test/api/", http);
        assert_eq!(
            registry.properties_url("Saint-Louis"),
            "https://registry.test/api/properties?city=Saint-Louis&status=active"
        );
    }
}
