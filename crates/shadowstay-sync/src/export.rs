//! Run reports and parquet snapshots.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shadowstay_core::{BatchJob, MatchResult, ScrapedListing};
use tokio::fs;
use uuid::Uuid;

use crate::jobs::ScrapeRun;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

/// Write `<dir>/<id>/run.json` and `<dir>/<id>/brief.md`.
pub async fn write_run_report<T: Serialize>(dir: &Path, id: Uuid, record: &T, brief: &str) -> Result<PathBuf> {
    let report_dir = dir.join(id.to_string());
    fs::create_dir_all(&report_dir)
        .await
        .with_context(|| format!("creating {}", report_dir.display()))?;
    let json = serde_json::to_vec_pretty(record).context("serializing run record")?;
    fs::write(report_dir.join("run.json"), json)
        .await
        .context("writing run.json")?;
    fs::write(report_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;
    Ok(report_dir)
}

pub fn scrape_brief(run: &ScrapeRun) -> String {
    let job = &run.job;
    let mut brief = format!(
        "# Scrape run\n\n- Job ID: `{}`\n- Platform: {}\n- City: {}\n- Status: {}\n- Pages visited: {}\n- Started: {}\n- Finished: {}\n\n## Counters\n- Found: {}\n- New: {}\n- Updated: {}\n- Detail failures: {}\n- Persist failures: {}\n",
        job.id,
        job.platform,
        job.params.city,
        job.status.as_str(),
        run.pages_visited,
        job.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        job.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        job.counters.listings_found,
        job.counters.listings_new,
        job.counters.listings_updated,
        job.counters.detail_failures,
        job.counters.persist_failures,
    );
    if let Some(error) = &job.error_message {
        brief.push_str(&format!("\n## Error\n{error}\n"));
    }
    brief
}

pub fn batch_brief(job: &BatchJob) -> String {
    format!(
        "# Batch run\n\n- Job ID: `{}`\n- Platform: {}\n- City: {}\n- Status: {}\n- Pages completed: {} of {}\n- Created: {}\n- Updated: {}\n\n## Counters\n- Found: {}\n- New: {}\n- Updated: {}\n- Detail failures: {}\n- Persist failures: {}\n",
        job.id,
        job.platform,
        job.params.city,
        job.status.as_str(),
        job.pages_completed(),
        job.params.max_pages,
        job.created_at.to_rfc3339(),
        job.updated_at.to_rfc3339(),
        job.counters.listings_found,
        job.counters.listings_new,
        job.counters.listings_updated,
        job.counters.detail_failures,
        job.counters.persist_failures,
    )
}

/// `listings.parquet`, `matches.parquet` and `manifest.json` under `dir`.
pub async fn export_snapshot(
    dir: &Path,
    listings: &[ScrapedListing],
    matches: &[MatchResult],
) -> Result<ExportManifest> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let listings_path = dir.join("listings.parquet");
    let matches_path = dir.join("matches.parquet");
    write_listings_parquet(&listings_path, listings)?;
    write_matches_parquet(&matches_path, matches)?;

    let manifest = ExportManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("listings", dir, &listings_path, listings.len())?,
            manifest_entry("matches", dir, &matches_path, matches.len())?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, listings: &[ScrapedListing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("platform", DataType::Utf8, false),
        ArrowField::new("external_id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("neighborhood", DataType::Utf8, true),
        ArrowField::new("property_type", DataType::Utf8, true),
        ArrowField::new("price", DataType::Float64, true),
        ArrowField::new("currency", DataType::Utf8, true),
        ArrowField::new("bedrooms", DataType::UInt32, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("host_name", DataType::Utf8, true),
        ArrowField::new("phone", DataType::Utf8, true),
        ArrowField::new("quality_score", DataType::UInt32, false),
        ArrowField::new("is_active", DataType::Boolean, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(listings.iter().map(|l| Some(l.id.to_string())).collect::<Vec<_>>());
    let platforms = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.platform.as_str()))
            .collect::<Vec<_>>(),
    );
    let external_ids = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.external_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(listings.iter().map(|l| l.title.as_deref()).collect::<Vec<_>>());
    let cities = StringArray::from(listings.iter().map(|l| l.city.as_deref()).collect::<Vec<_>>());
    let neighborhoods = StringArray::from(
        listings
            .iter()
            .map(|l| l.neighborhood.as_deref())
            .collect::<Vec<_>>(),
    );
    let property_types = StringArray::from(
        listings
            .iter()
            .map(|l| l.property_type.as_deref())
            .collect::<Vec<_>>(),
    );
    let prices = Float64Array::from(listings.iter().map(|l| l.price).collect::<Vec<_>>());
    let currencies = StringArray::from(listings.iter().map(|l| l.currency.as_deref()).collect::<Vec<_>>());
    let bedrooms = UInt32Array::from(listings.iter().map(|l| l.bedrooms).collect::<Vec<_>>());
    let latitudes = Float64Array::from(listings.iter().map(|l| l.latitude).collect::<Vec<_>>());
    let longitudes = Float64Array::from(listings.iter().map(|l| l.longitude).collect::<Vec<_>>());
    let hosts = StringArray::from(listings.iter().map(|l| l.host_name.as_deref()).collect::<Vec<_>>());
    let phones = StringArray::from(listings.iter().map(|l| l.phone()).collect::<Vec<_>>());
    let quality = UInt32Array::from(
        listings
            .iter()
            .map(|l| u32::from(l.quality_score))
            .collect::<Vec<_>>(),
    );
    let active = BooleanArray::from(listings.iter().map(|l| l.is_active).collect::<Vec<_>>());
    let last_seen = StringArray::from(
        listings
            .iter()
            .map(|l| Some(l.last_seen_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(platforms),
            Arc::new(external_ids),
            Arc::new(titles),
            Arc::new(cities),
            Arc::new(neighborhoods),
            Arc::new(property_types),
            Arc::new(prices),
            Arc::new(currencies),
            Arc::new(bedrooms),
            Arc::new(latitudes),
            Arc::new(longitudes),
            Arc::new(hosts),
            Arc::new(phones),
            Arc::new(quality),
            Arc::new(active),
            Arc::new(last_seen),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_matches_parquet(path: &Path, matches: &[MatchResult]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("scraped_listing_id", DataType::Utf8, false),
        ArrowField::new("registered_property_id", DataType::Utf8, true),
        ArrowField::new("match_type", DataType::Utf8, false),
        ArrowField::new("match_score", DataType::Float64, false),
        ArrowField::new("distance_m", DataType::Float64, true),
        ArrowField::new("matched_at", DataType::Utf8, false),
    ]));

    let listing_ids = StringArray::from(
        matches
            .iter()
            .map(|m| Some(m.scraped_listing_id.to_string()))
            .collect::<Vec<_>>(),
    );
    let property_ids = StringArray::from(
        matches
            .iter()
            .map(|m| m.registered_property_id.as_deref())
            .collect::<Vec<_>>(),
    );
    let kinds = StringArray::from(
        matches
            .iter()
            .map(|m| Some(m.match_type.as_str()))
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(matches.iter().map(|m| m.match_score).collect::<Vec<_>>());
    let distances = Float64Array::from(
        matches
            .iter()
            .map(|m| m.breakdown.distance_m)
            .collect::<Vec<_>>(),
    );
    let matched_at = StringArray::from(
        matches
            .iter()
            .map(|m| Some(m.matched_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(listing_ids),
            Arc::new(property_ids),
            Arc::new(kinds),
            Arc::new(scores),
            Arc::new(distances),
            Arc::new(matched_at),
        ],
    )
    .context("building matches record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows: rows as u64,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shadowstay_core::{ListingDraft, MatchType, NormalizedListing, Platform, ScoreBreakdown, SearchParams};

    use super::*;

    fn listing(id: &str) -> ScrapedListing {
        let mut draft = ListingDraft::new(Platform::Booking, id, Utc::now());
        draft.title = Some(format!("Hôtel {id}"));
        draft.price = Some(45_000.0);
        draft.currency = Some("XOF".into());
        ScrapedListing::from_normalized(
            &NormalizedListing {
                listing: draft,
                quality_score: 40,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn snapshot_writes_files_and_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listings = vec![listing("1"), listing("2")];
        let matches = vec![MatchResult {
            scraped_listing_id: listings[0].id,
            registered_property_id: None,
            match_type: MatchType::NoMatch,
            match_score: 0.0,
            breakdown: ScoreBreakdown::default(),
            matched_at: Utc::now(),
        }];

        let manifest = export_snapshot(dir.path(), &listings, &matches).await.expect("export");
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].path, "listings.parquet");
        assert_eq!(manifest.files[0].rows, 2);
        assert_eq!(manifest.files[1].rows, 1);
        assert_eq!(manifest.files[0].sha256.len(), 64);

        let on_disk = std::fs::read(dir.path().join("listings.parquet")).expect("parquet");
        assert_eq!(on_disk.len() as u64, manifest.files[0].bytes);
        assert_eq!(&on_disk[..4], b"PAR1");
        let manifest_json = std::fs::read_to_string(dir.path().join("manifest.json")).expect("manifest");
        let parsed: ExportManifest = serde_json::from_str(&manifest_json).expect("json");
        assert_eq!(parsed, manifest);
    }

    #[tokio::test]
    async fn run_report_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut job = shadowstay_core::ScrapeJob::new(Platform::Airbnb, SearchParams::new("Dakar", 2));
        job.start().expect("start");
        job.fail("navigation to https://www.airbnb.com failed").expect("fail");
        let run = ScrapeRun {
            job,
            pages_visited: 0,
            stop: None,
        };
        let brief = scrape_brief(&run);
        assert!(brief.contains("Status: failed"));
        assert!(brief.contains("## Error"));

        let out = write_run_report(dir.path(), run.job.id, &run, &brief).await.expect("report");
        assert!(out.join("run.json").exists());
        assert!(out.join("brief.md").exists());
    }
}
