use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use shadowstay_core::{BatchJob, BatchStatus, JobStatus, Platform, SearchParams};
use shadowstay_storage::PgStore;
use shadowstay_sync::{manager_from_config, maybe_build_scheduler, AppConfig, PauseHandle};
use tracing::info;
use uuid::Uuid;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "shadowstay")]
#[command(about = "Shadow listing crawler and registry matcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl one platform and city once, then persist and match the results.
    RunScrape {
        platform: Platform,
        city: String,
        #[arg(default_value_t = 5)]
        max_pages: u32,
        #[arg(long)]
        min_price: Option<f64>,
        #[arg(long)]
        max_price: Option<f64>,
    },
    /// Active listings with no acceptable registry match.
    ListUnregistered { city: String, limit: Option<usize> },
    /// Recompute the market aggregate for a city (dates as YYYY-MM-DD).
    GenerateMetrics {
        city: String,
        period_start: Option<NaiveDate>,
        period_end: Option<NaiveDate>,
    },
    /// Mark listings not seen for `days` as inactive.
    Cleanup { platform: Platform, days: Option<i64> },
    StartBatch {
        platform: Platform,
        city: String,
        pages: u32,
    },
    ResumeBatch { job_id: Uuid },
    /// Pause one batch job, or every running one.
    Pause { job_id: Option<Uuid> },
    DetectOwners { city: Option<String> },
    /// Parquet snapshot of a city's listings and matches.
    Export { city: String },
    Migrate,
    /// Run the cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init() {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    let config = AppConfig::from_env();

    match command {
        Commands::RunScrape {
            platform,
            city,
            max_pages,
            min_price,
            max_price,
        } => {
            let manager = manager_from_config(&config).await?;
            let mut params = SearchParams::new(city, max_pages);
            params.min_price = min_price;
            params.max_price = max_price;
            let run = manager.run_scrape(platform, params).await?;
            let job = &run.job;
            if job.status == JobStatus::Failed {
                eprintln!(
                    "error: scrape job {} failed: {}",
                    job.id,
                    job.error_message.as_deref().unwrap_or("unknown error")
                );
                return Ok(ExitCode::FAILURE);
            }
            println!(
                "scrape complete: job_id={} pages={} found={} new={} updated={} detail_failures={}",
                job.id,
                run.pages_visited,
                job.counters.listings_found,
                job.counters.listings_new,
                job.counters.listings_updated,
                job.counters.detail_failures
            );
        }
        Commands::ListUnregistered { city, limit } => {
            let manager = manager_from_config(&config).await?;
            let listings = manager.list_unregistered(&city, limit).await?;
            for l in &listings {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    l.platform,
                    l.external_id,
                    l.title.as_deref().unwrap_or("-"),
                    l.price
                        .map(|p| format!("{p:.0} {}", l.currency.as_deref().unwrap_or("")))
                        .unwrap_or_else(|| "-".to_string()),
                    l.url.as_deref().unwrap_or("-")
                );
            }
            println!("{} potentially unregistered listing(s) in {city}", listings.len());
        }
        Commands::GenerateMetrics {
            city,
            period_start,
            period_end,
        } => {
            let manager = manager_from_config(&config).await?;
            let metrics = manager.generate_metrics(&city, period_start, period_end).await?;
            let json = serde_json::to_string_pretty(&metrics).context("serializing metrics")?;
            println!("{json}");
        }
        Commands::Cleanup { platform, days } => {
            let manager = manager_from_config(&config).await?;
            let marked = manager.cleanup(platform, days).await?;
            println!("{marked} {platform} listing(s) marked inactive");
        }
        Commands::StartBatch {
            platform,
            city,
            pages,
        } => {
            let manager = manager_from_config(&config).await?;
            let pause = interrupt_pauses();
            let job = manager
                .start_batch(platform, SearchParams::new(city, pages), &pause)
                .await?;
            return Ok(report_batch(&job));
        }
        Commands::ResumeBatch { job_id } => {
            let manager = manager_from_config(&config).await?;
            let pause = interrupt_pauses();
            let job = manager.resume_batch(job_id, &pause).await?;
            return Ok(report_batch(&job));
        }
        Commands::Pause { job_id } => {
            let manager = manager_from_config(&config).await?;
            let flagged = manager.pause(job_id).await?;
            println!("pause requested for {flagged} batch job(s)");
        }
        Commands::DetectOwners { city } => {
            let manager = manager_from_config(&config).await?;
            let owners = manager.detect_owners(city.as_deref()).await?;
            for owner in owners.iter().filter(|o| o.is_multi_property()) {
                println!(
                    "{}\t{}\tlistings={}\tunregistered={}\tmonthly_revenue={}",
                    owner.identifier,
                    owner.names.join(", "),
                    owner.listing_count,
                    owner.unregistered_count,
                    owner
                        .estimated_monthly_revenue
                        .map(|r| format!("{r:.0}"))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            let multi = owners.iter().filter(|o| o.is_multi_property()).count();
            println!("{} owner(s) detected, {multi} multi-property", owners.len());
        }
        Commands::Export { city } => {
            let manager = manager_from_config(&config).await?;
            let dir = config
                .reports_dir
                .join("exports")
                .join(format!("{}-{}", slug(&city), Utc::now().format("%Y%m%d")));
            let manifest = manager.export(&city, &dir).await?;
            for file in &manifest.files {
                println!("{}\trows={}\tbytes={}\tsha256={}", file.path, file.rows, file.bytes, file.sha256);
            }
            println!("export written to {}", dir.display());
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set");
            };
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let manager = Arc::new(manager_from_config(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, manager).await? else {
                println!("scheduler disabled; set SHADOWSTAY_SCHEDULER_ENABLED=true to run it");
                return Ok(ExitCode::SUCCESS);
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Ctrl-C pauses the batch after its current page.
fn interrupt_pauses() -> PauseHandle {
    let pause = PauseHandle::new();
    let handle = pause.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; pausing after the current page");
            handle.request();
        }
    });
    pause
}

fn report_batch(job: &BatchJob) -> ExitCode {
    println!(
        "batch {}: status={} pages_completed={} found={} new={} updated={}",
        job.id,
        job.status.as_str(),
        job.pages_completed(),
        job.counters.listings_found,
        job.counters.listings_new,
        job.counters.listings_updated
    );
    match job.status {
        BatchStatus::Paused => {
            if let Some(err) = &job.last_error {
                eprintln!("batch paused after repeated errors: {err}");
            }
            println!("resume with: shadowstay resume-batch {}", job.id);
            ExitCode::SUCCESS
        }
        BatchStatus::Failed => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}

fn slug(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn positional_arguments_parse() {
        let cli = Cli::try_parse_from(["shadowstay", "run-scrape", "expat-dakar", "Dakar", "3", "--max-price", "50000"])
            .expect("parse");
        match cli.command {
            Commands::RunScrape {
                platform,
                city,
                max_pages,
                max_price,
                ..
            } => {
                assert_eq!(platform, Platform::ExpatDakar);
                assert_eq!(city, "Dakar");
                assert_eq!(max_pages, 3);
                assert_eq!(max_price, Some(50_000.0));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["shadowstay", "generate-metrics", "Saly", "2026-03-01", "2026-03-31"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::GenerateMetrics { period_end: Some(end), .. } if end == NaiveDate::from_ymd_opt(2026, 3, 31).unwrap()
        ));
        assert!(Cli::try_parse_from(["shadowstay", "cleanup", "vrbo"]).is_err());
        assert!(matches!(
            Cli::try_parse_from(["shadowstay", "pause"]).expect("parse").command,
            Commands::Pause { job_id: None }
        ));
    }

    #[test]
    fn export_directory_slug() {
        assert_eq!(slug(" Saint-Louis "), "saint-louis");
        assert_eq!(slug("Cap Skirring"), "cap-skirring");
    }
}
