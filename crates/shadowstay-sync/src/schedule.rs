//! Cron schedule: periodic crawls per platform × city, the weekly metrics
//! rollup and the daily staleness sweep.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shadowstay_core::{Platform, SearchParams};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::AppConfig;
use crate::jobs::JobManager;

fn default_pages() -> u32 {
    5
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub platform: Platform,
    pub city: String,
    #[serde(default = "default_pages")]
    pub pages: u32,
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TargetFile {
    #[serde(default)]
    targets: Vec<Target>,
}

pub fn parse_targets(yaml: &str) -> Result<Vec<Target>> {
    let file: TargetFile = serde_yaml::from_str(yaml).context("parsing targets")?;
    Ok(file.targets)
}

pub async fn load_targets(path: &Path) -> Result<Vec<Target>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_targets(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Crawl(Target),
    Metrics { cities: Vec<String> },
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub cron: String,
    pub task: Task,
}

/// One crawl per enabled target, a metrics rollup over every enabled target
/// city and one staleness sweep.
pub fn plan(targets: &[Target], metrics_cron: &str, cleanup_cron: &str) -> Vec<ScheduledTask> {
    let enabled: Vec<&Target> = targets.iter().filter(|t| t.enabled).collect();
    let cities: BTreeSet<String> = enabled.iter().map(|t| t.city.clone()).collect();
    let mut tasks: Vec<ScheduledTask> = enabled
        .into_iter()
        .map(|t| ScheduledTask {
            cron: t.cron.clone(),
            task: Task::Crawl(t.clone()),
        })
        .collect();
    if !cities.is_empty() {
        tasks.push(ScheduledTask {
            cron: metrics_cron.to_string(),
            task: Task::Metrics {
                cities: cities.into_iter().collect(),
            },
        });
    }
    tasks.push(ScheduledTask {
        cron: cleanup_cron.to_string(),
        task: Task::Cleanup,
    });
    tasks
}

/// Failures are logged; one failing target never stops the others.
async fn run_task(manager: &JobManager, task: &Task) {
    match task {
        Task::Crawl(target) => {
            let params = SearchParams::new(target.city.clone(), target.pages);
            match manager.run_scrape(target.platform, params).await {
                Ok(run) => info!(
                    platform = %target.platform,
                    city = %target.city,
                    status = run.job.status.as_str(),
                    new = run.job.counters.listings_new,
                    "scheduled crawl finished"
                ),
                Err(err) => error!(platform = %target.platform, city = %target.city, error = %err, "scheduled crawl failed"),
            }
        }
        Task::Metrics { cities } => {
            for city in cities {
                if let Err(err) = manager.generate_metrics(city, None, None).await {
                    error!(city = %city, error = %err, "scheduled metrics rollup failed");
                }
            }
        }
        Task::Cleanup => {
            for platform in Platform::ALL {
                if let Err(err) = manager.cleanup(platform, None).await {
                    error!(%platform, error = %err, "scheduled staleness sweep failed");
                }
            }
        }
    }
}

pub async fn build_scheduler(manager: Arc<JobManager>, tasks: Vec<ScheduledTask>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for scheduled in tasks {
        let cron = scheduled.cron.clone();
        let task = Arc::new(scheduled.task);
        let manager = Arc::clone(&manager);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let manager = Arc::clone(&manager);
            let task = Arc::clone(&task);
            Box::pin(async move {
                run_task(&manager, &task).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

/// `None` when scheduling is disabled in configuration.
pub async fn maybe_build_scheduler(config: &AppConfig, manager: Arc<JobManager>) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let targets = load_targets(&config.targets_path).await?;
    let tasks = plan(&targets, &config.metrics_cron, &config.cleanup_cron);
    info!(tasks = tasks.len(), "registering scheduled tasks");
    build_scheduler(manager, tasks).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGETS: &str = r#"
targets:
  - platform: airbnb
    city: Dakar
    pages: 10
    cron: "0 0 4 * * *"
  - platform: expat_dakar
    city: Dakar
    cron: "0 0 5 * * *"
  - platform: booking
    city: Saly
    cron: "0 0 6 * * *"
    enabled: false
"#;

    #[test]
    fn targets_parse_with_defaults() {
        let targets = parse_targets(TARGETS).expect("targets");
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].platform, Platform::Airbnb);
        assert_eq!(targets[1].platform, Platform::ExpatDakar);
        assert_eq!(targets[1].pages, 5);
        assert!(targets[1].enabled);
        assert!(!targets[2].enabled);
        assert!(parse_targets("targets:\n  - platform: vrbo\n    city: Dakar\n    cron: x\n").is_err());
    }

    #[test]
    fn plan_skips_disabled_targets() {
        let targets = parse_targets(TARGETS).expect("targets");
        let tasks = plan(&targets, "0 0 3 * * Mon", "0 30 2 * * *");
        assert_eq!(tasks.len(), 4);
        assert!(matches!(&tasks[0].task, Task::Crawl(t) if t.pages == 10));
        assert_eq!(
            tasks[2].task,
            Task::Metrics {
                cities: vec!["Dakar".to_string()]
            }
        );
        assert_eq!(tasks[3].cron, "0 30 2 * * *");
        assert_eq!(tasks[3].task, Task::Cleanup);
    }
}
