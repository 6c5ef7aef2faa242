use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use shadowstay_adapters::{Crawler, CrawlerConfig, FixtureRenderer, SelectorCatalog};
use shadowstay_core::{
    BatchJob, BatchStatus, JobCounters, JobStatus, MatchType, Platform, RegisteredProperty, SearchParams,
};
use shadowstay_storage::{BackoffPolicy, ListingStore, MemoryStore, RateLimitConfig, RateLimiter};
use shadowstay_sync::{BatchPolicy, JobManager, PauseHandle, StaticRegistry};

const PAGE_1: &str = "https://www.expat-dakar.com/immobilier?q=Dakar";
const PAGE_2: &str = "https://www.expat-dakar.com/immobilier?q=Dakar&page=2";

fn card(id: u32, title: &str, price: &str) -> String {
    format!(
        r#"<div class="listing-card">
             <a class="listing-card__inner" href="/annonce/appartement-{id}">
               <img src="https://img.test/{id}.jpg" alt="{title}">
               <span class="listing-card__price__value">{price}</span>
             </a>
           </div>"#
    )
}

fn results_page(cards: &[(u32, &str)], next: Option<&str>, price: &str) -> String {
    let mut html = String::from("<html><body>");
    for (id, title) in cards {
        html.push_str(&card(*id, title, price));
    }
    if let Some(next) = next {
        html.push_str(&format!(r#"<a class="pagination-next" href="{next}">Suivant</a>"#));
    }
    html.push_str("</body></html>");
    html
}

fn detail_url(id: u32) -> String {
    format!("https://www.expat-dakar.com/annonce/appartement-{id}")
}

fn detail_page(title: &str, description: &str, seller: Option<&str>) -> String {
    let seller = seller
        .map(|name| format!(r#"<span class="listing-item__seller__name">{name}</span>"#))
        .unwrap_or_default();
    format!(
        r#"<html><body>
             <h1 class="listing-item__header__title">{title}</h1>
             <div class="listing-item__description">{description}</div>
             <span class="listing-item__address-location">Mermoz, Dakar</span>
             {seller}
             <a href="tel:771234567">Appeler</a>
           </body></html>"#
    )
}

fn dakar_site(price: &str) -> FixtureRenderer {
    FixtureRenderer::builder()
        .page(
            PAGE_1,
            results_page(&[(101, "Studio Mermoz"), (102, "Villa Ngor")], Some("/immobilier?q=Dakar&page=2"), price),
        )
        .page(PAGE_2, results_page(&[(103, "Chambre Plateau")], None, price))
        .page(detail_url(101), detail_page("Studio meublé Mermoz", "3 chambres", Some("Awa Ndiaye")))
        .page(detail_url(103), detail_page("Chambre au Plateau", "1 chambre", None))
        .build()
}

fn registry() -> Arc<StaticRegistry> {
    let licensed = RegisteredProperty {
        id: "R-77".into(),
        name: None,
        address: None,
        city: "Dakar".into(),
        neighborhood: None,
        latitude: None,
        longitude: None,
        property_type: None,
        room_count: Some(3),
        owner_name: Some("Awa Ndiaye".into()),
        owner_company: None,
    };
    let elsewhere = RegisteredProperty {
        id: "R-90".into(),
        city: "Saly".into(),
        ..licensed.clone()
    };
    Arc::new(StaticRegistry::new(vec![licensed, elsewhere]))
}

fn crawler_config() -> CrawlerConfig {
    CrawlerConfig {
        concurrency: 2,
        nav_attempts: 1,
        retry_delay: Duration::ZERO,
        results_timeout: Duration::from_millis(5),
        fetch_details: true,
    }
}

fn manager(renderer: &FixtureRenderer, store: Arc<MemoryStore>) -> JobManager {
    managed_by(
        renderer,
        store,
        BatchPolicy {
            error_threshold: 2,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        },
    )
}

fn managed_by(renderer: &FixtureRenderer, store: Arc<MemoryStore>, policy: BatchPolicy) -> JobManager {
    let crawler = Crawler::new(
        Arc::new(renderer.clone()),
        Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: 1000,
            window: Duration::from_secs(60),
        })),
        crawler_config(),
    );
    let catalog = SelectorCatalog::builtin().expect("catalog");
    JobManager::new(store, registry(), crawler, catalog).with_policy(policy)
}

#[tokio::test]
async fn scrape_persists_listings_and_flags_shadow_listings() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&dakar_site("300 000 F Cfa"), Arc::clone(&store)).with_reports_dir(reports.path());

    let run = manager
        .run_scrape(Platform::ExpatDakar, SearchParams::new("Dakar", 5))
        .await
        .expect("scrape");

    assert_eq!(run.job.status, JobStatus::Completed);
    assert_eq!(run.pages_visited, 2);
    assert_eq!(run.job.counters.listings_found, 3);
    assert_eq!(run.job.counters.listings_new, 3);
    assert_eq!(run.job.counters.detail_failures, 1);
    assert_eq!(store.listing_count().await, 3);
    assert!(reports.path().join(run.job.id.to_string()).join("run.json").exists());

    let matched = store
        .get_listing(Platform::ExpatDakar, "101")
        .await
        .expect("get")
        .expect("listing 101");
    assert_eq!(matched.phone(), Some("+221771234567"));
    assert_eq!(matched.city.as_deref(), Some("Dakar"));
    let results = store.matches_for(&[matched.id]).await.expect("matches");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].registered_property_id.as_deref(), Some("R-77"));
    // host name and bedroom count are the only comparable factors, both equal
    assert_eq!(results[0].match_type, MatchType::Exact);

    let shadow = manager.list_unregistered("dakar", None).await.expect("unregistered");
    let ids: HashSet<&str> = shadow.iter().map(|l| l.external_id.as_str()).collect();
    assert_eq!(ids, HashSet::from(["102", "103"]));
    assert_eq!(manager.list_unregistered("Dakar", Some(1)).await.expect("limited").len(), 1);

    let metrics = manager.generate_metrics("Dakar", None, None).await.expect("metrics");
    assert_eq!(metrics.total_listings, 3);
    assert_eq!(metrics.registered_listings, 1);
    assert_eq!(metrics.unregistered_listings, 2);
    assert!((metrics.compliance_rate - 1.0 / 3.0).abs() < 1e-9);

    let owners = manager.detect_owners(Some("Dakar")).await.expect("owners");
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].identifier, "+221771234567");
    assert_eq!(owners[0].listing_count, 2);
    assert_eq!(owners[0].unregistered_count, 1);

    let export_dir = reports.path().join("export");
    let manifest = manager.export("Dakar", &export_dir).await.expect("export");
    assert_eq!(manifest.files[0].rows, 3);
    assert!(export_dir.join("manifest.json").exists());
}

#[tokio::test]
async fn reingesting_updates_the_existing_row() {
    let store = Arc::new(MemoryStore::new());
    manager(&dakar_site("300 000 F Cfa"), Arc::clone(&store))
        .run_scrape(Platform::ExpatDakar, SearchParams::new("Dakar", 5))
        .await
        .expect("first scrape");
    let before = store
        .get_listing(Platform::ExpatDakar, "102")
        .await
        .expect("get")
        .expect("listing");

    let second = manager(&dakar_site("450 000 F Cfa"), Arc::clone(&store))
        .run_scrape(Platform::ExpatDakar, SearchParams::new("Dakar", 5))
        .await
        .expect("second scrape");
    let after = store
        .get_listing(Platform::ExpatDakar, "102")
        .await
        .expect("get")
        .expect("listing");

    assert_eq!(second.job.counters.listings_new, 0);
    assert_eq!(second.job.counters.listings_updated, 3);
    assert_eq!(store.listing_count().await, 3);
    assert_eq!(after.id, before.id);
    assert_eq!(after.first_seen_at, before.first_seen_at);
    assert!(after.last_seen_at >= before.last_seen_at);
    assert_ne!(after.price, before.price);
    // matching ran once, on insert
    assert_eq!(store.matches_for(&[after.id]).await.expect("matches").len(), 1);
}

#[tokio::test]
async fn navigation_failure_fails_the_job_not_the_caller() {
    let renderer = FixtureRenderer::builder().fail(PAGE_1, 10).build();
    let store = Arc::new(MemoryStore::new());
    let run = manager(&renderer, Arc::clone(&store))
        .run_scrape(Platform::ExpatDakar, SearchParams::new("Dakar", 5))
        .await
        .expect("job-level failure is not an error");

    assert_eq!(run.job.status, JobStatus::Failed);
    assert!(run.job.error_message.as_deref().unwrap_or_default().contains(PAGE_1));
    let stored = store.get_scrape_job(run.job.id).await.expect("get").expect("job");
    assert_eq!(stored.status, JobStatus::Failed);
}

#[tokio::test]
async fn paused_batch_resumes_from_its_cursor() {
    let page_37 = "https://www.expat-dakar.com/immobilier?q=Dakar&page=37";
    let renderer = FixtureRenderer::builder()
        .page(page_37, results_page(&[(3701, "Studio Fann"), (3702, "Villa Ouakam")], None, "250 000 F Cfa"))
        .build();
    let store = Arc::new(MemoryStore::new());

    let mut batch = BatchJob::new(Platform::ExpatDakar, SearchParams::new("Dakar", 100));
    for page in 1..37 {
        batch.record_page(
            JobCounters {
                listings_found: 10,
                listings_new: 10,
                ..Default::default()
            },
            Some(format!("https://www.expat-dakar.com/immobilier?q=Dakar&page={}", page + 1)),
        );
    }
    batch.set_status(BatchStatus::Paused);
    assert_eq!(batch.current_page, 37);
    store.save_batch_job(&batch).await.expect("save");

    let resumed = manager(&renderer, Arc::clone(&store))
        .resume_batch(batch.id, &PauseHandle::new())
        .await
        .expect("resume");

    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_eq!(resumed.current_page, 38);
    assert_eq!(resumed.counters.listings_found, 362);
    assert_eq!(resumed.counters.listings_new, 362);
    assert!(!renderer.visits().iter().any(|v| v == PAGE_1));

    let stored = store.load_batch_job(batch.id).await.expect("load").expect("batch");
    assert_eq!(stored.status, BatchStatus::Completed);
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
async fn consecutive_page_errors_pause_then_resume() {
    let store = Arc::new(MemoryStore::new());
    let broken = FixtureRenderer::builder().fail(PAGE_1, 100).build();
    let paused = manager(&broken, Arc::clone(&store))
        .start_batch(Platform::ExpatDakar, SearchParams::new("Dakar", 5), &PauseHandle::new())
        .await
        .expect("batch");

    assert_eq!(paused.status, BatchStatus::Paused);
    assert_eq!(paused.consecutive_errors, 2);
    assert_eq!(paused.current_page, 1);
    assert!(paused.last_error.is_some());

    let resumed = manager(&dakar_site("300 000 F Cfa"), Arc::clone(&store))
        .resume_batch(paused.id, &PauseHandle::new())
        .await
        .expect("resume");
    assert_eq!(resumed.status, BatchStatus::Completed);
    assert_eq!(resumed.pages_completed(), 2);
    assert_eq!(resumed.consecutive_errors, 0);
    assert_eq!(resumed.counters.listings_found, 3);
}

#[tokio::test(start_paused = true)]
async fn page_errors_back_off_exponentially_before_pausing() {
    let store = Arc::new(MemoryStore::new());
    let broken = FixtureRenderer::builder().fail(PAGE_1, 100).build();
    let policy = BatchPolicy {
        error_threshold: 3,
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        },
    };

    let started = tokio::time::Instant::now();
    let paused = managed_by(&broken, Arc::clone(&store), policy)
        .start_batch(Platform::ExpatDakar, SearchParams::new("Dakar", 5), &PauseHandle::new())
        .await
        .expect("batch");
    let waited = started.elapsed();

    assert_eq!(paused.status, BatchStatus::Paused);
    assert_eq!(paused.consecutive_errors, 3);
    // 2s after the first error, 4s after the second, none once the threshold trips
    assert!(waited >= Duration::from_secs(6), "waited {waited:?}");
    assert!(waited < Duration::from_secs(14), "waited {waited:?}");
}

#[tokio::test]
async fn pause_request_stops_between_pages() {
    let store = Arc::new(MemoryStore::new());
    let renderer = dakar_site("300 000 F Cfa");
    let pause = PauseHandle::new();
    pause.request();

    let job = manager(&renderer, Arc::clone(&store))
        .start_batch(Platform::ExpatDakar, SearchParams::new("Dakar", 5), &pause)
        .await
        .expect("batch");
    assert_eq!(job.status, BatchStatus::Paused);
    assert_eq!(job.current_page, 1);
    assert!(renderer.visits().is_empty());

    let manager = manager(&renderer, Arc::clone(&store));
    assert_eq!(manager.pause(Some(job.id)).await.expect("flag"), 1);
    let err = manager
        .resume_batch(uuid::Uuid::new_v4(), &PauseHandle::new())
        .await
        .expect_err("unknown batch");
    assert!(err.to_string().contains("not found"));

    // resume clears the stored flag before running
    let done = manager
        .resume_batch(job.id, &PauseHandle::new())
        .await
        .expect("resume");
    assert_eq!(done.status, BatchStatus::Completed);
    assert!(manager.resume_batch(job.id, &PauseHandle::new()).await.is_err());
}

#[tokio::test]
async fn cleanup_deactivates_only_stale_listings() {
    let store = Arc::new(MemoryStore::new());
    let manager = manager(&dakar_site("300 000 F Cfa"), Arc::clone(&store));
    manager
        .run_scrape(Platform::ExpatDakar, SearchParams::new("Dakar", 5))
        .await
        .expect("scrape");

    assert_eq!(manager.cleanup(Platform::ExpatDakar, None).await.expect("sweep"), 0);
    assert_eq!(manager.cleanup(Platform::Airbnb, Some(0)).await.expect("other platform"), 0);
    // a zero-day cutoff is "now", so everything seen before it goes stale
    assert_eq!(manager.cleanup(Platform::ExpatDakar, Some(0)).await.expect("sweep"), 3);
    assert!(manager.list_unregistered("Dakar", None).await.expect("query").is_empty());
}
