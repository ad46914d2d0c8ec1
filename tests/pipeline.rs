//! End-to-end scrape tests against a local fixture site.
//!
//! The site serves a listing page, two monthly update PDFs, and the policy
//! PDFs they link to. Records and progress live in memory. Most tests run
//! on an idle machine; the throttling tests script busy samples.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::watch;

use policy_harvest::config::SourceConfig;
use policy_harvest::document::DocumentExtractor;
use policy_harvest::fetch::Fetcher;
use policy_harvest::pipeline::{Pipeline, PipelineSettings, ScrapeRequest};
use policy_harvest_core::models::{CodeType, LogStatus, ResourceSnapshot};
use policy_harvest_core::recognize::DEFAULT_POLICY_BASE;
use policy_harvest_core::store::memory::{InMemoryProgressStore, InMemoryRecordStore};
use policy_harvest_core::store::RecordStore;
use policy_harvest_core::throttle::{ResourceMonitor, ResourceProbe, ThrottleConfig};
use policy_harvest_core::tracker::ProgressTracker;

use common::{bind_local, monthly_update_pdf, policy_pdf, serve_listener, serve_site};

struct IdleProbe;

#[async_trait]
impl ResourceProbe for IdleProbe {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        Ok(ResourceSnapshot {
            cpu_percent: 3.0,
            memory_percent: 25.0,
            available_memory_gb: 12.0,
            disk_percent: 40.0,
            process_memory_mb: 30.0,
            timestamp: Utc::now(),
        })
    }

    fn cpu_count(&self) -> usize {
        4
    }
}

/// Busy (CPU over threshold, memory fine) on the sample numbers `busy`
/// selects, idle otherwise.
struct ScriptedLoad {
    samples: AtomicUsize,
    busy: fn(usize) -> bool,
}

impl ScriptedLoad {
    fn new(busy: fn(usize) -> bool) -> Arc<Self> {
        Arc::new(Self {
            samples: AtomicUsize::new(0),
            busy,
        })
    }

    fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceProbe for ScriptedLoad {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let n = self.samples.fetch_add(1, Ordering::SeqCst);
        Ok(ResourceSnapshot {
            cpu_percent: if (self.busy)(n) { 92.0 } else { 3.0 },
            memory_percent: 25.0,
            available_memory_gb: 12.0,
            disk_percent: 40.0,
            process_memory_mb: 30.0,
            timestamp: Utc::now(),
        })
    }

    fn cpu_count(&self) -> usize {
        4
    }
}

struct Harness {
    addr: SocketAddr,
    records: Arc<InMemoryRecordStore>,
    tracker: Arc<ProgressTracker>,
    pipeline: Pipeline,
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn policy_path(name: &str) -> String {
    format!("/pdf/medical/{}", name)
}

const ALVEOLOPLASTY: &str = "mm_0586_coveragepositioncriteria_alveoloplasty.pdf";
const DENTAL_IMPLANTS: &str = "mm_0585_coveragepositioncriteria_dental_implants.pdf";
const PLEXUS_BLOCK: &str = "mm_0579_coveragepositioncriteria_cervical_plexus_block.pdf";
const MISSING: &str = "mm_0999_coveragepolicy_withdrawn_procedure.pdf";
const ELSEWHERE: &str =
    "https://policies.elsewhere.example.org/pdf/medical/mm_0100_coveragepolicy_offsite.pdf";

/// January links 0586 and 0585; February links 0585 again, 0579, and a
/// policy the site does not serve. March, reachable only by URL, links
/// 0586 and a policy on another host.
async fn harness() -> Harness {
    harness_with(Arc::new(IdleProbe), 3).await
}

async fn harness_with(probe: Arc<dyn ResourceProbe>, max_backoffs: u32) -> Harness {
    let (listener, addr) = bind_local().await;
    let base = format!("http://{}", addr);

    let abs = |name: &str| format!("{}{}", base, policy_path(name));
    let listing = r#"<html><body>
        <ul>
          <li><a href="updates/january-2025.pdf">Policy Updates January 2025</a></li>
          <li><a href="updates/february-2025.pdf">Policy Updates February 2025</a></li>
          <li><a href="about.html">About coverage policies</a></li>
        </ul>
    </body></html>"#;

    let mut files = HashMap::new();
    files.insert("/listing.html".to_string(), listing.as_bytes().to_vec());
    files.insert(
        "/updates/january-2025.pdf".to_string(),
        monthly_update_pdf(&[abs(ALVEOLOPLASTY), abs(DENTAL_IMPLANTS)]),
    );
    files.insert(
        "/updates/february-2025.pdf".to_string(),
        monthly_update_pdf(&[abs(DENTAL_IMPLANTS), abs(PLEXUS_BLOCK), abs(MISSING)]),
    );
    files.insert(
        "/updates/march-2025.pdf".to_string(),
        monthly_update_pdf(&[ELSEWHERE.to_string(), abs(ALVEOLOPLASTY)]),
    );
    files.insert(
        policy_path(ALVEOLOPLASTY),
        policy_pdf("Alveoloplasty", "01/15/2025", "41870"),
    );
    files.insert(
        policy_path(DENTAL_IMPLANTS),
        policy_pdf("Dental Implants", "01/01/2025", "21248"),
    );
    files.insert(
        policy_path(PLEXUS_BLOCK),
        policy_pdf("Cervical Plexus Block", "02/01/2025", "64999"),
    );

    serve_listener(listener, files);

    let records = Arc::new(InMemoryRecordStore::new());
    let tracker = Arc::new(ProgressTracker::new(Arc::new(InMemoryProgressStore::new())));
    let monitor = Arc::new(ResourceMonitor::new(probe, ThrottleConfig::default()));
    let source = SourceConfig {
        timeout_secs: 10,
        ..SourceConfig::default()
    };
    let settings = PipelineSettings {
        listing_url: format!("{}/listing.html", base),
        base_url: format!("{}/", base),
        page_delay: Duration::ZERO,
        backoff: Duration::from_millis(10),
        max_backoffs,
        workers: 2,
        max_months: 0,
    };
    let pipeline = Pipeline::new(
        records.clone(),
        tracker.clone(),
        monitor,
        Fetcher::new(&source).unwrap(),
        Arc::new(DocumentExtractor::new(DEFAULT_POLICY_BASE).unwrap()),
        settings,
    )
    .unwrap();

    Harness {
        addr,
        records,
        tracker,
        pipeline,
    }
}

fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn full_scrape_stores_each_policy_once() {
    let h = harness().await;
    let summary = h
        .pipeline
        .run("task-full", &ScrapeRequest::default(), no_cancel())
        .await
        .unwrap();

    assert_eq!(summary.total_monthly_pages, 2);
    // 0585 appears in both months but is processed once
    assert_eq!(summary.total_documents, 4);
    assert_eq!(summary.total_policies_scraped, 3);
    assert_eq!(summary.total_errors, 1);
    assert_eq!(summary.total_skipped, 0);
    assert!(!summary.cancelled);
    // the unserved policy never reaches validation
    assert_eq!(summary.validation.total, 3);
    assert_eq!(summary.validation.valid, 3);
    assert_eq!(summary.validation.success_rate, 100.0);

    let january = &summary.monthly_summaries[0];
    assert_eq!(january.month_label, "January 2025");
    assert_eq!(january.links_found, 2);
    let february = &summary.monthly_summaries[1];
    assert_eq!(february.month_label, "February 2025");
    assert_eq!(february.links_found, 3);
    assert_eq!(february.errors, 1);

    assert_eq!(h.records.count_policies().await.unwrap(), 3);

    let stored = h
        .records
        .get_policy(&h.url(&policy_path(ALVEOLOPLASTY)))
        .await
        .unwrap()
        .expect("alveoloplasty stored");
    assert_eq!(stored.bundle.record.title, "Alveoloplasty");
    assert_eq!(stored.bundle.record.month_label.as_deref(), Some("January 2025"));
    assert_eq!(
        stored.bundle.record.published_date,
        NaiveDate::from_ymd_opt(2025, 1, 15)
    );
    assert!(stored
        .bundle
        .medical_codes
        .iter()
        .any(|c| c.code == "41870" && c.code_type == CodeType::Cpt));

    let progress = h.tracker.get_progress("task-full").await.unwrap().unwrap();
    assert_eq!(progress.items_total, 4);
    assert_eq!(progress.items_processed, 4);
    let status = h.tracker.summary("task-full").await.unwrap();
    assert_eq!(status.state, "COMPLETED");

    let logs = h.records.recent_logs(50).await.unwrap();
    assert_eq!(logs.iter().filter(|l| l.status == LogStatus::Success).count(), 3);
    assert!(logs
        .iter()
        .any(|l| l.status == LogStatus::Error && l.url.ends_with(MISSING)));
}

#[tokio::test]
async fn rerun_skips_stored_policies() {
    let h = harness().await;
    h.pipeline
        .run("first", &ScrapeRequest::default(), no_cancel())
        .await
        .unwrap();
    let second = h
        .pipeline
        .run("second", &ScrapeRequest::default(), no_cancel())
        .await
        .unwrap();

    assert_eq!(second.total_policies_scraped, 0);
    assert_eq!(second.total_skipped, 3);
    assert_eq!(second.total_errors, 1);
    assert_eq!(h.records.count_policies().await.unwrap(), 3);
    assert_eq!(h.tracker.summary("second").await.unwrap().state, "COMPLETED");
}

#[tokio::test]
async fn single_month_with_limit() {
    let h = harness().await;
    let request = ScrapeRequest {
        month_url: Some(h.url("/updates/february-2025.pdf")),
        month_label: Some("February 2025".to_string()),
        limit: Some(1),
    };
    let summary = h.pipeline.run("one", &request, no_cancel()).await.unwrap();

    assert_eq!(summary.total_monthly_pages, 1);
    assert_eq!(summary.total_documents, 1);
    assert_eq!(summary.total_policies_scraped, 1);

    let stored = h
        .records
        .get_policy(&h.url(&policy_path(DENTAL_IMPLANTS)))
        .await
        .unwrap()
        .expect("first February link stored");
    assert_eq!(stored.bundle.record.title, "Dental Implants");
    assert_eq!(stored.bundle.record.month_label.as_deref(), Some("February 2025"));
}

#[tokio::test]
async fn revoked_task_fails_without_storing() {
    let h = harness().await;
    let (tx, rx) = watch::channel(true);
    let summary = h
        .pipeline
        .run("revoked", &ScrapeRequest::default(), rx)
        .await
        .unwrap();
    drop(tx);

    assert!(summary.cancelled);
    assert_eq!(summary.total_policies_scraped, 0);
    assert_eq!(h.records.count_policies().await.unwrap(), 0);

    let status = h.tracker.summary("revoked").await.unwrap();
    assert_eq!(status.state, "FAILED");
    assert_eq!(status.error.as_deref(), Some("Task revoked"));
}

#[tokio::test]
async fn every_document_failing_fails_the_task() {
    let h = harness().await;
    let only_missing = monthly_update_pdf(&[h.url(&policy_path(MISSING))]);
    let mut files = HashMap::new();
    files.insert("/updates/broken.pdf".to_string(), only_missing);
    let broken = serve_site(files).await;

    let request = ScrapeRequest {
        month_url: Some(format!("http://{}/updates/broken.pdf", broken)),
        ..ScrapeRequest::default()
    };
    let summary = h.pipeline.run("broken", &request, no_cancel()).await.unwrap();
    assert_eq!(summary.total_errors, 1);

    let status = h.tracker.summary("broken").await.unwrap();
    assert_eq!(status.state, "FAILED");
    assert_eq!(status.error.as_deref(), Some("All 1 documents failed"));
}

#[tokio::test]
async fn unreachable_listing_fails_the_task() {
    let h = harness().await;
    let settings = PipelineSettings {
        listing_url: h.url("/no-such-listing.html"),
        base_url: h.url("/"),
        page_delay: Duration::ZERO,
        backoff: Duration::from_millis(10),
        max_backoffs: 3,
        workers: 1,
        max_months: 0,
    };
    let pipeline = Pipeline::new(
        h.records.clone(),
        h.tracker.clone(),
        Arc::new(ResourceMonitor::new(
            Arc::new(IdleProbe),
            ThrottleConfig::default(),
        )),
        Fetcher::new(&SourceConfig::default()).unwrap(),
        Arc::new(DocumentExtractor::new(DEFAULT_POLICY_BASE).unwrap()),
        settings,
    )
    .unwrap();

    let err = pipeline
        .run("no-listing", &ScrapeRequest::default(), no_cancel())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));

    let status = h.tracker.summary("no-listing").await.unwrap();
    assert_eq!(status.state, "FAILED");
    let logs = h.records.recent_logs(10).await.unwrap();
    assert!(logs.iter().any(|l| l.status == LogStatus::Error));
}

#[tokio::test]
async fn links_off_the_source_host_are_skipped() {
    let h = harness().await;
    let request = ScrapeRequest {
        month_url: Some(h.url("/updates/march-2025.pdf")),
        month_label: Some("March 2025".to_string()),
        limit: None,
    };
    let summary = h.pipeline.run("march", &request, no_cancel()).await.unwrap();

    assert_eq!(summary.monthly_summaries[0].links_found, 2);
    assert_eq!(summary.monthly_summaries[0].skipped, 1);
    assert_eq!(summary.total_documents, 1);
    assert_eq!(summary.total_policies_scraped, 1);
    assert_eq!(summary.total_skipped, 1);
    assert_eq!(summary.total_errors, 0);
    assert!(h.records.get_policy(ELSEWHERE).await.unwrap().is_none());

    let logs = h.records.recent_logs(10).await.unwrap();
    let offsite = logs.iter().find(|l| l.url == ELSEWHERE).expect("off-host link logged");
    assert_eq!(offsite.status, LogStatus::Skipped);
    assert_eq!(offsite.error_message.as_deref(), Some("outside 127.0.0.1"));
    assert_eq!(h.tracker.summary("march").await.unwrap().state, "COMPLETED");
}

#[tokio::test]
async fn busy_host_backs_off_then_completes() {
    let load = ScriptedLoad::new(|n| n < 3);
    let h = harness_with(load.clone(), 5).await;
    let summary = h
        .pipeline
        .run("busy", &ScrapeRequest::default(), no_cancel())
        .await
        .unwrap();

    // three busy samples were waited out before the first month was fetched
    assert!(load.samples() > 3);
    assert_eq!(summary.monthly_summaries[0].errors, 0);
    assert_eq!(summary.total_policies_scraped, 3);
    assert_eq!(summary.total_errors, 1);
    assert_eq!(h.tracker.summary("busy").await.unwrap().state, "COMPLETED");
}

#[tokio::test]
async fn documents_fail_once_back_offs_run_out() {
    // idle for the month fetch, busy for every document after it
    let load = ScriptedLoad::new(|n| n >= 1);
    let h = harness_with(load.clone(), 2).await;
    let request = ScrapeRequest {
        month_url: Some(h.url("/updates/february-2025.pdf")),
        month_label: Some("February 2025".to_string()),
        limit: Some(1),
    };
    let summary = h.pipeline.run("starved", &request, no_cancel()).await.unwrap();

    assert_eq!(summary.total_documents, 1);
    assert_eq!(summary.total_errors, 1);
    assert_eq!(h.records.count_policies().await.unwrap(), 0);
    // one idle sample, then the first check plus two re-checks
    assert_eq!(load.samples(), 4);

    let logs = h.records.recent_logs(10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Error);
    assert_eq!(
        logs[0].error_message.as_deref(),
        Some("resources unavailable after 2 back-offs")
    );

    let status = h.tracker.summary("starved").await.unwrap();
    assert_eq!(status.state, "FAILED");
    assert_eq!(status.error.as_deref(), Some("All 1 documents failed"));
}

#[tokio::test]
async fn revoking_while_throttled_leaves_no_error_logs() {
    let load = ScriptedLoad::new(|n| n >= 1);
    // unlimited back-offs: only the revoke ends the wait
    let h = harness_with(load.clone(), 0).await;
    let request = ScrapeRequest {
        month_url: Some(h.url("/updates/february-2025.pdf")),
        month_label: Some("February 2025".to_string()),
        limit: None,
    };
    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let run = tokio::spawn(async move { pipeline.run("throttled", &request, rx).await });

    while load.samples() < 4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run ends after revoke")
        .unwrap()
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.total_errors, 0);
    assert_eq!(h.records.count_policies().await.unwrap(), 0);
    assert!(h.records.recent_logs(10).await.unwrap().is_empty());

    let status = h.tracker.summary("throttled").await.unwrap();
    assert_eq!(status.state, "FAILED");
    assert_eq!(status.error.as_deref(), Some("Task revoked"));
}

#[tokio::test]
async fn revoking_before_the_first_month_logs_nothing() {
    let load = ScriptedLoad::new(|_| true);
    let h = harness_with(load.clone(), 0).await;
    let (tx, rx) = watch::channel(false);
    let pipeline = h.pipeline.clone();
    let run = tokio::spawn(async move {
        pipeline
            .run("waiting", &ScrapeRequest::default(), rx)
            .await
    });

    while load.samples() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(true).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run ends after revoke")
        .unwrap()
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.total_documents, 0);
    assert!(summary.monthly_summaries.is_empty());
    assert!(h.records.recent_logs(10).await.unwrap().is_empty());
    assert_eq!(
        h.tracker.summary("waiting").await.unwrap().error.as_deref(),
        Some("Task revoked")
    );
}
