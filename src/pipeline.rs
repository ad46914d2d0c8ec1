//! Scrape orchestration.
//!
//! A task runs in two phases:
//!
//! 1. **Discovery.** The listing page (or a single requested monthly PDF)
//!    yields monthly update PDFs; each is fetched, laid out, and resolved
//!    into titled policy links, pausing between monthly fetches. Links are
//!    deduplicated across months; links off the source host are logged as
//!    skipped and never fetched.
//! 2. **Documents.** Policy PDFs are processed by a pool of tokio tasks
//!    bounded by a semaphore. Each unit waits out resource throttling,
//!    skips URLs already stored, fetches, extracts, recognizes, validates,
//!    and persists, writing one scraping-log row whatever the outcome.
//!
//! The tracker is started once the document count is known and updated
//! after every unit. Cancellation is checked between units; bundles already
//! stored stay stored.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use policy_harvest_core::error::HarvestError;
use policy_harvest_core::listing::ListingParser;
use policy_harvest_core::models::{
    ExtractionLink, MonthlyLink, ScrapeLog, TaskStatus, ValidationResult,
};
use policy_harvest_core::recognize::RecognitionContext;
use policy_harvest_core::store::{InsertOutcome, RecordStore};
use policy_harvest_core::throttle::ResourceMonitor;
use policy_harvest_core::tracker::ProgressTracker;
use policy_harvest_core::validate::{is_scrapable_url, ValidationSummary};

use crate::config::Config;
use crate::document::DocumentExtractor;
use crate::extract;
use crate::fetch::Fetcher;
use crate::progress::{NoProgress, ScrapeProgressEvent, ScrapeProgressReporter};
use crate::tasks::TaskRegistry;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub listing_url: String,
    pub base_url: String,
    pub page_delay: Duration,
    pub backoff: Duration,
    /// 0 waits for resources indefinitely.
    pub max_backoffs: u32,
    /// 0 sizes the pool from current load.
    pub workers: usize,
    /// 0 means every month on the listing page.
    pub max_months: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            listing_url: config.source.listing_url.clone(),
            base_url: config.source.base_url.clone(),
            page_delay: Duration::from_millis(config.source.page_delay_ms),
            backoff: Duration::from_millis(config.throttle.backoff_ms),
            max_backoffs: config.throttle.max_backoffs,
            workers: config.workers.count,
            max_months: config.source.max_months,
        }
    }
}

/// What to scrape. Without `month_url` the listing page is crawled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrapeRequest {
    #[serde(default)]
    pub month_url: Option<String>,
    #[serde(default)]
    pub month_label: Option<String>,
    /// Cap on policy documents processed.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthSummary {
    pub month_label: String,
    pub url: String,
    pub links_found: usize,
    pub policies_scraped: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub task_id: String,
    pub total_monthly_pages: usize,
    pub total_documents: usize,
    pub total_policies_scraped: usize,
    pub total_skipped: usize,
    pub total_errors: usize,
    pub execution_time_secs: f64,
    pub cancelled: bool,
    /// Validation outcomes of every document that reached recognition.
    pub validation: ValidationSummary,
    pub monthly_summaries: Vec<MonthSummary>,
}

impl ScrapeSummary {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            total_monthly_pages: 0,
            total_documents: 0,
            total_policies_scraped: 0,
            total_skipped: 0,
            total_errors: 0,
            execution_time_secs: 0.0,
            cancelled: false,
            validation: ValidationSummary::default(),
            monthly_summaries: Vec::new(),
        }
    }
}

struct Unit {
    link: ExtractionLink,
    month_label: Option<String>,
    month_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Stored,
    Skipped,
    Failed,
    Cancelled,
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

#[derive(Clone)]
pub struct Pipeline {
    records: Arc<dyn RecordStore>,
    tracker: Arc<ProgressTracker>,
    monitor: Arc<ResourceMonitor>,
    fetcher: Fetcher,
    extractor: Arc<DocumentExtractor>,
    listing: Arc<ListingParser>,
    /// Host of `base_url`; policy links elsewhere are not fetched.
    source_host: Option<Arc<str>>,
    settings: Arc<PipelineSettings>,
    reporter: Arc<dyn ScrapeProgressReporter>,
}

impl Pipeline {
    pub fn new(
        records: Arc<dyn RecordStore>,
        tracker: Arc<ProgressTracker>,
        monitor: Arc<ResourceMonitor>,
        fetcher: Fetcher,
        extractor: Arc<DocumentExtractor>,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let source_host = Url::parse(&settings.base_url)
            .ok()
            .and_then(|u| u.host_str().map(Arc::from));
        Ok(Self {
            records,
            tracker,
            monitor,
            fetcher,
            extractor,
            listing: Arc::new(ListingParser::new()?),
            source_host,
            settings: Arc::new(settings),
            reporter: Arc::new(NoProgress),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ScrapeProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Runs one scrape task to completion, cancellation, or failure. The
    /// tracker always ends in a terminal state for `task_id`.
    pub async fn run(
        &self,
        task_id: &str,
        request: &ScrapeRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<ScrapeSummary> {
        let started = Instant::now();
        let mut summary = ScrapeSummary::new(task_id);

        let months = match self.discover_months(request).await {
            Ok(months) => months,
            Err(e) => {
                error!(task_id, error = %e, "could not discover monthly updates");
                self.log(ScrapeLog::error(
                    &self.settings.listing_url,
                    e.to_string(),
                    started.elapsed().as_secs_f64(),
                ))
                .await;
                self.tracker.start_task(task_id, 0).await?;
                self.tracker
                    .complete_task(task_id, false, Some(e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };
        summary.total_monthly_pages = months.len();
        info!(task_id, months = months.len(), "discovered monthly updates");

        let units = self
            .collect_units(&months, request, &cancel, &mut summary)
            .await;
        summary.total_documents = units.len();

        let total = units.len() as u64;
        self.tracker.start_task(task_id, total).await?;
        if !summary.cancelled && !units.is_empty() {
            self.process_units(task_id, units, &cancel, &mut summary)
                .await;
        }
        if is_cancelled(&cancel) {
            summary.cancelled = true;
        }

        summary.execution_time_secs = started.elapsed().as_secs_f64();
        let failure = if summary.cancelled {
            Some("Task revoked".to_string())
        } else if total > 0 && summary.total_policies_scraped + summary.total_skipped == 0 {
            Some(format!("All {} documents failed", total))
        } else {
            None
        };
        let last = self
            .tracker
            .complete_task(task_id, failure.is_none(), failure)
            .await?;
        self.reporter.report(ScrapeProgressEvent::Task(last));

        info!(
            task_id,
            scraped = summary.total_policies_scraped,
            skipped = summary.total_skipped,
            errors = summary.total_errors,
            cancelled = summary.cancelled,
            secs = summary.execution_time_secs,
            "scrape finished"
        );
        Ok(summary)
    }

    async fn discover_months(
        &self,
        request: &ScrapeRequest,
    ) -> Result<Vec<MonthlyLink>, HarvestError> {
        if let Some(url) = &request.month_url {
            return Ok(vec![MonthlyLink {
                month_label: request.month_label.clone().unwrap_or_default(),
                url: url.clone(),
                link_text: String::new(),
            }]);
        }

        self.reporter.report(ScrapeProgressEvent::Discovering {
            source: self.settings.listing_url.clone(),
        });
        let base = Url::parse(&self.settings.base_url).map_err(|e| HarvestError::Network {
            url: self.settings.base_url.clone(),
            message: e.to_string(),
        })?;
        let html = self.fetcher.fetch_text(&self.settings.listing_url).await?;
        let mut months = self.listing.parse(&html, &base);
        if self.settings.max_months > 0 {
            months.truncate(self.settings.max_months);
        }
        Ok(months)
    }

    /// Phase one: policy links of every month, deduplicated, capped by the
    /// request limit.
    async fn collect_units(
        &self,
        months: &[MonthlyLink],
        request: &ScrapeRequest,
        cancel: &watch::Receiver<bool>,
        summary: &mut ScrapeSummary,
    ) -> Vec<Unit> {
        let mut units = Vec::new();
        let mut seen = HashSet::new();

        for (index, month) in months.iter().enumerate() {
            if is_cancelled(cancel) {
                summary.cancelled = true;
                break;
            }
            if index > 0 && !self.settings.page_delay.is_zero() {
                tokio::time::sleep(self.settings.page_delay).await;
            }

            let mut month_summary = MonthSummary {
                month_label: month.month_label.clone(),
                url: month.url.clone(),
                links_found: 0,
                policies_scraped: 0,
                skipped: 0,
                errors: 0,
            };

            let started = Instant::now();
            let links = match self.wait_for_resources(cancel).await {
                Ok(()) => self.month_links(&month.url).await.map_err(|e| e.to_string()),
                Err(_) if is_cancelled(cancel) => {
                    summary.cancelled = true;
                    break;
                }
                Err(reason) => Err(reason),
            };
            match links {
                Ok(links) => {
                    month_summary.links_found = links.len();
                    self.reporter.report(ScrapeProgressEvent::Month {
                        label: month.month_label.clone(),
                        index,
                        total: months.len(),
                        links: links.len(),
                    });
                    let month_label =
                        Some(month.month_label.clone()).filter(|l| !l.trim().is_empty());
                    for link in links {
                        if !seen.insert(link.url.clone()) {
                            continue;
                        }
                        if let Some(host) = self.source_host.as_deref() {
                            if !is_scrapable_url(&link.url, host) {
                                warn!(url = %link.url, host, "policy link outside source host");
                                month_summary.skipped += 1;
                                summary.total_skipped += 1;
                                self.log(ScrapeLog::skipped(
                                    &link.url,
                                    format!("outside {}", host),
                                ))
                                .await;
                                continue;
                            }
                        }
                        units.push(Unit {
                            link,
                            month_label: month_label.clone(),
                            month_index: index,
                        });
                    }
                }
                Err(message) => {
                    warn!(url = %month.url, error = %message, "monthly update failed");
                    month_summary.errors += 1;
                    summary.total_errors += 1;
                    self.log(ScrapeLog::error(
                        &month.url,
                        message,
                        started.elapsed().as_secs_f64(),
                    ))
                    .await;
                }
            }
            summary.monthly_summaries.push(month_summary);
        }

        if let Some(limit) = request.limit {
            units.truncate(limit);
        }
        units
    }

    async fn month_links(&self, url: &str) -> Result<Vec<ExtractionLink>, HarvestError> {
        let bytes = self.fetcher.fetch_bytes(url).await?;
        let extractor = self.extractor.clone();
        tokio::task::spawn_blocking(move || extractor.links(&bytes))
            .await
            .map_err(|e| HarvestError::Decode(e.to_string()))?
    }

    /// Phase two: the worker pool.
    async fn process_units(
        &self,
        task_id: &str,
        units: Vec<Unit>,
        cancel: &watch::Receiver<bool>,
        summary: &mut ScrapeSummary,
    ) {
        let workers = if self.settings.workers > 0 {
            self.settings.workers
        } else {
            self.monitor.optimal_worker_count().await
        };
        info!(task_id, documents = units.len(), workers, "processing policy documents");

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut set = JoinSet::new();
        for unit in units {
            let pipeline = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let (outcome, validation) = match semaphore.acquire_owned().await {
                    Ok(_permit) => pipeline.process_unit(&unit, &cancel).await,
                    Err(_) => (Outcome::Cancelled, None),
                };
                (unit, outcome, validation)
            });
        }

        let mut processed = 0u64;
        while let Some(joined) = set.join_next().await {
            processed += 1;
            let (unit, outcome, validation) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(task_id, error = %e, "worker panicked");
                    summary.total_errors += 1;
                    continue;
                }
            };

            if let Some(result) = &validation {
                summary.validation.record(result);
            }
            let month = summary.monthly_summaries.get_mut(unit.month_index);
            match outcome {
                Outcome::Stored => {
                    summary.total_policies_scraped += 1;
                    if let Some(m) = month {
                        m.policies_scraped += 1;
                    }
                }
                Outcome::Skipped => {
                    summary.total_skipped += 1;
                    if let Some(m) = month {
                        m.skipped += 1;
                    }
                }
                Outcome::Failed => {
                    summary.total_errors += 1;
                    if let Some(m) = month {
                        m.errors += 1;
                    }
                }
                Outcome::Cancelled => summary.cancelled = true,
            }

            match self
                .tracker
                .update_progress(task_id, &unit.link.title, processed, TaskStatus::Processing)
                .await
            {
                Ok(progress) => self.reporter.report(ScrapeProgressEvent::Task(progress)),
                Err(e) => warn!(task_id, error = %e, "progress update failed"),
            }
        }
    }

    /// One policy document. The validation result is returned whenever
    /// recognition succeeded, valid or not.
    async fn process_unit(
        &self,
        unit: &Unit,
        cancel: &watch::Receiver<bool>,
    ) -> (Outcome, Option<ValidationResult>) {
        let url = unit.link.url.as_str();
        if is_cancelled(cancel) {
            return (Outcome::Cancelled, None);
        }
        if let Err(reason) = self.wait_for_resources(cancel).await {
            if is_cancelled(cancel) {
                return (Outcome::Cancelled, None);
            }
            warn!(url, error = %reason, "gave up waiting for resources");
            self.log(ScrapeLog::error(url, reason, 0.0)).await;
            return (Outcome::Failed, None);
        }

        let started = Instant::now();
        match self.records.policy_exists(url).await {
            Ok(true) => {
                debug!(url, "already stored, skipping");
                self.log(ScrapeLog::skipped(url, "already stored")).await;
                return (Outcome::Skipped, None);
            }
            Ok(false) => {}
            Err(e) => warn!(url, error = %e, "existence check failed"),
        }

        let result = match self.scrape_document(unit).await {
            Ok(result) => result,
            Err(e) => return (self.document_failed(url, &e, started).await, None),
        };
        if !result.is_valid {
            let e = HarvestError::Validation {
                url: url.to_string(),
                errors: result.errors.clone(),
            };
            return (self.document_failed(url, &e, started).await, Some(result));
        }

        let bundle = &result.cleaned;
        let outcome = match self.records.insert_bundle(bundle).await {
            Ok(InsertOutcome::Inserted(id)) => {
                info!(url, id = %id, title = %bundle.record.title, codes = bundle.medical_codes.len(), "policy stored");
                self.log(ScrapeLog::success(url, 1, started.elapsed().as_secs_f64()))
                    .await;
                Outcome::Stored
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!(url, "stored concurrently, skipping");
                self.log(ScrapeLog::skipped(url, "duplicate")).await;
                Outcome::Skipped
            }
            Err(e) => {
                error!(url, error = %e, "failed to store policy");
                self.log(ScrapeLog::error(
                    url,
                    format!("store: {:#}", e),
                    started.elapsed().as_secs_f64(),
                ))
                .await;
                Outcome::Failed
            }
        };
        (outcome, Some(result))
    }

    async fn document_failed(&self, url: &str, e: &HarvestError, started: Instant) -> Outcome {
        warn!(url, kind = e.kind(), error = %e, "policy document failed");
        self.log(ScrapeLog::error(url, e.to_string(), started.elapsed().as_secs_f64()))
            .await;
        Outcome::Failed
    }

    async fn scrape_document(&self, unit: &Unit) -> Result<ValidationResult, HarvestError> {
        let bytes = self.fetcher.fetch_bytes(&unit.link.url).await?;
        let extractor = self.extractor.clone();
        let ctx = RecognitionContext::new(unit.link.url.clone())
            .with_month_label(unit.month_label.clone())
            .with_comments(Some(unit.link.comments.clone()));
        let title = unit.link.title.clone();
        tokio::task::spawn_blocking(move || {
            let text = extract::extract_text(&bytes)?;
            extractor.validate_text(&text, &ctx, Some(&title))
        })
        .await
        .map_err(|e| HarvestError::Decode(e.to_string()))?
    }

    /// Sleeps in back-off steps while the monitor says to throttle.
    async fn wait_for_resources(&self, cancel: &watch::Receiver<bool>) -> Result<(), String> {
        let mut backoffs = 0u32;
        while self.monitor.should_throttle().await {
            if is_cancelled(cancel) {
                return Err("cancelled while throttled".to_string());
            }
            if self.settings.max_backoffs > 0 && backoffs >= self.settings.max_backoffs {
                return Err(format!("resources unavailable after {} back-offs", backoffs));
            }
            backoffs += 1;
            debug!(backoffs, "throttled, backing off");
            tokio::time::sleep(self.settings.backoff).await;
        }
        Ok(())
    }

    async fn log(&self, entry: ScrapeLog) {
        if let Err(e) = self.records.insert_log(&entry).await {
            warn!(url = %entry.url, error = %e, "failed to write scraping log");
        }
    }
}

/// Starts a scrape in the background and returns its task ID at once.
pub fn spawn_scrape(pipeline: Pipeline, registry: TaskRegistry, request: ScrapeRequest) -> String {
    let task_id = uuid::Uuid::new_v4().to_string();
    let cancel = registry.register(&task_id);
    let id = task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.run(&id, &request, cancel).await {
            error!(task_id = %id, error = %e, "scrape task failed");
        }
        registry.finish(&id);
    });
    task_id
}
