//! CLI command implementations. Results go to stdout; logs and progress go
//! to stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::warn;

use policy_harvest_core::recognize::RecognitionContext;

use crate::config::Config;
use crate::document::DocumentExtractor;
use crate::migrate;
use crate::pipeline::{ScrapeRequest, ScrapeSummary};
use crate::progress::ProgressMode;
use crate::services::{build_monitor, build_tracker, Services};

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

/// Runs a scrape in the foreground. Ctrl-C revokes it; documents already
/// stored are kept.
pub async fn run_scrape(
    config: &Config,
    request: ScrapeRequest,
    mode: ProgressMode,
) -> Result<()> {
    let services = Services::from_config(config).await?;
    let pipeline = services
        .pipeline(config)?
        .with_reporter(Arc::from(mode.reporter()));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight documents");
            cancel_tx.send_replace(true);
        }
    });

    let task_id = uuid::Uuid::new_v4().to_string();
    let summary = pipeline.run(&task_id, &request, cancel_rx).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &ScrapeSummary) {
    println!("Scrape summary (task {}):", summary.task_id);
    println!("  monthly pages:    {}", summary.total_monthly_pages);
    println!("  policy documents: {}", summary.total_documents);
    println!("  scraped:          {}", summary.total_policies_scraped);
    println!("  skipped:          {}", summary.total_skipped);
    println!("  errors:           {}", summary.total_errors);
    println!(
        "  validation:       {}/{} valid ({:.1}%), {} warning(s)",
        summary.validation.valid,
        summary.validation.total,
        summary.validation.success_rate,
        summary.validation.total_warnings
    );
    println!("  execution time:   {:.2}s", summary.execution_time_secs);
    if summary.cancelled {
        println!("  (cancelled)");
    }
    for month in &summary.monthly_summaries {
        println!(
            "  {:<20} links={} scraped={} skipped={} errors={}",
            if month.month_label.is_empty() {
                month.url.as_str()
            } else {
                month.month_label.as_str()
            },
            month.links_found,
            month.policies_scraped,
            month.skipped,
            month.errors
        );
    }
}

/// Offline extraction of a local PDF: titled links of a monthly update, or
/// validated bundles of a policy document, as JSON.
pub fn run_extract(
    config: &Config,
    path: &Path,
    links: bool,
    month_label: Option<String>,
    source_url: Option<String>,
) -> Result<()> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let extractor = DocumentExtractor::new(&config.source.policy_pdf_base)?;

    if links {
        let links = extractor.links(&bytes)?;
        println!("{}", serde_json::to_string_pretty(&links)?);
        return Ok(());
    }

    let source_url = match source_url {
        Some(url) => url,
        None => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document.pdf".to_string());
            format!(
                "{}/{}",
                config.source.policy_pdf_base.trim_end_matches('/'),
                name
            )
        }
    };
    let ctx = RecognitionContext::new(source_url).with_month_label(month_label);
    let bundles = extractor.extract_from_document(&bytes, &ctx);
    if bundles.is_empty() {
        bail!("No valid policy record extracted from {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&bundles)?);
    Ok(())
}

pub async fn run_status(config: &Config, task_id: &str) -> Result<()> {
    let tracker = build_tracker(&config.progress).await?;
    let summary = tracker.summary(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub async fn run_tasks(config: &Config) -> Result<()> {
    let tracker = build_tracker(&config.progress).await?;
    let active = tracker.list_active().await?;
    if active.is_empty() {
        println!("No active tasks.");
        return Ok(());
    }
    println!(
        "{:<38} {:<11} {:>9} {:>8}  CURRENT",
        "TASK", "STATUS", "PROGRESS", "PERCENT"
    );
    for task in active {
        println!(
            "{:<38} {:<11} {:>4}/{:<4} {:>7.1}%  {}",
            task.task_id,
            task.status.as_str(),
            task.items_processed,
            task.items_total,
            task.percent(),
            task.current_item_label
        );
    }
    Ok(())
}

pub async fn run_cleanup(config: &Config, max_age_hours: u64) -> Result<()> {
    let tracker = build_tracker(&config.progress).await?;
    let removed = tracker.cleanup(max_age_hours).await?;
    println!(
        "Removed {} progress record(s) older than {}h",
        removed, max_age_hours
    );
    Ok(())
}

pub async fn run_resources(config: &Config) -> Result<()> {
    let monitor = build_monitor(&config.throttle)?;
    let assessment = monitor.assess().await;
    let workers = monitor.optimal_worker_count().await;
    let out = serde_json::json!({
        "assessment": assessment,
        "optimal_workers": workers,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
