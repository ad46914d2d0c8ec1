//! Wiring of stores, tracker, monitor, and pipeline from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use policy_harvest_core::store::memory::InMemoryProgressStore;
use policy_harvest_core::store::{ProgressStore, RecordStore};
use policy_harvest_core::throttle::{ResourceMonitor, ThrottleConfig};
use policy_harvest_core::tracker::ProgressTracker;

use crate::config::{Config, ProgressConfig, ThrottleSettings};
use crate::db;
use crate::document::DocumentExtractor;
use crate::fetch::{Fetcher, HttpHealthProbe};
use crate::migrate;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::redis_progress::RedisProgressStore;
use crate::sampler::ProcResourceProbe;
use crate::sqlite_store::SqliteRecordStore;

pub struct Services {
    pub records: Arc<dyn RecordStore>,
    pub tracker: Arc<ProgressTracker>,
    pub monitor: Arc<ResourceMonitor>,
    pub fetcher: Fetcher,
    pub extractor: Arc<DocumentExtractor>,
}

impl Services {
    /// Opens the database (applying migrations), the progress backend, and
    /// the resource monitor.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool));

        Ok(Self {
            records,
            tracker: Arc::new(build_tracker(&config.progress).await?),
            monitor: Arc::new(build_monitor(&config.throttle)?),
            fetcher: Fetcher::new(&config.source)?,
            extractor: Arc::new(DocumentExtractor::new(&config.source.policy_pdf_base)?),
        })
    }

    pub fn pipeline(&self, config: &Config) -> Result<Pipeline> {
        Pipeline::new(
            self.records.clone(),
            self.tracker.clone(),
            self.monitor.clone(),
            self.fetcher.clone(),
            self.extractor.clone(),
            PipelineSettings::from_config(config),
        )
    }
}

pub async fn progress_store(config: &ProgressConfig) -> Result<Arc<dyn ProgressStore>> {
    Ok(match config.backend.as_str() {
        "redis" => Arc::new(RedisProgressStore::connect(&config.redis_url).await?),
        _ => {
            info!("using in-process progress store");
            Arc::new(InMemoryProgressStore::new())
        }
    })
}

pub async fn build_tracker(config: &ProgressConfig) -> Result<ProgressTracker> {
    Ok(ProgressTracker::new(progress_store(config).await?)
        .with_ttl(Duration::from_secs(config.ttl_secs))
        .with_prefix(config.key_prefix.clone()))
}

pub fn throttle_config(settings: &ThrottleSettings) -> ThrottleConfig {
    ThrottleConfig {
        cpu_threshold: settings.cpu_threshold,
        memory_threshold: settings.memory_threshold,
        cooldown: Duration::from_secs(settings.cooldown_secs),
        max_probe_latency: Duration::from_millis(settings.probe_latency_ms),
    }
}

pub fn build_monitor(settings: &ThrottleSettings) -> Result<ResourceMonitor> {
    let mut monitor =
        ResourceMonitor::new(Arc::new(ProcResourceProbe::new()), throttle_config(settings));
    if let Some(url) = &settings.probe_url {
        let probe = HttpHealthProbe::new(url, Duration::from_millis(settings.probe_timeout_ms))?;
        monitor = monitor.with_health_probe(Arc::new(probe));
    }
    Ok(monitor)
}
