//! Task progress state machine over a [`ProgressStore`].
//!
//! Each task is one JSON document under `progress:<task_id>`, rewritten on
//! every update with a fresh TTL (one hour by default). Status only moves
//! forward: `started -> processing* -> {completed | failed}`, and
//! `items_processed` never decreases or exceeds `items_total`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::models::{TaskProgress, TaskStatus};
use crate::store::ProgressStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_PREFIX: &str = "progress";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("corrupt progress record for {task_id}: {source}")]
    Corrupt {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("progress store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// What polling clients see for a task, including tasks not yet started.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    /// `PENDING`, `STARTED`, `PROCESSING`, `COMPLETED`, or `FAILED`.
    pub state: String,
    pub current: u64,
    pub total: u64,
    pub status: String,
    pub progress_percent: f64,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ProgressSummary {
    fn pending() -> Self {
        Self {
            state: "PENDING".to_string(),
            current: 0,
            total: 0,
            status: "Task pending...".to_string(),
            progress_percent: 0.0,
            estimated_completion: None,
            error: None,
        }
    }
}

impl From<&TaskProgress> for ProgressSummary {
    fn from(p: &TaskProgress) -> Self {
        Self {
            state: p.status.as_str().to_uppercase(),
            current: p.items_processed,
            total: p.items_total,
            status: p.current_item_label.clone(),
            progress_percent: (p.percent() * 10.0).round() / 10.0,
            estimated_completion: p.estimated_completion,
            error: p.error_message.clone(),
        }
    }
}

pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    prefix: String,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            ttl: DEFAULT_TTL,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, task_id: &str) -> String {
        format!("{}:{}", self.prefix, task_id)
    }

    async fn save(&self, progress: &TaskProgress) -> Result<(), TrackerError> {
        let json = serde_json::to_string(progress).map_err(|e| TrackerError::Corrupt {
            task_id: progress.task_id.clone(),
            source: e,
        })?;
        self.store
            .set_with_ttl(&self.key(&progress.task_id), &json, self.ttl)
            .await?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<TaskProgress, TrackerError> {
        self.get_progress(task_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(task_id.to_string()))
    }

    pub async fn start_task(
        &self,
        task_id: &str,
        total_items: u64,
    ) -> Result<TaskProgress, TrackerError> {
        let now = self.clock.now();
        let progress = TaskProgress {
            task_id: task_id.to_string(),
            status: TaskStatus::Started,
            items_processed: 0,
            items_total: total_items,
            current_item_label: "Starting".to_string(),
            start_time: now,
            updated_at: now,
            estimated_completion: None,
            error_message: None,
        };
        self.save(&progress).await?;
        debug!(task_id, total_items, "task started");
        Ok(progress)
    }

    /// Records progress. `items_processed` is clamped to
    /// `[stored value, items_total]`.
    pub async fn update_progress(
        &self,
        task_id: &str,
        label: &str,
        items_processed: u64,
        status: TaskStatus,
    ) -> Result<TaskProgress, TrackerError> {
        let mut progress = self.load(task_id).await?;
        check_transition(&progress, status)?;

        let now = self.clock.now();
        progress.status = status;
        progress.current_item_label = label.to_string();
        progress.items_processed = items_processed
            .min(progress.items_total)
            .max(progress.items_processed);
        progress.updated_at = now;
        progress.estimated_completion = estimate_completion(&progress, now);

        self.save(&progress).await?;
        Ok(progress)
    }

    /// Moves the task to a terminal state. Success forces
    /// `items_processed == items_total`.
    pub async fn complete_task(
        &self,
        task_id: &str,
        success: bool,
        error_message: Option<String>,
    ) -> Result<TaskProgress, TrackerError> {
        let mut progress = self.load(task_id).await?;
        let status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        check_transition(&progress, status)?;

        let now = self.clock.now();
        progress.status = status;
        progress.updated_at = now;
        if success {
            progress.items_processed = progress.items_total;
            progress.current_item_label = "Completed".to_string();
            progress.estimated_completion = Some(now);
        } else {
            progress.current_item_label = "Failed".to_string();
            progress.estimated_completion = None;
        }
        progress.error_message = error_message;

        self.save(&progress).await?;
        debug!(task_id, status = status.as_str(), "task finished");
        Ok(progress)
    }

    pub async fn get_progress(&self, task_id: &str) -> Result<Option<TaskProgress>, TrackerError> {
        let Some(json) = self.store.get(&self.key(task_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| TrackerError::Corrupt {
                task_id: task_id.to_string(),
                source: e,
            })
    }

    /// Summary for polling clients. Unknown tasks are `PENDING`.
    pub async fn summary(&self, task_id: &str) -> Result<ProgressSummary, TrackerError> {
        Ok(match self.get_progress(task_id).await? {
            Some(p) => ProgressSummary::from(&p),
            None => ProgressSummary::pending(),
        })
    }

    async fn all(&self) -> Result<Vec<(String, Option<TaskProgress>)>, TrackerError> {
        let prefix = format!("{}:", self.prefix);
        let mut out = Vec::new();
        for key in self.store.scan_prefix(&prefix).await? {
            let Some(json) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<TaskProgress>(&json) {
                Ok(p) => out.push((key, Some(p))),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping corrupt progress record");
                    out.push((key, None));
                }
            }
        }
        Ok(out)
    }

    /// Tasks that are started or processing.
    pub async fn list_active(&self) -> Result<Vec<TaskProgress>, TrackerError> {
        let mut active: Vec<TaskProgress> = self
            .all()
            .await?
            .into_iter()
            .filter_map(|(_, p)| p)
            .filter(|p| !p.status.is_terminal())
            .collect();
        active.sort_by_key(|p| p.start_time);
        Ok(active)
    }

    /// Deletes every record whose start time is older than `max_age_hours`,
    /// whatever its status, plus unreadable records. Returns the count.
    pub async fn cleanup(&self, max_age_hours: u64) -> Result<usize, TrackerError> {
        let cutoff = self.clock.now() - chrono::Duration::hours(max_age_hours as i64);
        let mut removed = 0;
        for (key, progress) in self.all().await? {
            let stale = match &progress {
                Some(p) => p.start_time < cutoff,
                None => true,
            };
            if stale && self.store.delete(&key).await? {
                removed += 1;
            }
        }
        debug!(removed, max_age_hours, "progress cleanup");
        Ok(removed)
    }
}

fn check_transition(progress: &TaskProgress, next: TaskStatus) -> Result<(), TrackerError> {
    if progress.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(TrackerError::InvalidTransition {
            task_id: progress.task_id.clone(),
            from: progress.status.as_str(),
            to: next.as_str(),
        })
    }
}

/// `now + remaining / rate`, where rate is items per second since start.
fn estimate_completion(progress: &TaskProgress, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if progress.items_processed == 0 {
        return None;
    }
    let elapsed_ms = (now - progress.start_time).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    let remaining = progress.items_total.saturating_sub(progress.items_processed);
    let ms_per_item = elapsed_ms as f64 / progress.items_processed as f64;
    let eta_ms = (ms_per_item * remaining as f64).round() as i64;
    Some(now + chrono::Duration::milliseconds(eta_ms))
}
