//! Resource-aware throttling and worker sizing.
//!
//! [`ResourceMonitor::should_throttle`] is consulted before each unit of
//! work. It samples CPU and memory through an injected [`ResourceProbe`]
//! (and optionally times a [`HealthProbe`]); CPU and memory both over
//! threshold in one sample trips a circuit breaker that keeps throttling on
//! for the cooldown period regardless of later samples.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::models::ResourceSnapshot;

/// Samples host resource usage.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> Result<ResourceSnapshot>;

    /// Logical CPU count.
    fn cpu_count(&self) -> usize;
}

/// Times a responsiveness check against a dependent service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Round-trip latency of one check. Implementations bound the wait.
    async fn check(&self) -> Result<Duration>;
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub cooldown: Duration,
    pub max_probe_latency: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu_threshold: 70.0,
            memory_threshold: 80.0,
            cooldown: Duration::from_secs(60),
            max_probe_latency: Duration::from_secs(2),
        }
    }
}

/// One throttle decision and what led to it.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleAssessment {
    pub throttle: bool,
    pub breaker_active: bool,
    pub breaker_until: Option<DateTime<Utc>>,
    pub reasons: Vec<String>,
    pub snapshot: Option<ResourceSnapshot>,
    pub probe_latency_ms: Option<u64>,
}

pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    health: Option<Arc<dyn HealthProbe>>,
    clock: Arc<dyn Clock>,
    config: ThrottleConfig,
    breaker_until: Mutex<Option<DateTime<Utc>>>,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn ResourceProbe>, config: ThrottleConfig) -> Self {
        Self {
            probe,
            health: None,
            clock: Arc::new(SystemClock),
            config,
            breaker_until: Mutex::new(None),
        }
    }

    pub fn with_health_probe(mut self, health: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub async fn should_throttle(&self) -> bool {
        self.assess().await.throttle
    }

    /// Active breaker deadline, clearing it once the cooldown has passed.
    fn active_breaker(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut until = self
            .breaker_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *until {
            Some(deadline) if now < deadline => Some(deadline),
            Some(_) => {
                debug!("circuit breaker reset");
                *until = None;
                None
            }
            None => None,
        }
    }

    fn trip_breaker(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let cooldown = chrono::Duration::from_std(self.config.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let deadline = now + cooldown;
        *self
            .breaker_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(deadline);
        deadline
    }

    pub async fn assess(&self) -> ThrottleAssessment {
        let now = self.clock.now();
        if let Some(deadline) = self.active_breaker(now) {
            return ThrottleAssessment {
                throttle: true,
                breaker_active: true,
                breaker_until: Some(deadline),
                reasons: vec!["circuit breaker active".to_string()],
                snapshot: None,
                probe_latency_ms: None,
            };
        }

        let snapshot = match self.probe.sample().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "resource sample failed, throttling");
                return ThrottleAssessment {
                    throttle: true,
                    breaker_active: false,
                    breaker_until: None,
                    reasons: vec![format!("resource metrics unavailable: {}", e)],
                    snapshot: None,
                    probe_latency_ms: None,
                };
            }
        };

        let mut reasons = Vec::new();
        let cpu_high = snapshot.cpu_percent > self.config.cpu_threshold;
        let memory_high = snapshot.memory_percent > self.config.memory_threshold;
        if cpu_high {
            reasons.push(format!("cpu {:.1}%", snapshot.cpu_percent));
        }
        if memory_high {
            reasons.push(format!("memory {:.1}%", snapshot.memory_percent));
        }

        let mut breaker_until = None;
        if cpu_high && memory_high {
            let deadline = self.trip_breaker(now);
            warn!(
                cpu = snapshot.cpu_percent,
                memory = snapshot.memory_percent,
                until = %deadline,
                "circuit breaker tripped"
            );
            breaker_until = Some(deadline);
        }

        let mut probe_latency_ms = None;
        if let Some(health) = &self.health {
            match health.check().await {
                Ok(latency) => {
                    probe_latency_ms = Some(latency.as_millis() as u64);
                    if latency > self.config.max_probe_latency {
                        reasons.push(format!("probe slow ({} ms)", latency.as_millis()));
                    }
                }
                Err(e) => reasons.push(format!("probe failed: {}", e)),
            }
        }

        let throttle = !reasons.is_empty();
        if throttle {
            debug!(reasons = ?reasons, "throttling");
        }
        ThrottleAssessment {
            throttle,
            breaker_active: breaker_until.is_some(),
            breaker_until,
            reasons,
            snapshot: Some(snapshot),
            probe_latency_ms,
        }
    }

    /// Worker count for the current load. One worker when metrics are
    /// unavailable.
    pub async fn optimal_worker_count(&self) -> usize {
        match self.probe.sample().await {
            Ok(snapshot) => worker_count_for(self.probe.cpu_count(), &snapshot),
            Err(e) => {
                warn!(error = %e, "resource sample failed, using one worker");
                1
            }
        }
    }
}

/// `min(cores / 2, 4)`, capped at 1 below 2 GB free and 2 below 4 GB free,
/// one fewer when CPU is above 60%, never below 1.
pub fn worker_count_for(cores: usize, snapshot: &ResourceSnapshot) -> usize {
    let mut workers = (cores / 2).min(4);
    if snapshot.available_memory_gb < 2.0 {
        workers = 1;
    } else if snapshot.available_memory_gb < 4.0 {
        workers = workers.min(2);
    }
    if snapshot.cpu_percent > 60.0 {
        workers = workers.saturating_sub(1);
    }
    workers.max(1)
}
