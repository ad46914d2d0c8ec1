//! Periodic resource sampling with explicit start and stop. The most recent
//! assessment is shared through [`LatestAssessment`] so readers do not
//! sample on their own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use policy_harvest_core::throttle::{ResourceMonitor, ThrottleAssessment};

/// Read side of the loop's most recent assessment.
#[derive(Clone, Default)]
pub struct LatestAssessment(Arc<RwLock<Option<ThrottleAssessment>>>);

impl LatestAssessment {
    pub async fn get(&self) -> Option<ThrottleAssessment> {
        self.0.read().await.clone()
    }

    async fn set(&self, assessment: ThrottleAssessment) {
        *self.0.write().await = Some(assessment);
    }
}

pub struct MonitorLoop {
    monitor: Arc<ResourceMonitor>,
    period: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    latest: LatestAssessment,
}

impl MonitorLoop {
    pub fn new(monitor: Arc<ResourceMonitor>, period: Duration) -> Self {
        Self {
            monitor,
            period,
            shutdown_tx: None,
            handle: None,
            latest: LatestAssessment::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Most recent assessment, if a tick has completed.
    pub async fn latest(&self) -> Option<ThrottleAssessment> {
        self.latest.get().await
    }

    pub fn latest_handle(&self) -> LatestAssessment {
        self.latest.clone()
    }

    /// Starts sampling. A second call while running does nothing.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let monitor = self.monitor.clone();
        let latest = self.latest.clone();
        let period = self.period;
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let assessment = monitor.assess().await;
                        match &assessment.snapshot {
                            Some(s) => info!(
                                cpu = s.cpu_percent,
                                memory = s.memory_percent,
                                available_gb = s.available_memory_gb,
                                throttle = assessment.throttle,
                                breaker = assessment.breaker_active,
                                "resource snapshot"
                            ),
                            None => warn!(
                                reasons = ?assessment.reasons,
                                throttle = assessment.throttle,
                                "resource snapshot unavailable"
                            ),
                        }
                        latest.set(assessment).await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            info!("resource monitor stopped");
        }));
        info!(period_secs = self.period.as_secs_f64(), "resource monitor started");
    }

    /// Signals the loop and waits for it to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "resource monitor task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use policy_harvest_core::models::ResourceSnapshot;
    use policy_harvest_core::throttle::{ResourceProbe, ThrottleConfig};

    struct Idle;

    #[async_trait]
    impl ResourceProbe for Idle {
        async fn sample(&self) -> Result<ResourceSnapshot> {
            Ok(ResourceSnapshot {
                cpu_percent: 5.0,
                memory_percent: 20.0,
                available_memory_gb: 16.0,
                disk_percent: 10.0,
                process_memory_mb: 40.0,
                timestamp: Utc::now(),
            })
        }

        fn cpu_count(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn start_tick_stop() {
        let monitor = Arc::new(ResourceMonitor::new(Arc::new(Idle), ThrottleConfig::default()));
        let mut lp = MonitorLoop::new(monitor, Duration::from_millis(10));
        lp.start();
        assert!(lp.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        lp.stop().await;
        assert!(!lp.is_running());

        let latest = lp.latest().await.unwrap();
        assert!(!latest.throttle);
        assert!(lp.latest_handle().get().await.is_some());
    }
}
