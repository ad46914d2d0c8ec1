//! Host resource sampling from `/proc`.
//!
//! CPU usage is the busy share of jiffies between two `/proc/stat` reads at
//! least `CPU_SAMPLE_GAP` apart. The first sample pauses for the gap; later
//! samples inside the gap reuse the last percent. Non-Linux hosts (or a
//! missing `/proc`) fail the sample, which the monitor treats as a reason to
//! throttle.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use policy_harvest_core::models::ResourceSnapshot;
use policy_harvest_core::throttle::ResourceProbe;

const CPU_SAMPLE_GAP: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MemInfo {
    total_kb: u64,
    available_kb: u64,
}

/// Last `/proc/stat` reading a percent was computed against.
#[derive(Debug, Clone, Copy)]
struct CpuWindow {
    base: CpuTimes,
    base_at: Instant,
    percent: f64,
}

impl CpuWindow {
    /// Moves the window forward only when `current` is a full gap past the
    /// base and at least one jiffy has elapsed; otherwise keeps the last percent.
    fn observe(&mut self, current: CpuTimes, now: Instant) -> f64 {
        if now.saturating_duration_since(self.base_at) >= CPU_SAMPLE_GAP
            && current.total > self.base.total
        {
            self.percent = cpu_delta_percent(self.base, current);
            self.base = current;
            self.base_at = now;
        }
        self.percent
    }
}

pub struct ProcResourceProbe {
    cpu: Mutex<Option<CpuWindow>>,
    disk_path: String,
}

impl ProcResourceProbe {
    pub fn new() -> Self {
        Self {
            cpu: Mutex::new(None),
            disk_path: "/".to_string(),
        }
    }

    async fn cpu_percent(&self) -> Result<f64> {
        let window = *self.cpu.lock().unwrap_or_else(PoisonError::into_inner);
        let window = match window {
            Some(mut w) => {
                if w.base_at.elapsed() < CPU_SAMPLE_GAP {
                    return Ok(w.percent);
                }
                let current = read_cpu_times().await?;
                w.observe(current, Instant::now());
                w
            }
            None => {
                let first = read_cpu_times().await?;
                tokio::time::sleep(CPU_SAMPLE_GAP).await;
                let current = read_cpu_times().await?;
                CpuWindow {
                    base: current,
                    base_at: Instant::now(),
                    percent: cpu_delta_percent(first, current),
                }
            }
        };
        *self.cpu.lock().unwrap_or_else(PoisonError::into_inner) = Some(window);
        Ok(window.percent)
    }
}

impl Default for ProcResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for ProcResourceProbe {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let cpu_percent = self.cpu_percent().await?;
        let meminfo = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .context("Failed to read /proc/meminfo")?;
        let mem = parse_meminfo(&meminfo).ok_or_else(|| anyhow!("unreadable /proc/meminfo"))?;
        let status = tokio::fs::read_to_string("/proc/self/status")
            .await
            .unwrap_or_default();
        let disk_percent = disk_usage_percent(&self.disk_path).await.unwrap_or_else(|e| {
            debug!(error = %e, "disk usage unavailable");
            0.0
        });

        let used_kb = mem.total_kb.saturating_sub(mem.available_kb);
        Ok(ResourceSnapshot {
            cpu_percent,
            memory_percent: if mem.total_kb == 0 {
                0.0
            } else {
                used_kb as f64 / mem.total_kb as f64 * 100.0
            },
            available_memory_gb: mem.available_kb as f64 / (1024.0 * 1024.0),
            disk_percent,
            process_memory_mb: parse_vm_rss_kb(&status).unwrap_or(0) as f64 / 1024.0,
            timestamp: Utc::now(),
        })
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

async fn read_cpu_times() -> Result<CpuTimes> {
    let stat = tokio::fs::read_to_string("/proc/stat")
        .await
        .context("Failed to read /proc/stat")?;
    parse_cpu_times(&stat).ok_or_else(|| anyhow!("unreadable /proc/stat"))
}

/// Aggregate `cpu` line. Idle and iowait count as not busy.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn cpu_delta_percent(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let busy = after.busy.saturating_sub(before.busy);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn meminfo_kb(meminfo: &str, key: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with(key) && l[key.len()..].starts_with(':'))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn parse_meminfo(meminfo: &str) -> Option<MemInfo> {
    let total_kb = meminfo_kb(meminfo, "MemTotal")?;
    let available_kb = meminfo_kb(meminfo, "MemAvailable")
        .or_else(|| meminfo_kb(meminfo, "MemFree"))
        .unwrap_or(0);
    Some(MemInfo {
        total_kb,
        available_kb,
    })
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    meminfo_kb(status, "VmRSS")
}

/// Use% column of `df -P` for the filesystem holding `path`.
async fn disk_usage_percent(path: &str) -> Result<f64> {
    let output = tokio::process::Command::new("df")
        .arg("-P")
        .arg(path)
        .output()
        .await
        .context("Failed to run df")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_df_percent(&stdout).ok_or_else(|| anyhow!("unexpected df output"))
}

fn parse_df_percent(output: &str) -> Option<f64> {
    output
        .lines()
        .nth(1)?
        .split_whitespace()
        .find(|f| f.ends_with('%'))?
        .trim_end_matches('%')
        .parse()
        .ok()
}
