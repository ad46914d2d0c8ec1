use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub throttle: ThrottleSettings,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_listing_url")]
    pub listing_url: String,
    /// Root under which referenced policy URLs are reconstructed.
    #[serde(default = "default_policy_pdf_base")]
    pub policy_pdf_base: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause between successive monthly-page fetches.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    /// Newest N months only. 0 means all.
    #[serde(default)]
    pub max_months: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            listing_url: default_listing_url(),
            policy_pdf_base: default_policy_pdf_base(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            page_delay_ms: default_page_delay_ms(),
            max_months: 0,
        }
    }
}

fn default_base_url() -> String {
    "https://static.cigna.com/assets/chcp/resourceLibrary/coveragePolicies/".to_string()
}
fn default_listing_url() -> String {
    "https://static.cigna.com/assets/chcp/resourceLibrary/coveragePolicies/latestUpdatesListing.html"
        .to_string()
}
fn default_policy_pdf_base() -> String {
    policy_harvest_core::recognize::DEFAULT_POLICY_BASE.to_string()
}
fn default_user_agent() -> String {
    "PolicyHarvest/0.3 (research)".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_page_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProgressConfig {
    /// `memory` or `redis`.
    #[serde(default = "default_progress_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            backend: default_progress_backend(),
            redis_url: default_redis_url(),
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_progress_backend() -> String {
    "memory".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_key_prefix() -> String {
    "progress".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThrottleSettings {
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Responsiveness probe target. Disabled when unset.
    #[serde(default)]
    pub probe_url: Option<String>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_latency_ms")]
    pub probe_latency_ms: u64,
    /// Sleep between throttle checks while throttled.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Give up waiting for resources after this many consecutive checks. 0 waits forever.
    #[serde(default = "default_max_backoffs")]
    pub max_backoffs: u32,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            cooldown_secs: default_cooldown_secs(),
            probe_url: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_latency_ms: default_probe_latency_ms(),
            backoff_ms: default_backoff_ms(),
            max_backoffs: default_max_backoffs(),
            monitor_interval_secs: default_monitor_interval_secs(),
        }
    }
}

fn default_cpu_threshold() -> f64 {
    70.0
}
fn default_memory_threshold() -> f64 {
    80.0
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_probe_timeout_ms() -> u64 {
    5000
}
fn default_probe_latency_ms() -> u64 {
    2000
}
fn default_backoff_ms() -> u64 {
    2000
}
fn default_max_backoffs() -> u32 {
    0
}
fn default_monitor_interval_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkersConfig {
    /// Fixed worker count. 0 sizes the pool from current load.
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Defaults with a database under `./data`, for commands that can run
    /// without a config file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/harvest.sqlite"),
            },
            source: SourceConfig::default(),
            progress: ProgressConfig::default(),
            throttle: ThrottleSettings::default(),
            workers: WorkersConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if url::Url::parse(&config.source.listing_url).is_err() {
        bail!("source.listing_url is not a valid URL");
    }
    if url::Url::parse(&config.source.base_url).is_err() {
        bail!("source.base_url is not a valid URL");
    }
    if config.source.timeout_secs == 0 {
        bail!("source.timeout_secs must be > 0");
    }

    match config.progress.backend.as_str() {
        "memory" | "redis" => {}
        other => bail!(
            "Unknown progress backend: '{}'. Must be memory or redis.",
            other
        ),
    }
    if config.progress.ttl_secs == 0 {
        bail!("progress.ttl_secs must be > 0");
    }

    for (name, value) in [
        ("throttle.cpu_threshold", config.throttle.cpu_threshold),
        ("throttle.memory_threshold", config.throttle.memory_threshold),
    ] {
        if !(0.0..=100.0).contains(&value) {
            bail!("{} must be in [0, 100]", name);
        }
    }
    if config.throttle.monitor_interval_secs == 0 {
        bail!("throttle.monitor_interval_secs must be > 0");
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => bail!("Unknown log format: '{}'. Must be pretty or json.", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: Config = toml::from_str("[db]\npath = \"/tmp/h.sqlite\"\n").unwrap();
        validate_config(&cfg).unwrap();
        assert_eq!(cfg.source.timeout_secs, 30);
        assert_eq!(cfg.source.page_delay_ms, 2000);
        assert_eq!(cfg.progress.backend, "memory");
        assert_eq!(cfg.progress.ttl_secs, 3600);
        assert_eq!(cfg.throttle.cpu_threshold, 70.0);
        assert!(cfg.throttle.probe_url.is_none());
        assert_eq!(cfg.workers.count, 0);
    }

    #[test]
    fn example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/harvest.example.toml");
        let cfg = load_config(&path).unwrap();
        assert!(cfg.throttle.probe_url.is_none());
        assert_eq!(cfg.throttle.cooldown_secs, 60);
        assert_eq!(cfg.throttle.max_backoffs, 0);
        assert_eq!(cfg.progress.backend, "memory");
    }

    #[test]
    fn rejects_unknown_backend() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x\"\n[progress]\nbackend = \"etcd\"\n").unwrap();
        let err = validate_config(&cfg).unwrap_err().to_string();
        assert!(err.contains("Unknown progress backend"));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x\"\n[throttle]\ncpu_threshold = 170.0\n").unwrap();
        assert!(validate_config(&cfg).is_err());
    }
}
