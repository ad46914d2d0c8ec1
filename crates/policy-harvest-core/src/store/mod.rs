//! Storage abstractions for Policy Harvest.
//!
//! Two independent seams:
//!
//! - [`RecordStore`]: validated policy bundles and the per-document
//!   scraping log. Uniqueness is by `source_url`; inserting a URL that is
//!   already stored is a successful no-op ([`InsertOutcome::Duplicate`]).
//! - [`ProgressStore`]: a small key/value store with per-key expiry that
//!   backs the [`ProgressTracker`](crate::tracker::ProgressTracker).
//!
//! Implementations must be `Send + Sync`; workers share them through `Arc`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::models::{PolicyBundle, ScrapeLog};

/// Result of [`RecordStore::insert_bundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The bundle was written; carries the new record ID.
    Inserted(String),
    /// A record with the same `source_url` already exists. Nothing was written.
    Duplicate,
}

/// A persisted bundle with its storage metadata.
#[derive(Debug, Clone, Serialize)]
pub struct StoredPolicy {
    pub id: String,
    pub content_hash: String,
    pub scraped_at: DateTime<Utc>,
    #[serde(flatten)]
    pub bundle: PolicyBundle,
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub policies: u64,
    pub medical_codes: u64,
    pub referenced_documents: u64,
    pub document_changes: u64,
    pub log_success: u64,
    pub log_error: u64,
    pub log_skipped: u64,
}

/// Persistence for policy bundles and scraping logs.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`policy_exists`](RecordStore::policy_exists) | Pre-check before fetching a document |
/// | [`insert_bundle`](RecordStore::insert_bundle) | Atomic insert of a record and its children |
/// | [`get_policy`](RecordStore::get_policy) | Load a stored bundle by URL |
/// | [`insert_log`](RecordStore::insert_log) | Append one scraping-log row |
/// | [`recent_logs`](RecordStore::recent_logs) | Newest log rows first |
/// | [`counts`](RecordStore::counts) | Table sizes |
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn policy_exists(&self, source_url: &str) -> Result<bool>;

    /// Inserts the record and all its children in one unit. A concurrent or
    /// repeated insert of the same `source_url` returns `Duplicate`.
    async fn insert_bundle(&self, bundle: &PolicyBundle) -> Result<InsertOutcome>;

    async fn get_policy(&self, source_url: &str) -> Result<Option<StoredPolicy>>;

    async fn count_policies(&self) -> Result<u64>;

    async fn insert_log(&self, log: &ScrapeLog) -> Result<()>;

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapeLog>>;

    async fn counts(&self) -> Result<StoreCounts>;
}

/// Key/value store with per-key time-to-live.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes `value` and (re)sets the key's expiry to `ttl` from now.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Live keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}
