//! In-memory [`RecordStore`] and [`ProgressStore`] implementations for
//! tests and single-process runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Progress keys
//! expire lazily: an expired key is invisible to reads and dropped on the
//! next write or scan.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{LogStatus, PolicyBundle, ScrapeLog};

use super::{InsertOutcome, ProgressStore, RecordStore, StoreCounts, StoredPolicy};

/// In-memory record store keyed by `source_url`.
#[derive(Default)]
pub struct InMemoryRecordStore {
    policies: RwLock<HashMap<String, StoredPolicy>>,
    logs: RwLock<Vec<ScrapeLog>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn policy_exists(&self, source_url: &str) -> Result<bool> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        Ok(policies.contains_key(source_url))
    }

    async fn insert_bundle(&self, bundle: &PolicyBundle) -> Result<InsertOutcome> {
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        let url = &bundle.record.source_url;
        if policies.contains_key(url) {
            return Ok(InsertOutcome::Duplicate);
        }
        let id = Uuid::new_v4().to_string();
        policies.insert(
            url.clone(),
            StoredPolicy {
                id: id.clone(),
                content_hash: bundle.record.content_hash(),
                scraped_at: Utc::now(),
                bundle: bundle.clone(),
            },
        );
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get_policy(&self, source_url: &str) -> Result<Option<StoredPolicy>> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        Ok(policies.get(source_url).cloned())
    }

    async fn count_policies(&self) -> Result<u64> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        Ok(policies.len() as u64)
    }

    async fn insert_log(&self, log: &ScrapeLog) -> Result<()> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        logs.push(log.clone());
        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapeLog>> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.iter().rev().take(limit).cloned().collect())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let policies = self.policies.read().unwrap_or_else(PoisonError::into_inner);
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts = StoreCounts {
            policies: policies.len() as u64,
            ..Default::default()
        };
        for p in policies.values() {
            counts.medical_codes += p.bundle.medical_codes.len() as u64;
            counts.referenced_documents += p.bundle.referenced_documents.len() as u64;
            counts.document_changes += p.bundle.document_changes.len() as u64;
        }
        for log in logs.iter() {
            match log.status {
                LogStatus::Success => counts.log_success += 1,
                LogStatus::Error => counts.log_error += 1,
                LogStatus::Skipped => counts.log_skipped += 1,
            }
        }
        Ok(counts)
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory progress store with per-key expiry.
#[derive(Default)]
pub struct InMemoryProgressStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PolicyRecord;

    fn bundle(url: &str) -> PolicyBundle {
        PolicyBundle::new(PolicyRecord {
            title: "Dental Implants".into(),
            source_url: url.into(),
            published_date: None,
            category: "Medical Policy".into(),
            body_text: "body".into(),
            month_label: None,
        })
    }

    #[tokio::test]
    async fn second_insert_of_same_url_is_a_noop() {
        let store = InMemoryRecordStore::new();
        let first = store.insert_bundle(&bundle("https://x.test/a.pdf")).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));
        let second = store.insert_bundle(&bundle("https://x.test/a.pdf")).await.unwrap();
        assert_eq!(second, InsertOutcome::Duplicate);
        assert_eq!(store.count_policies().await.unwrap(), 1);
        assert!(store.policy_exists("https://x.test/a.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn logs_newest_first() {
        let store = InMemoryRecordStore::new();
        store.insert_log(&ScrapeLog::success("a", 1, 0.1)).await.unwrap();
        store.insert_log(&ScrapeLog::error("b", "boom", 0.2)).await.unwrap();
        let logs = store.recent_logs(10).await.unwrap();
        assert_eq!(logs[0].url, "b");
        let counts = store.counts().await.unwrap();
        assert_eq!((counts.log_success, counts.log_error), (1, 1));
    }

    #[tokio::test]
    async fn expired_keys_disappear() {
        let store = InMemoryProgressStore::new();
        store
            .set_with_ttl("progress:a", "1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_with_ttl("progress:b", "2", Duration::ZERO)
            .await
            .unwrap();
        store
            .set_with_ttl("other:c", "3", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("progress:b").await.unwrap(), None);
        assert_eq!(store.scan_prefix("progress:").await.unwrap(), vec!["progress:a"]);
        assert!(store.delete("progress:a").await.unwrap());
        assert!(!store.delete("progress:a").await.unwrap());
    }
}
