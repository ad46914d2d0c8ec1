//! SQLite-backed [`RecordStore`] implementation.
//!
//! A policy and its codes, references, and changes are written in one
//! transaction. The `policy_updates.source_url` unique constraint is the
//! deduplication key: a conflicting insert writes nothing and reports
//! [`InsertOutcome::Duplicate`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};

use policy_harvest_core::models::{
    ChangeType, CodeType, DocumentChange, DocumentType, LogStatus, MedicalCode, PolicyBundle,
    PolicyRecord, ReferencedDocument, ScrapeLog,
};
use policy_harvest_core::store::{InsertOutcome, RecordStore, StoreCounts, StoredPolicy};

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_change_type(s: &str) -> ChangeType {
    match s {
        "added" => ChangeType::Added,
        "modified" => ChangeType::Modified,
        "removed" => ChangeType::Removed,
        _ => ChangeType::Updated,
    }
}

fn parse_log_status(s: &str) -> LogStatus {
    match s {
        "success" => LogStatus::Success,
        "skipped" => LogStatus::Skipped,
        _ => LogStatus::Error,
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn policy_exists(&self, source_url: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM policy_updates WHERE source_url = ?")
                .bind(source_url)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_bundle(&self, bundle: &PolicyBundle) -> Result<InsertOutcome> {
        let record = &bundle.record;
        let id = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO policy_updates (id, title, source_url, published_date, category,
                                        body_text, month_label, content_hash, scraped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_url) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&record.title)
        .bind(&record.source_url)
        .bind(record.published_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(&record.category)
        .bind(&record.body_text)
        .bind(&record.month_label)
        .bind(record.content_hash())
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(InsertOutcome::Duplicate);
        }

        for code in &bundle.medical_codes {
            sqlx::query(
                "INSERT INTO medical_codes (policy_id, code, code_type, description) VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&code.code)
            .bind(code.code_type.as_str())
            .bind(&code.description)
            .execute(&mut *tx)
            .await?;
        }

        for doc in &bundle.referenced_documents {
            sqlx::query(
                "INSERT INTO referenced_documents (policy_id, title, url, document_type) VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&doc.title)
            .bind(&doc.url)
            .bind(doc.document_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for change in &bundle.document_changes {
            sqlx::query(
                r#"
                INSERT INTO document_changes (policy_id, document_title, change_type,
                                              description, section_affected)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&change.document_title)
            .bind(change.change_type.as_str())
            .bind(&change.description)
            .bind(&change.section_affected)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get_policy(&self, source_url: &str) -> Result<Option<StoredPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, source_url, published_date, category, body_text,
                   month_label, content_hash, scraped_at
            FROM policy_updates WHERE source_url = ?
            "#,
        )
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.get("id");
        let published: Option<String> = row.get("published_date");

        let record = PolicyRecord {
            title: row.get("title"),
            source_url: row.get("source_url"),
            published_date: published
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            category: row.get("category"),
            body_text: row.get("body_text"),
            month_label: row.get("month_label"),
        };

        let medical_codes = sqlx::query(
            "SELECT code, code_type, description FROM medical_codes WHERE policy_id = ? ORDER BY id",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .filter_map(|r| {
            let code_type: String = r.get("code_type");
            Some(MedicalCode {
                code: r.get("code"),
                code_type: CodeType::parse(&code_type)?,
                description: r.get("description"),
            })
        })
        .collect();

        let referenced_documents = sqlx::query(
            "SELECT title, url, document_type FROM referenced_documents WHERE policy_id = ? ORDER BY id",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| {
            let document_type: String = r.get("document_type");
            ReferencedDocument {
                title: r.get("title"),
                url: r.get("url"),
                document_type: DocumentType::parse(&document_type)
                    .unwrap_or(DocumentType::GenericReference),
            }
        })
        .collect();

        let document_changes = sqlx::query(
            r#"
            SELECT document_title, change_type, description, section_affected
            FROM document_changes WHERE policy_id = ? ORDER BY id
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| {
            let change_type: String = r.get("change_type");
            DocumentChange {
                document_title: r.get("document_title"),
                change_type: parse_change_type(&change_type),
                description: r.get("description"),
                section_affected: r.get("section_affected"),
            }
        })
        .collect();

        Ok(Some(StoredPolicy {
            id,
            content_hash: row.get("content_hash"),
            scraped_at: from_millis(row.get("scraped_at")),
            bundle: PolicyBundle {
                record,
                medical_codes,
                referenced_documents,
                document_changes,
            },
        }))
    }

    async fn count_policies(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_updates")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn insert_log(&self, log: &ScrapeLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scraping_logs (url, status, error_message, records_scraped,
                                       execution_time, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.url)
        .bind(log.status.as_str())
        .bind(&log.error_message)
        .bind(log.records_scraped as i64)
        .bind(log.execution_time_secs)
        .bind(log.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapeLog>> {
        let rows = sqlx::query(
            r#"
            SELECT url, status, error_message, records_scraped, execution_time, timestamp
            FROM scraping_logs
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let status: String = r.get("status");
                let records: i64 = r.get("records_scraped");
                ScrapeLog {
                    url: r.get("url"),
                    status: parse_log_status(&status),
                    error_message: r.get("error_message"),
                    records_scraped: records.max(0) as u32,
                    execution_time_secs: r.get("execution_time"),
                    timestamp: from_millis(r.get("timestamp")),
                }
            })
            .collect())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let count = |table: &'static str| {
            let pool = self.pool.clone();
            async move {
                let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                    .fetch_one(&pool)
                    .await?;
                anyhow::Ok(n as u64)
            }
        };

        let mut counts = StoreCounts {
            policies: count("policy_updates").await?,
            medical_codes: count("medical_codes").await?,
            referenced_documents: count("referenced_documents").await?,
            document_changes: count("document_changes").await?,
            ..Default::default()
        };

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM scraping_logs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match parse_log_status(&status) {
                LogStatus::Success => counts.log_success = n as u64,
                LogStatus::Error => counts.log_error = n as u64,
                LogStatus::Skipped => counts.log_skipped = n as u64,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn store(dir: &tempfile::TempDir) -> SqliteRecordStore {
        let mut config = Config::minimal();
        config.db.path = dir.path().join("harvest.sqlite");
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteRecordStore::new(pool)
    }

    fn bundle(url: &str) -> PolicyBundle {
        let mut bundle = PolicyBundle::new(PolicyRecord {
            title: "Dental Implants".to_string(),
            source_url: url.to_string(),
            published_date: NaiveDate::from_ymd_opt(2025, 1, 15),
            category: "Dental".to_string(),
            body_text: "Dental implants are covered when medically necessary.".to_string(),
            month_label: Some("January 2025".to_string()),
        });
        bundle.medical_codes.push(MedicalCode {
            code: "D6010".to_string(),
            code_type: CodeType::Hcpcs,
            description: "endosteal implant".to_string(),
        });
        bundle.document_changes.push(DocumentChange {
            document_title: "Dental Implants".to_string(),
            change_type: ChangeType::Modified,
            description: "Coverage criteria modified".to_string(),
            section_affected: None,
        });
        bundle
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let url = "https://example.com/mm_0100.pdf";

        assert!(matches!(
            store.insert_bundle(&bundle(url)).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(
            store.insert_bundle(&bundle(url)).await.unwrap(),
            InsertOutcome::Duplicate
        );

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.policies, 1);
        assert_eq!(counts.medical_codes, 1);
        assert_eq!(counts.document_changes, 1);
        assert!(store.policy_exists(url).await.unwrap());
    }

    #[tokio::test]
    async fn stored_bundle_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let url = "https://example.com/mm_0101.pdf";
        store.insert_bundle(&bundle(url)).await.unwrap();

        let stored = store.get_policy(url).await.unwrap().unwrap();
        assert_eq!(stored.bundle, bundle(url));
        assert_eq!(stored.content_hash, bundle(url).record.content_hash());
        assert!(store.get_policy("https://example.com/none.pdf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logs_are_counted_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.insert_log(&ScrapeLog::success("a", 1, 0.5)).await.unwrap();
        store.insert_log(&ScrapeLog::error("b", "HTTP 404", 0.1)).await.unwrap();
        store.insert_log(&ScrapeLog::skipped("c", "already stored")).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!((counts.log_success, counts.log_error, counts.log_skipped), (1, 1, 1));
        let recent = store.recent_logs(2).await.unwrap();
        assert_eq!(recent.len(), 2);
    }
}
