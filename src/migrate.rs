use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policy_updates (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            source_url TEXT NOT NULL UNIQUE,
            published_date TEXT,
            category TEXT NOT NULL,
            body_text TEXT NOT NULL,
            month_label TEXT,
            content_hash TEXT NOT NULL,
            scraped_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS medical_codes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            policy_id TEXT NOT NULL,
            code TEXT NOT NULL,
            code_type TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (policy_id) REFERENCES policy_updates(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS referenced_documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            policy_id TEXT NOT NULL,
            title TEXT NOT NULL,
            url TEXT,
            document_type TEXT NOT NULL,
            FOREIGN KEY (policy_id) REFERENCES policy_updates(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            policy_id TEXT NOT NULL,
            document_title TEXT NOT NULL,
            change_type TEXT NOT NULL,
            description TEXT NOT NULL,
            section_affected TEXT,
            FOREIGN KEY (policy_id) REFERENCES policy_updates(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scraping_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            records_scraped INTEGER NOT NULL DEFAULT 0,
            execution_time REAL NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_policy_updates_published ON policy_updates(published_date DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_medical_codes_policy ON medical_codes(policy_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_medical_codes_code ON medical_codes(code)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_referenced_documents_policy ON referenced_documents(policy_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_changes_policy ON document_changes(policy_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scraping_logs_timestamp ON scraping_logs(timestamp DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
