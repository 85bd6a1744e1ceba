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

/// Creates the schema on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per collection target; the latest completed record wins.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parcel_records (
            kind TEXT NOT NULL,
            normalized_value TEXT NOT NULL,
            raw_value TEXT NOT NULL,
            completeness TEXT NOT NULL,
            fields_json TEXT NOT NULL DEFAULT '{}',
            sources_json TEXT NOT NULL DEFAULT '[]',
            last_updated INTEGER NOT NULL,
            PRIMARY KEY (kind, normalized_value)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_parcel_records_updated ON parcel_records(last_updated)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
