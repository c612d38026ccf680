use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Row, SqlitePool};
use tracing::info;

/// Migration scripts in apply order; `schema_version` records which of them
/// have already run.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "initial_schema",
    include_str!("../migrations/20260801_000001_initial_schema.sql"),
)];

pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| format!("creating data directory: {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .pragma("temp_store", "MEMORY")
        .pragma("cache_size", "-20000");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to database: {}", db_path.display()))?;

    info!(path = %db_path.display(), "database connected (WAL mode)");

    run_migrations(&pool).await?;
    ensure_text_ja_column(&pool).await?;

    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
    )
    .await
    .context("preparing schema_version table")?;

    let done: HashSet<i64> = sqlx::query_scalar::<_, i64>("SELECT version FROM schema_version")
        .fetch_all(pool)
        .await
        .context("reading applied migrations")?
        .into_iter()
        .collect();

    for &(version, name, sql) in MIGRATIONS {
        if done.contains(&version) {
            continue;
        }
        pool.execute(sql)
            .await
            .with_context(|| format!("running migration {name}"))?;
        sqlx::query("INSERT INTO schema_version (version, name) VALUES (?, ?)")
            .bind(version)
            .bind(name)
            .execute(pool)
            .await
            .with_context(|| format!("marking migration {name} applied"))?;
        info!(version, name, "schema migration applied");
    }

    Ok(())
}

/// Databases created by older installs predate the `text_ja` column; the
/// CREATE TABLE IF NOT EXISTS in the migration leaves such tables untouched.
async fn ensure_text_ja_column(pool: &SqlitePool) -> Result<()> {
    let columns = sqlx::query("PRAGMA table_info(messages)")
        .fetch_all(pool)
        .await
        .context("inspecting messages table")?;

    let has_text_ja = columns.iter().any(|row| {
        let name: String = row.get("name");
        name == "text_ja"
    });

    if !has_text_ja {
        pool.execute("ALTER TABLE messages ADD COLUMN text_ja TEXT")
            .await
            .context("adding text_ja column")?;
        info!("added text_ja column to legacy messages table");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn legacy_table_gains_text_ja_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");

        // Simulate a database created before text_ja existed.
        {
            let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            pool.execute(
                "CREATE TABLE messages (
                    id INTEGER PRIMARY KEY, chat_id INTEGER NOT NULL, chat_title TEXT NOT NULL DEFAULT '',
                    chat_username TEXT NOT NULL DEFAULT '', date TEXT NOT NULL, message_id INTEGER NOT NULL,
                    text TEXT NOT NULL, lang TEXT NOT NULL DEFAULT 'und',
                    matched_keywords TEXT NOT NULL DEFAULT '[]', score INTEGER NOT NULL DEFAULT 0,
                    url TEXT NOT NULL DEFAULT ''
                )",
            )
            .await
            .unwrap();
            pool.close().await;
        }

        let pool = create_pool(&path).await.unwrap();
        let columns = sqlx::query("PRAGMA table_info(messages)").fetch_all(&pool).await.unwrap();
        assert!(columns.iter().any(|row| {
            let name: String = row.get("name");
            name == "text_ja"
        }));
    }

    #[tokio::test]
    async fn migrations_are_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");

        let pool = create_pool(&path).await.unwrap();
        pool.close().await;
        // Reopening must not re-apply migrations.
        let pool = create_pool(&path).await.unwrap();

        let versions: Vec<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(versions.len(), MIGRATIONS.len());
    }
}
