//! Source registry backed by SQLite
//!
//! Stores the subscription feed URLs to probe and a small key-value settings
//! table. The cycle driver only ever lists sources and reads the interval; the
//! CLI manages the rest.

use crate::proxy::crawler::source_name;
use chrono::{NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Settings key holding the cycle interval in seconds
pub const INTERVAL_SETTING: &str = "test_interval_seconds";

/// Shortest accepted cycle interval in seconds
pub const MIN_INTERVAL_SECS: u64 = 60;

const BUSY_TIMEOUT_MS: u64 = 5000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS config_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL UNIQUE,
        added_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid source url: {0}")]
    InvalidUrl(String),

    #[error("source already registered: {0}")]
    Duplicate(String),

    #[error("interval must be at least {min} seconds, got {0}", min = MIN_INTERVAL_SECS)]
    IntervalTooShort(u64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// A registered subscription feed
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub added_at: NaiveDateTime,
}

impl Source {
    /// Name used in logs and result file names
    pub fn name(&self) -> String {
        source_name(&self.url).unwrap_or_else(|| format!("source_{}", self.id))
    }
}

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    pool: SqlitePool,
}

impl SourceRegistry {
    /// Open (creating if needed) the database at `path` and apply the schema
    pub async fn connect(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let registry = Self { pool };
        registry.migrate().await?;
        debug!(path = %path.as_ref().display(), "source registry ready");
        Ok(registry)
    }

    async fn migrate(&self) -> RegistryResult<()> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Register a feed URL (http or https only)
    pub async fn add_source(&self, url: &str) -> RegistryResult<Source> {
        let url = url.trim();
        let parsed = Url::parse(url).map_err(|_| RegistryError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(RegistryError::InvalidUrl(url.to_string()));
        }

        let result = sqlx::query("INSERT OR IGNORE INTO config_files (url, added_at) VALUES (?, ?)")
            .bind(url)
            .bind(Utc::now().naive_utc())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::Duplicate(url.to_string()));
        }

        let source = sqlx::query_as::<_, Source>(
            "SELECT id, url, added_at FROM config_files WHERE id = ?",
        )
        .bind(result.last_insert_rowid())
        .fetch_one(&self.pool)
        .await?;
        Ok(source)
    }

    /// Remove a source by id, returning whether it existed
    pub async fn remove_source(&self, id: i64) -> RegistryResult<bool> {
        let result = sqlx::query("DELETE FROM config_files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_sources(&self) -> RegistryResult<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(
            "SELECT id, url, added_at FROM config_files ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    pub async fn get_setting(&self, key: &str) -> RegistryResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> RegistryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored cycle interval, or `default` when unset or unparseable
    pub async fn interval(&self, default: Duration) -> RegistryResult<Duration> {
        let stored = self
            .get_setting(INTERVAL_SETTING)
            .await?
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|secs| *secs >= MIN_INTERVAL_SECS);
        Ok(stored.map(Duration::from_secs).unwrap_or(default))
    }

    pub async fn set_interval(&self, secs: u64) -> RegistryResult<()> {
        if secs < MIN_INTERVAL_SECS {
            return Err(RegistryError::IntervalTooShort(secs));
        }
        self.set_setting(INTERVAL_SETTING, &secs.to_string()).await
    }
}
