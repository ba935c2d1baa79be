//! Key/value settings persisted across restarts.

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::DatabaseConfig;

/// Setting keys written by the service.
pub mod keys {
    pub const EMAIL: &str = "email";
    pub const TOLERANCE: &str = "tolerance";
    pub const QUALITY_PRESET: &str = "quality_preset";
    pub const ALERT_ENABLED: &str = "alert_enabled";
}

/// Errors that can occur while reading or writing settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent settings storage.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, SettingsError>;

    async fn save_setting(&self, key: &str, value: &str) -> Result<(), SettingsError>;

    /// Stored value, or `default` when the key is absent.
    async fn get_setting_or(&self, key: &str, default: &str) -> Result<String, SettingsError> {
        Ok(self
            .get_setting(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }
}

/// SQLite-backed settings store.
pub struct SqliteSettingsStore {
    pool: SqlitePool,
}

impl SqliteSettingsStore {
    /// Open (creating if missing) the database and run migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, SettingsError> {
        if let Some(parent) = database_file(&config.url).and_then(|p| p.parent().map(PathBuf::from)) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(&parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        info!(url = %config.url, "Connected to settings database");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), SettingsError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("Settings migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    #[instrument(skip(self))]
    async fn get_setting(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    #[instrument(skip(self, value))]
    async fn save_setting(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        debug!(key, "Setting saved");
        Ok(())
    }
}

/// Non-persistent store, used when persistence is not wanted and in tests.
#[derive(Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, SettingsError> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn save_setting(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File path of a `sqlite:` URL, or `None` for in-memory databases.
fn database_file(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn memory_db() -> DatabaseConfig {
        DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_and_overwrite() {
        let store = assert_ok!(SqliteSettingsStore::connect(&memory_db()).await);

        assert_eq!(store.get_setting(keys::EMAIL).await.unwrap(), None);
        store.save_setting(keys::EMAIL, "ops@example.com").await.unwrap();
        store.save_setting(keys::EMAIL, "lead@example.com").await.unwrap();
        assert_eq!(
            store.get_setting(keys::EMAIL).await.unwrap().as_deref(),
            Some("lead@example.com")
        );
    }

    #[tokio::test]
    async fn test_get_setting_or_default() {
        let store = SqliteSettingsStore::connect(&memory_db()).await.unwrap();
        let tolerance = store.get_setting_or(keys::TOLERANCE, "50").await.unwrap();
        assert_eq!(tolerance, "50");
    }

    #[tokio::test]
    async fn test_file_database_created_with_parent_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.db");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            max_connections: 2,
        };

        {
            let store = SqliteSettingsStore::connect(&config).await.unwrap();
            store.save_setting(keys::QUALITY_PRESET, "high").await.unwrap();
            store.pool().close().await;
        }

        let reopened = SqliteSettingsStore::connect(&config).await.unwrap();
        assert_eq!(
            reopened.get_setting(keys::QUALITY_PRESET).await.unwrap().as_deref(),
            Some("high")
        );
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySettingsStore::new();
        store.save_setting(keys::ALERT_ENABLED, "true").await.unwrap();
        assert_eq!(
            store.get_setting_or(keys::ALERT_ENABLED, "false").await.unwrap(),
            "true"
        );
    }

    #[test]
    fn test_database_file_parsing() {
        assert_eq!(
            database_file("sqlite://data/settings.db"),
            Some(PathBuf::from("data/settings.db"))
        );
        assert_eq!(
            database_file("sqlite:///var/lib/monitor.db?mode=rwc"),
            Some(PathBuf::from("/var/lib/monitor.db"))
        );
        assert_eq!(database_file("sqlite::memory:"), None);
        assert_eq!(database_file("postgres://localhost/db"), None);
    }
}
