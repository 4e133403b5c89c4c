use gvi_core::{Result, TrackerConfig};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::migrator::{MigrationReport, Migrator};

#[derive(Clone)]
pub struct GviDb {
    pool: SqlitePool,
}

impl GviDb {
    /// Open a connection pool without touching the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = is_memory_url(database_url);
        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database, so keep exactly one alive.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    /// Connect and bring the schema up to date.
    pub async fn open(config: &TrackerConfig) -> Result<(Self, MigrationReport)> {
        let db = Self::connect(&config.database_url).await?;
        let report = Migrator::new(config).migrate(&db).await?;
        Ok((db, report))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Check if database file exists
    pub fn exists(url: &str) -> bool {
        let file_path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        let file_path = file_path.split('?').next().unwrap_or(file_path);
        Path::new(file_path).exists()
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}
