//! Schema Migrator
//!
//! The schema version lives in `schema_migrations` and only moves forward
//! through the linear chain in [`MIGRATIONS`]. Each step runs in a single
//! transaction together with its version marker, so a failed step leaves the
//! store exactly as it was.
//!
//! Stores written before the marker existed are classified once by inspecting
//! the unique indexes on `stock_scores`; the result is recorded as a marker.
//! Such stores may also hold older region labels (`Europe (excl UK)`) and
//! unnormalized tickers, which the last step rewrites to their canonical form.

use chrono::{NaiveDate, Utc};
use gvi_core::{normalize_ticker, validate_decile, GviError, Region, Result, TrackerConfig};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use std::collections::BTreeSet;

use crate::db::GviDb;

pub const LATEST_SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

const CREATE_STAGING_SQL: &str = "CREATE TABLE stock_scores_staging (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    date TEXT NOT NULL,
    ticker TEXT NOT NULL,
    company_name TEXT,
    sector TEXT,
    region TEXT NOT NULL DEFAULT 'US',
    score REAL NOT NULL,
    decile INTEGER NOT NULL CHECK (decile BETWEEN 1 AND 10),
    UNIQUE(date, ticker, region)
)";

const CREATE_UPLOAD_HISTORY_SQL: &str = "CREATE TABLE IF NOT EXISTS upload_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_timestamp TEXT NOT NULL,
    filename TEXT NOT NULL,
    date TEXT NOT NULL,
    region TEXT NOT NULL,
    stocks_count INTEGER,
    status TEXT
)";

const INDEX_SQL: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_ticker_date ON stock_scores(ticker, date)",
    "CREATE INDEX IF NOT EXISTS idx_region ON stock_scores(region)",
    "CREATE INDEX IF NOT EXISTS idx_date_region ON stock_scores(date, region)",
    "CREATE INDEX IF NOT EXISTS idx_upload_timestamp ON upload_history(upload_timestamp)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Region-less score table keyed by (date, ticker).
    CreateBaseline,
    /// Rewrite scores under (date, ticker, region) and add the upload ledger.
    AddRegionToKey,
    /// Rewrite region labels, tickers and dates to their canonical form.
    CanonicalLabels,
}

/// One link of the migration chain.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub from_version: i64,
    pub to_version: i64,
    pub name: &'static str,
    pub transform: Transform,
}

pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        from_version: 0,
        to_version: 1,
        name: "baseline_stock_scores",
        transform: Transform::CreateBaseline,
    },
    MigrationStep {
        from_version: 1,
        to_version: 2,
        name: "region_scoped_key",
        transform: Transform::AddRegionToKey,
    },
    MigrationStep {
        from_version: 2,
        to_version: 3,
        name: "canonical_labels",
        transform: Transform::CanonicalLabels,
    },
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub rows_migrated: u64,
    pub rows_skipped: u64,
    pub steps_applied: Vec<String>,
    pub inferred_from_legacy: bool,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.steps_applied.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Default)]
struct StepOutcome {
    rows_migrated: u64,
    rows_skipped: u64,
}

#[derive(Debug, Default)]
struct RewriteStats {
    kept: u64,
    invalid: u64,
    collided: u64,
    relabelled: u64,
}

#[derive(Debug, FromRow)]
struct LegacyRow {
    date: Option<String>,
    ticker: Option<String>,
    company_name: Option<String>,
    sector: Option<String>,
    region: Option<String>,
    score: Option<f64>,
    decile: Option<i64>,
}

pub struct Migrator {
    default_region: Region,
}

impl Migrator {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            default_region: config.default_region,
        }
    }

    pub fn with_default_region(default_region: Region) -> Self {
        Self { default_region }
    }

    /// Report the current and target schema versions without changing anything
    /// beyond creating the marker table.
    pub async fn status(&self, db: &GviDb) -> Result<SchemaStatus> {
        let mut conn = db.pool().acquire().await?;
        sqlx::query(CREATE_SCHEMA_MIGRATIONS_SQL)
            .execute(&mut *conn)
            .await?;

        let (current_version, inferred_from_legacy) = match recorded_version(&mut conn).await? {
            Some(v) => (v, false),
            None => match detect_legacy_version(&mut conn).await? {
                Some(v) => (v, true),
                None => (0, false),
            },
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions: ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect(),
            inferred_from_legacy,
        })
    }

    /// Apply every pending step. Running this on an up-to-date store is a no-op.
    pub async fn migrate(&self, db: &GviDb) -> Result<MigrationReport> {
        let status = self.status(db).await?;
        if status.current_version > LATEST_SCHEMA_VERSION {
            return Err(GviError::Migration(format!(
                "schema version {} is newer than supported version {}",
                status.current_version, LATEST_SCHEMA_VERSION
            )));
        }

        if status.inferred_from_legacy {
            self.record_inferred_version(db, status.current_version)
                .await?;
        }

        let mut report = MigrationReport {
            from_version: status.current_version,
            to_version: status.current_version,
            inferred_from_legacy: status.inferred_from_legacy,
            ..Default::default()
        };

        let mut version = status.current_version;
        while version < LATEST_SCHEMA_VERSION {
            let step = MIGRATIONS
                .iter()
                .find(|s| s.from_version == version)
                .ok_or_else(|| {
                    GviError::Migration(format!("no migration step from version {}", version))
                })?;

            let outcome = self.apply_step(db, step).await.map_err(|e| {
                GviError::Migration(format!(
                    "{} ({} -> {}): {}",
                    step.name, step.from_version, step.to_version, e
                ))
            })?;

            tracing::info!(
                "Applied schema migration {} ({} -> {}): {} rows migrated, {} skipped",
                step.name,
                step.from_version,
                step.to_version,
                outcome.rows_migrated,
                outcome.rows_skipped
            );

            report.rows_migrated += outcome.rows_migrated;
            report.rows_skipped += outcome.rows_skipped;
            report.steps_applied.push(step.name.to_string());
            report.to_version = step.to_version;
            version = step.to_version;
        }

        Ok(report)
    }

    async fn apply_step(&self, db: &GviDb, step: &MigrationStep) -> Result<StepOutcome> {
        let mut tx = db.pool().begin().await?;

        let outcome = match step.transform {
            Transform::CreateBaseline => create_baseline(&mut tx).await?,
            Transform::AddRegionToKey => {
                let stats = self.rewrite_scores(&mut tx).await?;
                StepOutcome {
                    rows_migrated: stats.kept,
                    rows_skipped: stats.invalid + stats.collided,
                }
            }
            Transform::CanonicalLabels => {
                let stats = self.rewrite_scores(&mut tx).await?;
                let unreadable = canonicalize_ledger(&mut tx).await?;
                StepOutcome {
                    rows_migrated: stats.relabelled,
                    rows_skipped: stats.invalid + stats.collided + unreadable,
                }
            }
        };

        record_version(&mut tx, step.to_version, step.name).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn record_inferred_version(&self, db: &GviDb, version: i64) -> Result<()> {
        let mut tx = db.pool().begin().await?;
        for step in MIGRATIONS.iter().filter(|s| s.to_version <= version) {
            record_version(&mut tx, step.to_version, step.name).await?;
        }
        tx.commit().await?;
        tracing::info!("Recorded schema version {} inferred from existing tables", version);
        Ok(())
    }

    /// Copy every row into a staging table keyed by (date, ticker, region) in
    /// canonical form, then swap the staging table in. Later rows win on key
    /// collisions; rows that cannot be carried over are dropped.
    async fn rewrite_scores(&self, conn: &mut SqliteConnection) -> Result<RewriteStats> {
        let has_region = table_columns(conn, "stock_scores")
            .await?
            .contains("region");
        let region_expr = if has_region { "region" } else { "NULL" };

        let legacy: Vec<LegacyRow> = sqlx::query_as(&format!(
            "SELECT CAST(date AS TEXT) AS date, CAST(ticker AS TEXT) AS ticker,
                    company_name, sector, {} AS region,
                    CAST(score AS REAL) AS score, CAST(decile AS INTEGER) AS decile
             FROM stock_scores ORDER BY rowid",
            region_expr
        ))
        .fetch_all(&mut *conn)
        .await?;

        sqlx::query("DROP TABLE IF EXISTS stock_scores_staging")
            .execute(&mut *conn)
            .await?;
        sqlx::query(CREATE_STAGING_SQL).execute(&mut *conn).await?;

        let mut invalid = 0u64;
        let mut relabelled = 0u64;
        for row in &legacy {
            let Some((date, ticker, region, score, decile)) = self.carry_over(row) else {
                invalid += 1;
                continue;
            };
            let canonical = row.date.as_deref() == Some(date.to_string().as_str())
                && row.ticker.as_deref() == Some(ticker.as_str())
                && row.region.as_deref() == Some(region.as_str());
            if !canonical {
                relabelled += 1;
            }

            sqlx::query(
                "INSERT INTO stock_scores_staging
                    (date, ticker, company_name, sector, region, score, decile)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(date, ticker, region) DO UPDATE SET
                    company_name = excluded.company_name,
                    sector = excluded.sector,
                    score = excluded.score,
                    decile = excluded.decile",
            )
            .bind(date)
            .bind(&ticker)
            .bind(&row.company_name)
            .bind(&row.sector)
            .bind(region.as_str())
            .bind(score)
            .bind(decile as i64)
            .execute(&mut *conn)
            .await?;
        }

        let (migrated,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stock_scores_staging")
            .fetch_one(&mut *conn)
            .await?;

        sqlx::query("DROP TABLE stock_scores")
            .execute(&mut *conn)
            .await?;
        sqlx::query("ALTER TABLE stock_scores_staging RENAME TO stock_scores")
            .execute(&mut *conn)
            .await?;
        sqlx::query(CREATE_UPLOAD_HISTORY_SQL)
            .execute(&mut *conn)
            .await?;
        for sql in INDEX_SQL {
            sqlx::query(sql).execute(&mut *conn).await?;
        }

        let migrated = migrated as u64;
        let collided = legacy.len() as u64 - invalid - migrated;
        if invalid + collided > 0 {
            tracing::warn!(
                "Skipped {} legacy rows ({} invalid, {} duplicate keys)",
                invalid + collided,
                invalid,
                collided
            );
        }

        Ok(RewriteStats {
            kept: migrated,
            invalid,
            collided,
            relabelled,
        })
    }

    fn carry_over(&self, row: &LegacyRow) -> Option<(NaiveDate, String, Region, f64, u8)> {
        let date = row.date.as_deref().and_then(parse_legacy_date)?;
        let ticker = normalize_ticker(row.ticker.as_deref()?);
        if ticker.is_empty() {
            return None;
        }
        let region = match row.region.as_deref().map(str::trim) {
            None | Some("") => self.default_region,
            Some(label) => label.parse().ok()?,
        };
        let score = row.score.filter(|s| s.is_finite())?;
        let decile = validate_decile(row.decile?).ok()?;
        Some((date, ticker, region, score, decile))
    }
}

async fn create_baseline(conn: &mut SqliteConnection) -> Result<StepOutcome> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS stock_scores (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            ticker TEXT NOT NULL,
            company_name TEXT,
            sector TEXT,
            score REAL,
            decile INTEGER,
            UNIQUE(date, ticker)
        )",
    )
    .execute(&mut *conn)
    .await?;
    Ok(StepOutcome::default())
}

/// Rewrite ledger region labels in place. Entries are otherwise immutable, so
/// labels that do not parse are left as they are and counted.
async fn canonicalize_ledger(conn: &mut SqliteConnection) -> Result<u64> {
    let entries: Vec<(i64, String)> = sqlx::query_as("SELECT id, region FROM upload_history")
        .fetch_all(&mut *conn)
        .await?;

    let mut unreadable = 0u64;
    for (id, label) in entries {
        match label.parse::<Region>() {
            Ok(region) if region.as_str() != label => {
                sqlx::query("UPDATE upload_history SET region = ? WHERE id = ?")
                    .bind(region.as_str())
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(_) => {}
            Err(_) => {
                tracing::warn!("Upload {} has unknown region '{}'", id, label);
                unreadable += 1;
            }
        }
    }
    Ok(unreadable)
}

async fn record_version(conn: &mut SqliteConnection, version: i64, name: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
    )
    .bind(version)
    .bind(name)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn recorded_version(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    let (version,): (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(&mut *conn)
        .await?;
    Ok(version)
}

/// Classify an unmarked store by shape. `None` means there is nothing to classify.
async fn detect_legacy_version(conn: &mut SqliteConnection) -> Result<Option<i64>> {
    if !table_exists(conn, "stock_scores").await? {
        return Ok(None);
    }

    // Version 2 also owns the upload ledger; without it the rewrite step still has work to do.
    if !table_exists(conn, "upload_history").await? {
        return Ok(Some(1));
    }

    let region_key: BTreeSet<String> = ["date", "region", "ticker"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let unique_indexes: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM pragma_index_list('stock_scores') WHERE \"unique\" = 1")
            .fetch_all(&mut *conn)
            .await?;

    for (index,) in unique_indexes {
        let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_index_info(?)")
            .bind(&index)
            .fetch_all(&mut *conn)
            .await?;
        let columns: BTreeSet<String> = columns.into_iter().map(|(c,)| c).collect();
        if columns == region_key {
            return Ok(Some(2));
        }
    }
    Ok(Some(1))
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let found: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<BTreeSet<String>> {
    let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    Ok(columns.into_iter().map(|(c,)| c).collect())
}

/// Legacy dates may carry a time component (`2024-07-10 00:00:00`).
fn parse_legacy_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT_LEGACY_SQL: &str = "INSERT INTO stock_scores
        (date, ticker, company_name, sector, score, decile)
        VALUES (?, ?, ?, 'Tech', ?, ?)";

    const DUMP_SQL: &str = "SELECT date, ticker, region, score, decile
        FROM stock_scores ORDER BY date, ticker, region";

    async fn legacy_db() -> GviDb {
        let db = GviDb::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE stock_scores (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                ticker TEXT NOT NULL,
                company_name TEXT,
                sector TEXT,
                score REAL,
                decile INTEGER,
                UNIQUE(date, ticker)
            )",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let rows = [
            ("2024-07-10", "BEN", "Franklin Resources", 0.12, 1),
            ("2024-07-10", "AAPL", "Apple", 0.91, 10),
            ("2025-03-11", "BEN", "Franklin Resources", 0.81, 9),
            ("2025-03-11 00:00:00", "msft", "Microsoft", 0.55, 6),
            ("2025-03-11", "BAD", "Broken", 0.10, 42),
        ];
        for (date, ticker, name, score, decile) in rows {
            sqlx::query(INSERT_LEGACY_SQL)
                .bind(date)
                .bind(ticker)
                .bind(name)
                .bind(score)
                .bind(decile)
                .execute(db.pool())
                .await
                .unwrap();
        }
        db
    }

    /// A store written by the original upload tool: region in the key, the
    /// upload ledger present, but free-form labels and nullable scores.
    async fn region_keyed_db() -> GviDb {
        let db = GviDb::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE stock_scores (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                ticker TEXT NOT NULL,
                company_name TEXT,
                sector TEXT,
                region TEXT DEFAULT 'US',
                score REAL,
                decile INTEGER,
                UNIQUE(date, ticker, region)
            )",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(CREATE_UPLOAD_HISTORY_SQL)
            .execute(db.pool())
            .await
            .unwrap();

        let rows = [
            ("2024-07-10", "ASML", "Europe (excl UK)", Some(0.42), 4),
            ("2025-03-11", "ASML", "Europe (excl UK)", Some(0.55), 5),
            ("2025-03-11", "ASML", "Europe-excl-UK", Some(0.93), 9),
            ("2025-03-11", "SONY", "Japan", None, 3),
        ];
        for (date, ticker, region, score, decile) in rows {
            sqlx::query(
                "INSERT INTO stock_scores (date, ticker, region, score, decile)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(date)
            .bind(ticker)
            .bind(region)
            .bind(score)
            .bind(decile)
            .execute(db.pool())
            .await
            .unwrap();
        }

        sqlx::query(
            "INSERT INTO upload_history
                (upload_timestamp, filename, date, region, stocks_count, status)
             VALUES ('2025-03-11 09:00:00', 'apac.csv', '2025-03-11', 'APAC (excl. Japan)', 2,
                     'SUCCESS')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db
    }

    async fn dump(db: &GviDb) -> Vec<(String, String, String, f64, i64)> {
        sqlx::query_as(DUMP_SQL).fetch_all(db.pool()).await.unwrap()
    }

    #[tokio::test]
    async fn test_fresh_store_runs_full_chain() {
        let db = GviDb::connect("sqlite::memory:").await.unwrap();
        let migrator = Migrator::new(&TrackerConfig::default());
        let report = migrator.migrate(&db).await.unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, LATEST_SCHEMA_VERSION);
        assert_eq!(report.rows_migrated, 0);
        assert_eq!(
            report.steps_applied,
            vec!["baseline_stock_scores", "region_scoped_key", "canonical_labels"]
        );

        let status = migrator.status(&db).await.unwrap();
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_store_gets_default_region() {
        let db = legacy_db().await;
        let migrator = Migrator::new(&TrackerConfig::default());

        let status = migrator.status(&db).await.unwrap();
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);
        assert_eq!(status.pending_versions, vec![2, 3]);

        let report = migrator.migrate(&db).await.unwrap();
        assert_eq!(report.from_version, 1);
        assert_eq!(report.to_version, LATEST_SCHEMA_VERSION);
        assert_eq!(report.rows_migrated, 4);
        assert_eq!(report.rows_skipped, 1);
        assert!(report.inferred_from_legacy);

        let rows = dump(&db).await;
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.2 == "US"));
        assert!(rows.iter().any(|r| r.0 == "2025-03-11" && r.1 == "MSFT" && r.4 == 6));
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let db = legacy_db().await;
        let migrator = Migrator::new(&TrackerConfig::default());

        migrator.migrate(&db).await.unwrap();
        let after_first = dump(&db).await;

        let second = migrator.migrate(&db).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.rows_migrated, 0);
        assert_eq!(second.from_version, LATEST_SCHEMA_VERSION);
        assert_eq!(dump(&db).await, after_first);
    }

    #[tokio::test]
    async fn test_new_key_allows_same_ticker_in_two_regions() {
        let db = legacy_db().await;
        Migrator::new(&TrackerConfig::default())
            .migrate(&db)
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO stock_scores (date, ticker, region, score, decile)
             VALUES ('2024-07-10', 'BEN', 'UK', 0.5, 5)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let (n,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM stock_scores WHERE ticker = 'BEN' AND date = '2024-07-10'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn test_region_column_without_region_key_is_legacy() {
        let db = GviDb::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE stock_scores (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                ticker TEXT NOT NULL,
                company_name TEXT,
                sector TEXT,
                score REAL,
                decile INTEGER,
                region TEXT DEFAULT 'US',
                UNIQUE(date, ticker)
            )",
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO stock_scores (date, ticker, score, decile, region) VALUES
                ('2024-01-01', 'SONY', 1.0, 4, 'Japan'),
                ('2024-01-01', 'HSBA', 1.0, 7, 'UK'),
                ('2024-01-01', 'ASML', 1.0, 8, 'Europe (excl UK)')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let migrator = Migrator::with_default_region(Region::Global);
        assert_eq!(migrator.status(&db).await.unwrap().current_version, 1);
        let report = migrator.migrate(&db).await.unwrap();
        assert_eq!(report.rows_migrated, 3);

        let rows = dump(&db).await;
        let regions: Vec<&str> = rows.iter().map(|r| r.2.as_str()).collect();
        assert_eq!(regions, vec!["Europe-excl-UK", "UK", "Japan"]);
    }

    #[tokio::test]
    async fn test_unmarked_current_shape_only_canonicalizes() {
        let db = GviDb::connect("sqlite::memory:").await.unwrap();
        sqlx::query(&CREATE_STAGING_SQL.replace("stock_scores_staging", "stock_scores"))
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(CREATE_UPLOAD_HISTORY_SQL)
            .execute(db.pool())
            .await
            .unwrap();

        let report = Migrator::new(&TrackerConfig::default())
            .migrate(&db)
            .await
            .unwrap();
        assert!(report.inferred_from_legacy);
        assert_eq!(report.from_version, 2);
        assert_eq!(report.steps_applied, vec!["canonical_labels"]);
        assert_eq!(report.rows_migrated, 0);
        assert_eq!(report.rows_skipped, 0);
    }

    #[tokio::test]
    async fn test_region_keyed_store_gets_canonical_labels() {
        let db = region_keyed_db().await;
        let migrator = Migrator::new(&TrackerConfig::default());

        let status = migrator.status(&db).await.unwrap();
        assert_eq!(status.current_version, 2);
        assert_eq!(status.pending_versions, vec![3]);

        let report = migrator.migrate(&db).await.unwrap();
        assert_eq!(report.steps_applied, vec!["canonical_labels"]);
        assert_eq!(report.to_version, LATEST_SCHEMA_VERSION);
        // Both 'Europe (excl UK)' rows were relabelled.
        assert_eq!(report.rows_migrated, 2);
        // The NULL score and the collision with the later canonical row.
        assert_eq!(report.rows_skipped, 2);

        let rows = dump(&db).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.1 == "ASML" && r.2 == "Europe-excl-UK"));
        assert_eq!((rows[0].0.as_str(), rows[0].4), ("2024-07-10", 4));
        assert_eq!((rows[1].0.as_str(), rows[1].3, rows[1].4), ("2025-03-11", 0.93, 9));

        let (label,): (String,) = sqlx::query_as("SELECT region FROM upload_history")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(label, "APAC-excl-Japan");
    }

    #[tokio::test]
    async fn test_unknown_ledger_region_is_left_and_counted() {
        let db = region_keyed_db().await;
        sqlx::query(
            "INSERT INTO upload_history
                (upload_timestamp, filename, date, region, stocks_count, status)
             VALUES ('2025-03-12 09:00:00', 'x.csv', '2025-03-12', 'Atlantis', 0, 'FAILED: x')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let report = Migrator::new(&TrackerConfig::default())
            .migrate(&db)
            .await
            .unwrap();
        assert_eq!(report.rows_skipped, 3);

        let labels: Vec<(String,)> =
            sqlx::query_as("SELECT region FROM upload_history ORDER BY id")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let labels: Vec<String> = labels.into_iter().map(|(l,)| l).collect();
        assert_eq!(labels, vec!["APAC-excl-Japan", "Atlantis"]);
    }

    #[tokio::test]
    async fn test_region_key_without_ledger_is_completed() {
        let db = GviDb::connect("sqlite::memory:").await.unwrap();
        sqlx::query(&CREATE_STAGING_SQL.replace("stock_scores_staging", "stock_scores"))
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO stock_scores (date, ticker, region, score, decile)
             VALUES ('2024-01-01', 'BP', 'UK', 1.0, 3)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let report = Migrator::new(&TrackerConfig::default())
            .migrate(&db)
            .await
            .unwrap();
        assert_eq!(report.from_version, 1);
        assert_eq!(report.rows_migrated, 1);
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM upload_history")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(dump(&db).await[0].2, "UK");
    }

    #[tokio::test]
    async fn test_failed_rewrite_leaves_legacy_store_untouched() {
        let db = legacy_db().await;
        let select = "SELECT date, ticker, decile FROM stock_scores ORDER BY id";
        let before = sqlx::query_as::<_, (String, String, i64)>(select)
            .fetch_all(db.pool())
            .await
            .unwrap();

        // A view squatting on the staging name makes the rewrite fail mid-step.
        sqlx::query("CREATE VIEW stock_scores_staging AS SELECT 1")
            .execute(db.pool())
            .await
            .unwrap();

        let migrator = Migrator::new(&TrackerConfig::default());
        let err = migrator.migrate(&db).await.unwrap_err();
        assert!(matches!(err, GviError::Migration(_)));

        let after = sqlx::query_as::<_, (String, String, i64)>(select)
            .fetch_all(db.pool())
            .await
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(migrator.status(&db).await.unwrap().current_version, 1);

        sqlx::query("DROP VIEW stock_scores_staging")
            .execute(db.pool())
            .await
            .unwrap();
        let report = migrator.migrate(&db).await.unwrap();
        assert_eq!(report.rows_migrated, 4);
    }

    #[tokio::test]
    async fn test_newer_schema_rejected() {
        let db = GviDb::connect("sqlite::memory:").await.unwrap();
        sqlx::query(CREATE_SCHEMA_MIGRATIONS_SQL)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO schema_migrations (version, name, applied_at)
             VALUES (99, 'future', '2030-01-01')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let err = Migrator::new(&TrackerConfig::default())
            .migrate(&db)
            .await
            .unwrap_err();
        assert!(matches!(err, GviError::Migration(_)));
    }

    #[test]
    fn test_parse_legacy_date() {
        let d = NaiveDate::from_ymd_opt(2024, 7, 10).unwrap();
        assert_eq!(parse_legacy_date("2024-07-10"), Some(d));
        assert_eq!(parse_legacy_date("2024-07-10 00:00:00"), Some(d));
        assert_eq!(parse_legacy_date("10/07/2024"), None);
    }
}
