use async_trait::async_trait;
use chrono::NaiveDate;
use gvi_core::{
    normalize_ticker, validate_decile, GviError, Region, Result, ScoreRecord, SnapshotReader,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::db::GviDb;

const SELECT_SCORES: &str =
    "SELECT date, ticker, company_name, sector, region, score, decile FROM stock_scores";

#[derive(Debug, FromRow)]
struct ScoreRow {
    date: NaiveDate,
    ticker: String,
    company_name: Option<String>,
    sector: Option<String>,
    region: String,
    score: Option<f64>,
    decile: i64,
}

impl TryFrom<ScoreRow> for ScoreRecord {
    type Error = GviError;

    fn try_from(row: ScoreRow) -> Result<Self> {
        let score = row.score.ok_or_else(|| {
            GviError::Storage(format!("{} on {} has no score", row.ticker, row.date))
        })?;
        Ok(ScoreRecord {
            date: row.date,
            ticker: row.ticker,
            company_name: row.company_name,
            sector: row.sector,
            region: row.region.parse()?,
            score,
            decile: validate_decile(row.decile)?,
        })
    }
}

/// Record count of one (region, date) snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub region: Region,
    pub date: NaiveDate,
    pub stock_count: i64,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    region: String,
    date: NaiveDate,
    stock_count: i64,
}

/// Filters for [`SnapshotStore::query`]. Bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct SnapshotQuery {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub region: Option<Region>,
    pub ticker: Option<String>,
    /// Sort ascending by date, then ticker.
    pub ordered: bool,
}

impl SnapshotQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(date: NaiveDate) -> Self {
        Self {
            date_from: Some(date),
            date_to: Some(date),
            ..Self::default()
        }
    }

    pub fn between(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.date_from = Some(from);
        self.date_to = Some(to);
        self
    }

    pub fn region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn ticker(mut self, ticker: &str) -> Self {
        self.ticker = Some(normalize_ticker(ticker));
        self
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }
}

/// Owns persistence of score records, keyed by (date, ticker, region).
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(db: &GviDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Insert or replace every record in one transaction. Later values win on
    /// key collisions, including collisions within the batch.
    ///
    /// The whole batch is validated before anything is written.
    pub async fn upsert(&self, records: &[ScoreRecord]) -> Result<usize> {
        for (i, rec) in records.iter().enumerate() {
            rec.validate().map_err(|e| {
                GviError::Validation(format!("record {} ({}): {}", i + 1, rec.ticker, e))
            })?;
        }

        let mut tx = self.pool.begin().await?;
        for rec in records {
            sqlx::query(
                r#"
                INSERT INTO stock_scores (date, ticker, company_name, sector, region, score, decile)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(date, ticker, region) DO UPDATE SET
                    company_name = excluded.company_name,
                    sector = excluded.sector,
                    score = excluded.score,
                    decile = excluded.decile
                "#,
            )
            .bind(rec.date)
            .bind(normalize_ticker(&rec.ticker))
            .bind(&rec.company_name)
            .bind(&rec.sector)
            .bind(rec.region.as_str())
            .bind(rec.score)
            .bind(rec.decile as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!("Upserted {} score records", records.len());
        Ok(records.len())
    }

    pub async fn query(&self, filter: &SnapshotQuery) -> Result<Vec<ScoreRecord>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_SCORES);
        qb.push(" WHERE 1 = 1");
        if let Some(from) = filter.date_from {
            qb.push(" AND date >= ").push_bind(from);
        }
        if let Some(to) = filter.date_to {
            qb.push(" AND date <= ").push_bind(to);
        }
        if let Some(region) = filter.region {
            qb.push(" AND region = ").push_bind(region.as_str());
        }
        if let Some(ticker) = &filter.ticker {
            qb.push(" AND ticker = ").push_bind(ticker.clone());
        }
        if filter.ordered {
            qb.push(" ORDER BY date ASC, ticker ASC");
        }

        let rows: Vec<ScoreRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ScoreRecord::try_from).collect()
    }

    pub async fn snapshot(&self, region: Region, date: NaiveDate) -> Result<Vec<ScoreRecord>> {
        self.query(&SnapshotQuery::on(date).region(region)).await
    }

    /// Distinct snapshot dates, newest first, optionally for one region.
    pub async fn dates(&self, region: Option<Region>) -> Result<Vec<NaiveDate>> {
        let rows: Vec<(NaiveDate,)> = match region {
            Some(region) => {
                sqlx::query_as(
                    "SELECT DISTINCT date FROM stock_scores WHERE region = ? ORDER BY date DESC",
                )
                .bind(region.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT DISTINCT date FROM stock_scores ORDER BY date DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    pub async fn latest_date(&self, region: Region) -> Result<Option<NaiveDate>> {
        let (date,): (Option<NaiveDate>,) =
            sqlx::query_as("SELECT MAX(date) FROM stock_scores WHERE region = ?")
                .bind(region.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(date)
    }

    pub async fn regions(&self) -> Result<Vec<Region>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT region FROM stock_scores")
            .fetch_all(&self.pool)
            .await?;
        let mut regions = rows
            .into_iter()
            .map(|(r,)| r.parse())
            .collect::<Result<Vec<Region>>>()?;
        regions.sort();
        Ok(regions)
    }

    /// Record counts per snapshot, by region then newest date first.
    pub async fn summary(&self) -> Result<Vec<SnapshotSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            r#"
            SELECT region, date, COUNT(*) AS stock_count
            FROM stock_scores
            GROUP BY region, date
            ORDER BY region, date DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(SnapshotSummary {
                    region: r.region.parse()?,
                    date: r.date,
                    stock_count: r.stock_count,
                })
            })
            .collect()
    }

    /// Every stored record for a ticker, oldest first.
    pub async fn ticker_history(
        &self,
        ticker: &str,
        region: Option<Region>,
    ) -> Result<Vec<ScoreRecord>> {
        let mut filter = SnapshotQuery::new().ticker(ticker).ordered();
        filter.region = region;
        self.query(&filter).await
    }

    /// Remove whole snapshots matching a date, a region, or both.
    pub async fn delete(&self, date: Option<NaiveDate>, region: Option<Region>) -> Result<u64> {
        let result = match (date, region) {
            (Some(date), Some(region)) => {
                sqlx::query("DELETE FROM stock_scores WHERE date = ? AND region = ?")
                    .bind(date)
                    .bind(region.as_str())
                    .execute(&self.pool)
                    .await?
            }
            (Some(date), None) => {
                sqlx::query("DELETE FROM stock_scores WHERE date = ?")
                    .bind(date)
                    .execute(&self.pool)
                    .await?
            }
            (None, Some(region)) => {
                sqlx::query("DELETE FROM stock_scores WHERE region = ?")
                    .bind(region.as_str())
                    .execute(&self.pool)
                    .await?
            }
            (None, None) => {
                return Err(GviError::validation("delete requires a date, a region, or both"));
            }
        };

        tracing::info!(
            "Deleted {} records (date={:?}, region={:?})",
            result.rows_affected(),
            date,
            region
        );
        Ok(result.rows_affected())
    }

    /// Remove every score record. The upload ledger is kept.
    pub async fn reset(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM stock_scores")
            .execute(&self.pool)
            .await?;
        tracing::warn!("Reset score store, {} records removed", result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SnapshotReader for SnapshotStore {
    async fn snapshot(&self, region: Region, date: NaiveDate) -> Result<Vec<ScoreRecord>> {
        SnapshotStore::snapshot(self, region, date).await
    }

    async fn snapshot_dates(&self, region: Region) -> Result<Vec<NaiveDate>> {
        self.dates(Some(region)).await
    }
}
