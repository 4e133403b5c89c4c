//! Upload Ledger
//!
//! Append-only audit trail of ingestion attempts. Entries are never updated or
//! deleted. Entries whose region or status no longer parses are skipped on
//! read rather than failing the whole listing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use gvi_core::{GviError, Region, Result, UploadEvent, UploadStatus};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::db::GviDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Success,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub status: Option<StatusFilter>,
    pub region: Option<Region>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, FromRow)]
struct UploadRow {
    id: i64,
    upload_timestamp: String,
    filename: String,
    date: NaiveDate,
    region: String,
    stocks_count: Option<i64>,
    status: Option<String>,
}

impl TryFrom<UploadRow> for UploadEvent {
    type Error = GviError;

    fn try_from(row: UploadRow) -> Result<Self> {
        Ok(UploadEvent {
            id: Some(row.id),
            timestamp: parse_timestamp(&row.upload_timestamp)?,
            filename: row.filename,
            date: row.date,
            region: row.region.parse()?,
            stocks_count: row.stocks_count.unwrap_or(0),
            status: row
                .status
                .as_deref()
                .unwrap_or("FAILED: unknown")
                .parse()?,
        })
    }
}

#[derive(Clone)]
pub struct UploadLedger {
    pool: SqlitePool,
}

impl UploadLedger {
    pub fn new(db: &GviDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Append one event and return its id.
    pub async fn record(&self, event: &UploadEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_history
                (upload_timestamp, filename, date, region, stocks_count, status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(&event.timestamp))
        .bind(&event.filename)
        .bind(event.date)
        .bind(event.region.as_str())
        .bind(event.stocks_count)
        .bind(event.status.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Matching events, newest first.
    pub async fn list(&self, filter: &LedgerFilter) -> Result<Vec<UploadEvent>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, upload_timestamp, filename, date, region, stocks_count, status
             FROM upload_history WHERE 1 = 1",
        );
        match filter.status {
            Some(StatusFilter::Success) => {
                qb.push(" AND status = ")
                    .push_bind(UploadStatus::Success.to_string());
            }
            Some(StatusFilter::Failed) => {
                qb.push(" AND status LIKE 'FAILED%'");
            }
            None => {}
        }
        if let Some(region) = filter.region {
            qb.push(" AND region = ").push_bind(region.as_str());
        }
        if let Some(from) = filter.date_from {
            qb.push(" AND date >= ").push_bind(from);
        }
        if let Some(to) = filter.date_to {
            qb.push(" AND date <= ").push_bind(to);
        }
        qb.push(" ORDER BY upload_timestamp DESC, id DESC");

        let rows: Vec<UploadRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let events = rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                match UploadEvent::try_from(row) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!("Skipping unreadable upload history entry {}: {}", id, e);
                        None
                    }
                }
            })
            .collect();
        Ok(events)
    }

    pub async fn all(&self) -> Result<Vec<UploadEvent>> {
        self.list(&LedgerFilter::default()).await
    }
}

/// Fixed-width UTC timestamps keep text ordering chronological.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts RFC 3339 and the naive ISO form older uploads wrote.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|_| GviError::Storage(format!("unreadable upload timestamp '{}'", raw)))
}
