use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::types::{Region, ScoreRecord};

/// Read-only access to stored snapshots, as needed by the movement engine.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    /// All records of one (region, date) snapshot; empty if none exist.
    async fn snapshot(&self, region: Region, date: NaiveDate) -> Result<Vec<ScoreRecord>>;

    /// Distinct snapshot dates for a region, in any order.
    async fn snapshot_dates(&self, region: Region) -> Result<Vec<NaiveDate>>;
}
