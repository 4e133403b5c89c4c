use chrono::NaiveDate;
use thiserror::Error;

use crate::types::Region;

#[derive(Error, Debug)]
pub enum GviError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No data for {region} on {date}")]
    NoData { region: Region, date: NaiveDate },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GviError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// The missing comparison date, when this is a `NoData` failure.
    pub fn missing_date(&self) -> Option<NaiveDate> {
        match self {
            Self::NoData { date, .. } => Some(*date),
            _ => None,
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for GviError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GviError>;

/// A single rejected input row. `row` is the 1-based position among data rows.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RowError {
    pub row: usize,
    pub reason: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row {}: {}", self.row, self.reason)
    }
}
