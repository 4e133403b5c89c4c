use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{GviError, Result};

pub const MIN_DECILE: u8 = 1;
pub const MAX_DECILE: u8 = 10;

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// Closed set of regions a snapshot can belong to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Region {
    #[default]
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "Europe-excl-UK", alias = "Europe (excl UK)")]
    EuropeExUk,
    #[serde(rename = "UK")]
    Uk,
    #[serde(
        rename = "APAC-excl-Japan",
        alias = "APAC (excl Japan)",
        alias = "APAC (excl. Japan)"
    )]
    ApacExJapan,
    #[serde(rename = "Japan")]
    Japan,
    #[serde(rename = "China")]
    China,
    #[serde(rename = "Global")]
    Global,
    #[serde(rename = "Emerging Markets")]
    EmergingMarkets,
}

impl Region {
    pub const ALL: [Region; 8] = [
        Region::Us,
        Region::EuropeExUk,
        Region::Uk,
        Region::ApacExJapan,
        Region::Japan,
        Region::China,
        Region::Global,
        Region::EmergingMarkets,
    ];

    /// Canonical label, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Us => "US",
            Region::EuropeExUk => "Europe-excl-UK",
            Region::Uk => "UK",
            Region::ApacExJapan => "APAC-excl-Japan",
            Region::Japan => "Japan",
            Region::China => "China",
            Region::Global => "Global",
            Region::EmergingMarkets => "Emerging Markets",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = GviError;

    fn from_str(s: &str) -> Result<Self> {
        // Labels written by older uploads are accepted alongside the canonical ones.
        let region = match s.trim().to_ascii_lowercase().as_str() {
            "us" => Region::Us,
            "europe-excl-uk" | "europe (excl uk)" => Region::EuropeExUk,
            "uk" => Region::Uk,
            "apac-excl-japan" | "apac (excl japan)" | "apac (excl. japan)" => Region::ApacExJapan,
            "japan" => Region::Japan,
            "china" => Region::China,
            "global" => Region::Global,
            "emerging markets" | "emerging-markets" => Region::EmergingMarkets,
            other => {
                return Err(GviError::Validation(format!("unknown region '{}'", other)));
            }
        };
        Ok(region)
    }
}

// ---------------------------------------------------------------------------
// ScoreRecord
// ---------------------------------------------------------------------------

/// One security's score and decile on one date in one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub date: NaiveDate,
    pub ticker: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub region: Region,
    pub score: f64,
    pub decile: u8,
}

impl ScoreRecord {
    pub fn new(
        date: NaiveDate,
        ticker: &str,
        region: Region,
        score: f64,
        decile: u8,
    ) -> Self {
        Self {
            date,
            ticker: normalize_ticker(ticker),
            company_name: None,
            sector: None,
            region,
            score,
            decile,
        }
    }

    pub fn with_company(
        mut self,
        company_name: impl Into<String>,
        sector: impl Into<String>,
    ) -> Self {
        self.company_name = Some(company_name.into());
        self.sector = Some(sector.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if normalize_ticker(&self.ticker).is_empty() {
            return Err(GviError::validation("ticker is empty"));
        }
        validate_decile(self.decile as i64)?;
        if !self.score.is_finite() {
            return Err(GviError::Validation(format!(
                "score for {} is not a finite number",
                self.ticker
            )));
        }
        Ok(())
    }
}

/// Tickers are compared trimmed and upper-cased.
pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

pub fn validate_decile(decile: i64) -> Result<u8> {
    if (MIN_DECILE as i64..=MAX_DECILE as i64).contains(&decile) {
        Ok(decile as u8)
    } else {
        Err(GviError::Validation(format!(
            "decile {} outside [{}, {}]",
            decile, MIN_DECILE, MAX_DECILE
        )))
    }
}

// ---------------------------------------------------------------------------
// Upload audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UploadStatus {
    Success,
    Failed(String),
}

impl UploadStatus {
    pub fn failed(reason: impl Into<String>) -> Self {
        UploadStatus::Failed(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UploadStatus::Success)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Success => f.write_str("SUCCESS"),
            UploadStatus::Failed(reason) => write!(f, "FAILED: {}", reason),
        }
    }
}

impl FromStr for UploadStatus {
    type Err = GviError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "SUCCESS" {
            return Ok(UploadStatus::Success);
        }
        match s.strip_prefix("FAILED") {
            Some(rest) => {
                let reason = rest.trim_start_matches(':').trim();
                Ok(UploadStatus::Failed(reason.to_string()))
            }
            None => Err(GviError::Validation(format!("unknown upload status '{}'", s))),
        }
    }
}

impl TryFrom<String> for UploadStatus {
    type Error = GviError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<UploadStatus> for String {
    fn from(status: UploadStatus) -> Self {
        status.to_string()
    }
}

/// Audit entry for one ingestion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub date: NaiveDate,
    pub region: Region,
    pub stocks_count: i64,
    pub status: UploadStatus,
}

impl UploadEvent {
    pub fn new(
        filename: impl Into<String>,
        date: NaiveDate,
        region: Region,
        stocks_count: i64,
        status: UploadStatus,
    ) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            filename: filename.into(),
            date,
            region,
            stocks_count,
            status,
        }
    }
}

// ---------------------------------------------------------------------------
// Movement
// ---------------------------------------------------------------------------

/// A ticker's decile transition between two snapshots of the same region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub ticker: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub region: Region,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub decile_start: u8,
    pub decile_end: u8,
    pub decile_change: i32,
}

impl Movement {
    /// Builds the movement from the two endpoint records. Descriptive fields come from `end`.
    pub fn between(start: &ScoreRecord, end: &ScoreRecord) -> Self {
        Self {
            ticker: end.ticker.clone(),
            company_name: end.company_name.clone(),
            sector: end.sector.clone(),
            region: end.region,
            date_start: start.date,
            date_end: end.date,
            decile_start: start.decile,
            decile_end: end.decile,
            decile_change: end.decile as i32 - start.decile as i32,
        }
    }
}
