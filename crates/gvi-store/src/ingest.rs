//! Snapshot ingestion: parse a score file, rank it, store it, and log the attempt.

use chrono::NaiveDate;
use gvi_core::decile::{assign_deciles, reverse_vendor_decile};
use gvi_core::{
    normalize_ticker, validate_decile, GviError, Region, Result, RowError, ScoreRecord,
    UploadEvent, UploadStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::ledger::UploadLedger;
use crate::snapshots::SnapshotStore;

const TICKER_HEADERS: &[&str] = &["ticker", "symbol", "company symbol"];
const COMPANY_HEADERS: &[&str] = &["company_name", "company name", "company"];
const SECTOR_HEADERS: &[&str] = &["sector", "factset econ sector"];
const SCORE_HEADERS: &[&str] = &["score", "gvi score"];
const DECILE_HEADERS: &[&str] = &["decile", "score (decile)"];

/// Where a snapshot's deciles come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecileSource {
    /// Rank the file's scores within the snapshot.
    #[default]
    Rank,
    /// Use the file's decile column. `reversed` converts a 1 = best column.
    Column { reversed: bool },
}

#[derive(Debug, Default)]
pub struct ParsedSnapshot {
    pub records: Vec<ScoreRecord>,
    pub rejected: Vec<RowError>,
}

struct Columns {
    ticker: usize,
    score: usize,
    company: Option<usize>,
    sector: Option<usize>,
    decile: Option<usize>,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord) -> Result<Self> {
        let find = |aliases: &[&str]| {
            headers
                .iter()
                .position(|h| aliases.contains(&h.trim().to_lowercase().as_str()))
        };

        Ok(Self {
            ticker: find(TICKER_HEADERS)
                .ok_or_else(|| GviError::validation("file has no ticker column"))?,
            score: find(SCORE_HEADERS)
                .ok_or_else(|| GviError::validation("file has no score column"))?,
            company: find(COMPANY_HEADERS),
            sector: find(SECTOR_HEADERS),
            decile: find(DECILE_HEADERS),
        })
    }
}

fn text(record: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| record.get(i))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_decile(raw: &str, reversed: bool) -> std::result::Result<u8, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("non-numeric decile '{}'", raw.trim()))?;
    if value.fract() != 0.0 {
        return Err(format!("decile {} is not a whole number", value));
    }
    let decile = validate_decile(value as i64).map_err(|e| e.to_string())?;
    Ok(if reversed { reverse_vendor_decile(decile) } else { decile })
}

/// Parse one snapshot file. Rows with a missing ticker, a non-numeric score or
/// an unusable decile are rejected individually; a repeated ticker keeps its
/// last row.
pub fn parse_snapshot<R: Read>(
    reader: R,
    date: NaiveDate,
    region: Region,
    source: DecileSource,
) -> Result<ParsedSnapshot> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers().map_err(std::io::Error::from)?.clone();
    let columns = Columns::resolve(&headers)?;
    let reversed = match source {
        DecileSource::Column { reversed } => {
            if columns.decile.is_none() {
                return Err(GviError::validation("file has no decile column"));
            }
            Some(reversed)
        }
        DecileSource::Rank => None,
    };

    let mut parsed = ParsedSnapshot::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (i, result) in rdr.records().enumerate() {
        let row = i + 1;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                parsed.rejected.push(RowError {
                    row,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let ticker = normalize_ticker(record.get(columns.ticker).unwrap_or(""));
        if ticker.is_empty() {
            parsed.rejected.push(RowError {
                row,
                reason: "missing ticker".to_string(),
            });
            continue;
        }

        let raw_score = record.get(columns.score).unwrap_or("").trim();
        let score = match raw_score.parse::<f64>() {
            Ok(s) if s.is_finite() => s,
            _ => {
                parsed.rejected.push(RowError {
                    row,
                    reason: format!("non-numeric score '{}' for {}", raw_score, ticker),
                });
                continue;
            }
        };

        let decile = match reversed {
            Some(reversed) => {
                let raw = columns.decile.and_then(|i| record.get(i)).unwrap_or("");
                match parse_decile(raw, reversed) {
                    Ok(d) => d,
                    Err(reason) => {
                        parsed.rejected.push(RowError { row, reason });
                        continue;
                    }
                }
            }
            // Placeholder until the cohort is ranked below.
            None => 1,
        };

        let rec = ScoreRecord {
            date,
            ticker: ticker.clone(),
            company_name: text(&record, columns.company),
            sector: text(&record, columns.sector),
            region,
            score,
            decile,
        };

        match positions.get(&ticker) {
            Some(&idx) => {
                tracing::warn!("Row {}: duplicate ticker {}, keeping the later row", row, ticker);
                parsed.records[idx] = rec;
            }
            None => {
                positions.insert(ticker, parsed.records.len());
                parsed.records.push(rec);
            }
        }
    }

    if source == DecileSource::Rank {
        let scores: Vec<f64> = parsed.records.iter().map(|r| r.score).collect();
        for (rec, decile) in parsed.records.iter_mut().zip(assign_deciles(&scores)) {
            rec.decile = decile;
        }
    }

    Ok(parsed)
}

/// Result of one upload attempt. Exactly one ledger event is written per attempt.
#[derive(Debug)]
pub struct UploadOutcome {
    pub event: UploadEvent,
    pub stored: usize,
    pub rejected: Vec<RowError>,
    /// Why the upload failed, if it did.
    pub error: Option<GviError>,
    /// Set when the audit entry itself could not be written.
    pub ledger_error: Option<GviError>,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn message(&self) -> String {
        match &self.error {
            None => format!(
                "Successfully added {} stocks for {} on {}",
                self.stored, self.event.region, self.event.date
            ),
            Some(e) => format!("Error uploading file: {}", e),
        }
    }
}

/// The ingestion path: owns both the snapshot write and its audit entry.
#[derive(Clone)]
pub struct Ingestor {
    store: SnapshotStore,
    ledger: UploadLedger,
}

impl Ingestor {
    pub fn new(store: SnapshotStore, ledger: UploadLedger) -> Self {
        Self { store, ledger }
    }

    pub async fn upload_file(
        &self,
        path: &Path,
        date: NaiveDate,
        region: Region,
        source: DecileSource,
    ) -> UploadOutcome {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        match File::open(path) {
            Ok(file) => {
                self.upload_reader(&filename, file, date, region, source)
                    .await
            }
            Err(e) => {
                self.finish(&filename, date, region, 0, Vec::new(), Some(e.into()))
                    .await
            }
        }
    }

    pub async fn upload_reader<R: Read>(
        &self,
        filename: &str,
        reader: R,
        date: NaiveDate,
        region: Region,
        source: DecileSource,
    ) -> UploadOutcome {
        let parsed = match parse_snapshot(reader, date, region, source) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .finish(filename, date, region, 0, Vec::new(), Some(e))
                    .await
            }
        };

        for rejection in &parsed.rejected {
            tracing::warn!("{}: rejected {}", filename, rejection);
        }

        if parsed.records.is_empty() {
            let err = GviError::Validation(format!(
                "no valid rows ({} rejected)",
                parsed.rejected.len()
            ));
            return self
                .finish(filename, date, region, 0, parsed.rejected, Some(err))
                .await;
        }

        match self.store.upsert(&parsed.records).await {
            Ok(stored) => {
                self.finish(filename, date, region, stored, parsed.rejected, None)
                    .await
            }
            Err(e) => {
                self.finish(filename, date, region, 0, parsed.rejected, Some(e))
                    .await
            }
        }
    }

    async fn finish(
        &self,
        filename: &str,
        date: NaiveDate,
        region: Region,
        stored: usize,
        rejected: Vec<RowError>,
        error: Option<GviError>,
    ) -> UploadOutcome {
        let status = match &error {
            None => UploadStatus::Success,
            Some(e) => UploadStatus::failed(e.to_string()),
        };
        let mut event = UploadEvent::new(filename, date, region, stored as i64, status);

        let ledger_error = match self.ledger.record(&event).await {
            Ok(id) => {
                event.id = Some(id);
                None
            }
            Err(e) => {
                tracing::warn!("Failed to write upload ledger entry for {}: {}", filename, e);
                Some(e)
            }
        };

        match &error {
            None => tracing::info!(
                "Uploaded {}: {} stocks for {} on {} ({} rows rejected)",
                filename,
                stored,
                region,
                date,
                rejected.len()
            ),
            Some(e) => {
                tracing::warn!("Upload of {} for {} on {} failed: {}", filename, region, date, e)
            }
        }

        UploadOutcome {
            event,
            stored,
            rejected,
            error,
            ledger_error,
        }
    }
}
