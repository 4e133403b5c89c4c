//! CSV export of movement reports and the upload ledger. Both writers emit the
//! header line even when there are no rows.

use csv::WriterBuilder;
use gvi_core::{Movement, Result, UploadEvent};
use std::io::Write;

const MOVEMENT_COLUMNS: [&str; 7] = [
    "ticker",
    "company_name",
    "sector",
    "region",
    "decile_start",
    "decile_end",
    "decile_change",
];

const UPLOAD_COLUMNS: [&str; 6] = [
    "upload_timestamp",
    "filename",
    "date",
    "region",
    "stocks_count",
    "status",
];

#[derive(serde::Serialize)]
struct MovementRow<'a> {
    ticker: &'a str,
    company_name: &'a str,
    sector: &'a str,
    region: &'a str,
    decile_start: u8,
    decile_end: u8,
    decile_change: i32,
}

#[derive(serde::Serialize)]
struct UploadRow<'a> {
    upload_timestamp: String,
    filename: &'a str,
    date: String,
    region: &'a str,
    stocks_count: i64,
    status: String,
}

fn writer<W: Write>(w: W, columns: &[&str]) -> Result<csv::Writer<W>> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_writer(w);
    wtr.write_record(columns).map_err(std::io::Error::from)?;
    Ok(wtr)
}

fn finish<W: Write>(mut wtr: csv::Writer<W>) -> Result<()> {
    wtr.flush()?;
    Ok(())
}

/// Write movements with the columns
/// `ticker,company_name,sector,region,decile_start,decile_end,decile_change`.
pub fn write_movements<W: Write>(w: W, movements: &[Movement]) -> Result<()> {
    let mut wtr = writer(w, &MOVEMENT_COLUMNS)?;
    for m in movements {
        wtr.serialize(MovementRow {
            ticker: &m.ticker,
            company_name: m.company_name.as_deref().unwrap_or(""),
            sector: m.sector.as_deref().unwrap_or(""),
            region: m.region.as_str(),
            decile_start: m.decile_start,
            decile_end: m.decile_end,
            decile_change: m.decile_change,
        })
        .map_err(std::io::Error::from)?;
    }
    finish(wtr)
}

pub fn write_upload_history<W: Write>(w: W, events: &[UploadEvent]) -> Result<()> {
    let mut wtr = writer(w, &UPLOAD_COLUMNS)?;
    for e in events {
        wtr.serialize(UploadRow {
            upload_timestamp: e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            filename: &e.filename,
            date: e.date.to_string(),
            region: e.region.as_str(),
            stocks_count: e.stocks_count,
            status: e.status.to_string(),
        })
        .map_err(std::io::Error::from)?;
    }
    finish(wtr)
}
