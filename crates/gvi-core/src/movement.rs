//! Movement Engine
//!
//! Joins two snapshots of one region on ticker and reports the signed decile
//! change for every ticker present in both.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::classifier::{classify, Classification};
use crate::config::{SignificancePolicy, TrackerConfig};
use crate::error::{GviError, Result};
use crate::traits::SnapshotReader;
use crate::types::{Movement, Region, ScoreRecord};

/// Look-back window in calendar months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindow {
    pub months: u32,
}

impl RollingWindow {
    pub const THREE_MONTHS: RollingWindow = RollingWindow { months: 3 };
    pub const SIX_MONTHS: RollingWindow = RollingWindow { months: 6 };
    pub const TWELVE_MONTHS: RollingWindow = RollingWindow { months: 12 };

    pub fn months(months: u32) -> Result<Self> {
        if months == 0 {
            return Err(GviError::validation("rolling window must be at least one month"));
        }
        Ok(Self { months })
    }

    /// Latest date a start snapshot may have. Day-of-month is clamped at month end.
    pub fn target_start(&self, end: NaiveDate) -> Result<NaiveDate> {
        end.checked_sub_months(Months::new(self.months)).ok_or_else(|| {
            GviError::Validation(format!("{} months before {} is out of range", self.months, end))
        })
    }
}

impl fmt::Display for RollingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}M", self.months)
    }
}

impl FromStr for RollingWindow {
    type Err = GviError;

    /// Accepts `6`, `6m` or `6M`.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_end_matches(['m', 'M']);
        let months = digits
            .parse::<u32>()
            .map_err(|_| GviError::Validation(format!("invalid rolling window '{}'", s)))?;
        RollingWindow::months(months)
    }
}

/// Inner-join two snapshots on ticker. Tickers missing from either side are dropped.
/// The result is ordered by ticker.
pub fn join_snapshots(start: &[ScoreRecord], end: &[ScoreRecord]) -> Vec<Movement> {
    let by_ticker: HashMap<&str, &ScoreRecord> =
        start.iter().map(|r| (r.ticker.as_str(), r)).collect();

    let mut movements: Vec<Movement> = end
        .iter()
        .filter_map(|e| {
            by_ticker
                .get(e.ticker.as_str())
                .filter(|s| s.region == e.region)
                .map(|s| Movement::between(s, e))
        })
        .collect();

    movements.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    movements
}

/// Change from a ticker's earliest to its latest snapshot, within the region of
/// the latest one. `None` when that region holds fewer than two dates.
pub fn overall_movement(history: &[ScoreRecord]) -> Option<Movement> {
    let latest = history.iter().max_by_key(|r| r.date)?;
    let earliest = history
        .iter()
        .filter(|r| r.region == latest.region)
        .min_by_key(|r| r.date)?;
    if earliest.date == latest.date {
        return None;
    }
    Some(Movement::between(earliest, latest))
}

/// Movements between two snapshots together with their classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementReport {
    pub region: Region,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub policy: SignificancePolicy,
    pub total_analyzed: usize,
    /// Mean decile change across all joined tickers; 0.0 when nothing joined.
    pub average_change: f64,
    /// Every joined ticker, largest absolute change first.
    pub movements: Vec<Movement>,
    /// Number of tickers per decile change, from most negative to most positive.
    pub distribution: BTreeMap<i32, usize>,
    pub classification: Classification,
}

impl MovementReport {
    pub fn build(
        region: Region,
        date_start: NaiveDate,
        date_end: NaiveDate,
        policy: SignificancePolicy,
        mut movements: Vec<Movement>,
    ) -> Result<Self> {
        let classification = classify(&movements, &policy)?;
        let total_analyzed = movements.len();
        let average_change = if movements.is_empty() {
            0.0
        } else {
            movements.iter().map(|m| m.decile_change as f64).sum::<f64>() / total_analyzed as f64
        };

        movements.sort_by(|a, b| {
            b.decile_change
                .abs()
                .cmp(&a.decile_change.abs())
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        let mut distribution = BTreeMap::new();
        for m in &movements {
            *distribution.entry(m.decile_change).or_insert(0) += 1;
        }

        Ok(Self {
            region,
            date_start,
            date_end,
            policy,
            total_analyzed,
            average_change,
            movements,
            distribution,
            classification,
        })
    }
}

/// Computes decile movements over a read-only snapshot source.
pub struct MovementEngine<R> {
    reader: R,
    policy: SignificancePolicy,
}

impl<R: SnapshotReader> MovementEngine<R> {
    pub fn new(reader: R, config: &TrackerConfig) -> Self {
        Self {
            reader,
            policy: config.significance_policy,
        }
    }

    pub fn policy(&self) -> SignificancePolicy {
        self.policy
    }

    /// Movements of every ticker present in both the `start` and `end` snapshot.
    ///
    /// Fails with `NoData` naming the first endpoint that has no records, so an
    /// empty result always means "nothing in common" rather than "nothing stored".
    pub async fn compute_movements(
        &self,
        region: Region,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Movement>> {
        if start > end {
            return Err(GviError::Validation(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }

        let start_records = self.reader.snapshot(region, start).await?;
        if start_records.is_empty() {
            return Err(GviError::NoData { region, date: start });
        }
        let end_records = self.reader.snapshot(region, end).await?;
        if end_records.is_empty() {
            return Err(GviError::NoData { region, date: end });
        }

        let movements = join_snapshots(&start_records, &end_records);
        tracing::debug!(
            "{}: {} -> {} joined {} of {}/{} tickers",
            region,
            start,
            end,
            movements.len(),
            start_records.len(),
            end_records.len()
        );
        Ok(movements)
    }

    /// Closest snapshot date on or before `end - window` for the region.
    pub async fn resolve_window_start(
        &self,
        region: Region,
        end: NaiveDate,
        window: RollingWindow,
    ) -> Result<NaiveDate> {
        let target = window.target_start(end)?;
        let dates = self.reader.snapshot_dates(region).await?;

        dates
            .into_iter()
            .filter(|d| *d <= target)
            .max()
            .ok_or(GviError::NoData { region, date: target })
    }

    /// Movements over a rolling window ending at `end`. Returns the resolved start date too.
    pub async fn compute_rolling(
        &self,
        region: Region,
        end: NaiveDate,
        window: RollingWindow,
    ) -> Result<(NaiveDate, Vec<Movement>)> {
        let start = self.resolve_window_start(region, end, window).await?;
        let movements = self.compute_movements(region, start, end).await?;
        Ok((start, movements))
    }

    /// Classified report under the configured policy.
    pub async fn report(
        &self,
        region: Region,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<MovementReport> {
        self.report_with(region, start, end, self.policy).await
    }

    pub async fn report_with(
        &self,
        region: Region,
        start: NaiveDate,
        end: NaiveDate,
        policy: SignificancePolicy,
    ) -> Result<MovementReport> {
        policy.validate()?;
        let movements = self.compute_movements(region, start, end).await?;
        let report = MovementReport::build(region, start, end, policy, movements)?;
        tracing::info!(
            "{} {} -> {}: {} analyzed, {} improving, {} declining ({})",
            region,
            start,
            end,
            report.total_analyzed,
            report.classification.improving.len(),
            report.classification.declining.len(),
            policy
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct MemoryReader {
        records: Vec<ScoreRecord>,
    }

    #[async_trait]
    impl SnapshotReader for MemoryReader {
        async fn snapshot(&self, region: Region, date: NaiveDate) -> Result<Vec<ScoreRecord>> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.region == region && r.date == date)
                .cloned()
                .collect())
        }

        async fn snapshot_dates(&self, region: Region) -> Result<Vec<NaiveDate>> {
            let mut dates: Vec<NaiveDate> = self
                .records
                .iter()
                .filter(|r| r.region == region)
                .map(|r| r.date)
                .collect();
            dates.dedup();
            Ok(dates)
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn engine(records: Vec<ScoreRecord>) -> MovementEngine<MemoryReader> {
        MovementEngine::new(MemoryReader { records }, &TrackerConfig::default())
    }

    #[tokio::test]
    async fn test_ben_moves_eight_deciles() {
        let e = engine(vec![
            ScoreRecord::new(date(2024, 7, 10), "BEN", Region::Us, 0.1, 1),
            ScoreRecord::new(date(2025, 3, 11), "BEN", Region::Us, 0.9, 9),
        ]);
        let movements = e
            .compute_movements(Region::Us, date(2024, 7, 10), date(2025, 3, 11))
            .await
            .unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].decile_change, 8);

        let report = e.report(Region::Us, date(2024, 7, 10), date(2025, 3, 11))
            .await
            .unwrap();
        assert_eq!(report.classification.improving.len(), 1);
        assert!(report.classification.declining.is_empty());
        assert_eq!(report.average_change, 8.0);
    }

    #[tokio::test]
    async fn test_tickers_missing_from_either_side_are_dropped() {
        let start = date(2024, 1, 1);
        let end = date(2024, 4, 1);
        let e = engine(vec![
            ScoreRecord::new(start, "KEEP", Region::Us, 1.0, 2),
            ScoreRecord::new(start, "GONE", Region::Us, 1.0, 5),
            ScoreRecord::new(end, "KEEP", Region::Us, 1.0, 4),
            ScoreRecord::new(end, "NEW", Region::Us, 1.0, 7),
            ScoreRecord::new(end, "GONE", Region::Japan, 1.0, 7),
        ]);
        let movements = e.compute_movements(Region::Us, start, end).await.unwrap();
        let tickers: Vec<&str> = movements.iter().map(|m| m.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["KEEP"]);
    }

    #[tokio::test]
    async fn test_missing_snapshot_names_the_date() {
        let e = engine(vec![ScoreRecord::new(date(2024, 1, 1), "A", Region::Us, 1.0, 2)]);

        let err = e
            .compute_movements(Region::Us, date(2024, 1, 1), date(2024, 6, 1))
            .await
            .unwrap_err();
        assert_eq!(err.missing_date(), Some(date(2024, 6, 1)));

        let err = e
            .compute_movements(Region::Us, date(2023, 1, 1), date(2024, 1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.missing_date(), Some(date(2023, 1, 1)));

        // Data in another region does not count.
        let err = e
            .compute_movements(Region::Uk, date(2024, 1, 1), date(2024, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GviError::NoData { region: Region::Uk, .. }));
    }

    #[tokio::test]
    async fn test_reversed_range_rejected() {
        let e = engine(vec![]);
        let err = e
            .compute_movements(Region::Us, date(2025, 1, 1), date(2024, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GviError::Validation(_)));
    }

    #[tokio::test]
    async fn test_no_common_tickers_is_empty_not_error() {
        let e = engine(vec![
            ScoreRecord::new(date(2024, 1, 1), "A", Region::Us, 1.0, 2),
            ScoreRecord::new(date(2024, 2, 1), "B", Region::Us, 1.0, 2),
        ]);
        let movements = e
            .compute_movements(Region::Us, date(2024, 1, 1), date(2024, 2, 1))
            .await
            .unwrap();
        assert!(movements.is_empty());
    }

    #[tokio::test]
    async fn test_rolling_window_picks_closest_preceding_snapshot() {
        let e = engine(vec![
            ScoreRecord::new(date(2024, 1, 1), "A", Region::Us, 1.0, 2),
            ScoreRecord::new(date(2024, 4, 1), "A", Region::Us, 1.0, 3),
            ScoreRecord::new(date(2024, 7, 1), "A", Region::Us, 1.0, 4),
            ScoreRecord::new(date(2024, 10, 1), "A", Region::Us, 1.0, 9),
        ]);
        let start = e
            .resolve_window_start(Region::Us, date(2024, 10, 1), RollingWindow::SIX_MONTHS)
            .await
            .unwrap();
        assert_eq!(start, date(2024, 4, 1));

        // One day short of the boundary falls back to the earlier snapshot.
        let start = e
            .resolve_window_start(Region::Us, date(2024, 9, 30), RollingWindow::SIX_MONTHS)
            .await
            .unwrap();
        assert_eq!(start, date(2024, 1, 1));

        let (start, movements) = e
            .compute_rolling(Region::Us, date(2024, 10, 1), RollingWindow::THREE_MONTHS)
            .await
            .unwrap();
        assert_eq!(start, date(2024, 7, 1));
        assert_eq!(movements[0].decile_change, 5);
    }

    #[tokio::test]
    async fn test_rolling_window_without_history_is_no_data() {
        let e = engine(vec![ScoreRecord::new(date(2024, 10, 1), "A", Region::Us, 1.0, 2)]);
        let err = e
            .resolve_window_start(Region::Us, date(2024, 10, 1), RollingWindow::TWELVE_MONTHS)
            .await
            .unwrap_err();
        assert_eq!(err.missing_date(), Some(date(2023, 10, 1)));
    }

    #[test]
    fn test_window_parsing_and_month_end_clamp() {
        assert_eq!("6m".parse::<RollingWindow>().unwrap(), RollingWindow::SIX_MONTHS);
        assert_eq!("12".parse::<RollingWindow>().unwrap(), RollingWindow::TWELVE_MONTHS);
        assert!("0".parse::<RollingWindow>().is_err());
        assert!("six".parse::<RollingWindow>().is_err());
        assert_eq!(
            RollingWindow::THREE_MONTHS.target_start(date(2024, 5, 31)).unwrap(),
            date(2024, 2, 29)
        );
    }

    #[test]
    fn test_report_orders_by_absolute_change() {
        let s = date(2024, 1, 1);
        let e = date(2024, 6, 1);
        let pair = |ticker: &str, from: u8, to: u8| {
            Movement::between(
                &ScoreRecord::new(s, ticker, Region::Us, 0.0, from),
                &ScoreRecord::new(e, ticker, Region::Us, 0.0, to),
            )
        };
        let movements = vec![pair("A", 5, 6), pair("B", 9, 2), pair("C", 2, 5)];
        let report =
            MovementReport::build(Region::Us, s, e, SignificancePolicy::default(), movements)
                .unwrap();
        let order: Vec<&str> = report.movements.iter().map(|m| m.ticker.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "A"]);
        assert_eq!(report.total_analyzed, 3);
        assert!((report.average_change - (-1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_report_distribution_counts_each_change() {
        let s = date(2024, 1, 1);
        let e = date(2024, 6, 1);
        let pair = |ticker: &str, from: u8, to: u8| {
            Movement::between(
                &ScoreRecord::new(s, ticker, Region::Us, 0.0, from),
                &ScoreRecord::new(e, ticker, Region::Us, 0.0, to),
            )
        };
        let movements = vec![
            pair("A", 5, 6),
            pair("B", 9, 2),
            pair("C", 3, 4),
            pair("D", 4, 4),
        ];
        let report =
            MovementReport::build(Region::Us, s, e, SignificancePolicy::default(), movements)
                .unwrap();
        let distribution: Vec<(i32, usize)> =
            report.distribution.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(distribution, vec![(-7, 1), (0, 1), (1, 2)]);
        assert_eq!(report.distribution.values().sum::<usize>(), report.total_analyzed);

        let empty =
            MovementReport::build(Region::Us, s, e, SignificancePolicy::default(), Vec::new())
                .unwrap();
        assert!(empty.distribution.is_empty());
    }

    #[test]
    fn test_report_rejects_invalid_policy() {
        let s = date(2024, 1, 1);
        let e = date(2024, 6, 1);
        let policy = SignificancePolicy::EdgeDecile { k: 0 };
        assert!(MovementReport::build(Region::Us, s, e, policy, Vec::new()).is_err());
    }

    #[test]
    fn test_overall_movement_uses_latest_region() {
        let history = vec![
            ScoreRecord::new(date(2024, 1, 1), "HSBA", Region::Global, 0.2, 2),
            ScoreRecord::new(date(2024, 3, 1), "HSBA", Region::Uk, 0.3, 3),
            ScoreRecord::new(date(2024, 6, 1), "HSBA", Region::Global, 0.4, 4),
            ScoreRecord::new(date(2024, 9, 1), "HSBA", Region::Uk, 0.8, 8),
        ];
        let overall = overall_movement(&history).unwrap();
        assert_eq!(overall.region, Region::Uk);
        assert_eq!(overall.date_start, date(2024, 3, 1));
        assert_eq!(overall.date_end, date(2024, 9, 1));
        assert_eq!(overall.decile_change, 5);

        assert!(overall_movement(&history[..1]).is_none());
        assert!(overall_movement(&[]).is_none());
    }
}
