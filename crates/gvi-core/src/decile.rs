//! Cohort-relative decile ranking.
//!
//! A decile is a rank bucket within one (date, region) cohort, never an absolute
//! score threshold. Higher scores rank better: the lowest score lands in decile 1
//! and the highest in decile 10.

use std::collections::HashMap;

use crate::types::{Region, ScoreRecord, MAX_DECILE};
use chrono::NaiveDate;

/// Assign a decile to every score by rank. Tied scores share the decile of
/// their lowest rank. Scores must be finite.
pub fn assign_deciles(scores: &[f64]) -> Vec<u8> {
    let n = scores.len();
    if n == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut deciles = vec![0u8; n];
    let mut tie_rank = 0;
    for (rank, &idx) in order.iter().enumerate() {
        if rank > 0 && scores[idx] != scores[order[rank - 1]] {
            tie_rank = rank;
        }
        deciles[idx] = rank_to_decile(tie_rank, n);
    }
    deciles
}

/// Map a 0-based ascending rank in a population of `n` onto 1..=10.
pub fn rank_to_decile(rank: usize, n: usize) -> u8 {
    debug_assert!(rank < n);
    ((rank * MAX_DECILE as usize) / n) as u8 + 1
}

/// Vendor files rank 1 = best; the tracker stores 10 = best.
pub fn reverse_vendor_decile(decile: u8) -> u8 {
    MAX_DECILE + 1 - decile
}

/// Recompute deciles in place, ranking each (date, region) cohort separately.
pub fn assign_cohort_deciles(records: &mut [ScoreRecord]) {
    let mut cohorts: HashMap<(NaiveDate, Region), Vec<usize>> = HashMap::new();
    for (idx, rec) in records.iter().enumerate() {
        cohorts.entry((rec.date, rec.region)).or_default().push(idx);
    }

    for members in cohorts.values() {
        let scores: Vec<f64> = members.iter().map(|&i| records[i].score).collect();
        for (&i, decile) in members.iter().zip(assign_deciles(&scores)) {
            records[i].decile = decile;
        }
    }
}
