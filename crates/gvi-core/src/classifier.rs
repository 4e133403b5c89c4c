//! Significance classification of decile movements.

use serde::{Deserialize, Serialize};

use crate::config::SignificancePolicy;
use crate::error::Result;
use crate::types::{Movement, MAX_DECILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Improving,
    Declining,
}

/// Significant movers split by direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub improving: Vec<Movement>,
    pub declining: Vec<Movement>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.improving.is_empty() && self.declining.is_empty()
    }
}

impl SignificancePolicy {
    /// Direction of a single movement under this policy, `None` if not significant.
    /// An out-of-range band matches nothing; [`classify`] rejects it up front.
    pub fn direction(&self, m: &Movement) -> Option<Direction> {
        let start = m.decile_start;
        let end = m.decile_end;
        match *self {
            SignificancePolicy::EdgeDecile { k } => {
                let top_floor = MAX_DECILE.saturating_sub(k);
                if end > top_floor && start <= top_floor {
                    Some(Direction::Improving)
                } else if end <= k && start > k {
                    Some(Direction::Declining)
                } else {
                    None
                }
            }
            SignificancePolicy::MinimumDelta { n } => {
                let n = n as i32;
                if m.decile_change >= n {
                    Some(Direction::Improving)
                } else if m.decile_change <= -n {
                    Some(Direction::Declining)
                } else {
                    None
                }
            }
        }
    }
}

/// Split movements into significant improvers and decliners.
///
/// Improvers are ordered by decile change descending, decliners ascending,
/// ticker breaking ties. Fails on a policy outside its valid range.
pub fn classify(movements: &[Movement], policy: &SignificancePolicy) -> Result<Classification> {
    policy.validate()?;

    let mut out = Classification::default();
    for m in movements {
        match policy.direction(m) {
            Some(Direction::Improving) => out.improving.push(m.clone()),
            Some(Direction::Declining) => out.declining.push(m.clone()),
            None => {}
        }
    }

    out.improving.sort_by(|a, b| {
        b.decile_change
            .cmp(&a.decile_change)
            .then_with(|| a.ticker.cmp(&b.ticker))
    });
    out.declining.sort_by(|a, b| {
        a.decile_change
            .cmp(&b.decile_change)
            .then_with(|| a.ticker.cmp(&b.ticker))
    });
    Ok(out)
}
