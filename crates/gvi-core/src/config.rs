use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

use crate::error::{GviError, Result};
use crate::types::Region;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:gvi_data.db";

/// Named significance thresholds applied by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignificancePolicy {
    /// Newly entered the top or bottom `k` deciles.
    EdgeDecile { k: u8 },
    /// Moved by at least `n` deciles in either direction.
    MinimumDelta { n: u8 },
}

impl Default for SignificancePolicy {
    fn default() -> Self {
        SignificancePolicy::EdgeDecile { k: 3 }
    }
}

impl SignificancePolicy {
    pub fn edge_decile(k: u8) -> Result<Self> {
        let policy = SignificancePolicy::EdgeDecile { k };
        policy.validate()?;
        Ok(policy)
    }

    pub fn minimum_delta(n: u8) -> Result<Self> {
        let policy = SignificancePolicy::MinimumDelta { n };
        policy.validate()?;
        Ok(policy)
    }

    /// Bands wider than 5 would overlap, and a zero delta would count unchanged
    /// tickers as both improving and declining.
    pub fn validate(&self) -> Result<()> {
        match *self {
            SignificancePolicy::EdgeDecile { k } if !(1..=5).contains(&k) => Err(
                GviError::Validation(format!("edge decile band {} outside [1, 5]", k)),
            ),
            SignificancePolicy::MinimumDelta { n } if !(1..=9).contains(&n) => Err(
                GviError::Validation(format!("minimum decile delta {} outside [1, 9]", n)),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SignificancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignificancePolicy::EdgeDecile { k } => write!(f, "top/bottom {} deciles", k),
            SignificancePolicy::MinimumDelta { n } => write!(f, "moved {}+ deciles", n),
        }
    }
}

impl FromStr for SignificancePolicy {
    type Err = GviError;

    /// Accepts the preset names `top_bottom_3`, `magnitude_3`, `magnitude_5`
    /// and the general forms `edge:<k>` / `delta:<n>`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let parse_arg = |arg: &str| -> Result<u8> {
            arg.parse::<u8>()
                .map_err(|_| GviError::Validation(format!("invalid policy argument '{}'", arg)))
        };

        if let Some(k) = s.strip_prefix("top_bottom_").or_else(|| s.strip_prefix("edge:")) {
            return SignificancePolicy::edge_decile(parse_arg(k)?);
        }
        if let Some(n) = s.strip_prefix("magnitude_").or_else(|| s.strip_prefix("delta:")) {
            return SignificancePolicy::minimum_delta(parse_arg(n)?);
        }
        Err(GviError::Validation(format!("unknown significance policy '{}'", s)))
    }
}

/// Explicit tracker configuration handed to the migrator and the movement engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub database_url: String,
    /// Region assigned to rows written before regions existed.
    pub default_region: Region,
    pub significance_policy: SignificancePolicy,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            default_region: Region::Us,
            significance_policy: SignificancePolicy::default(),
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: env::var("GVI_DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            default_region: env::var("GVI_DEFAULT_REGION")
                .unwrap_or_else(|_| "US".to_string())
                .parse()
                .map_err(|e| GviError::Config(format!("GVI_DEFAULT_REGION: {}", e)))?,
            significance_policy: env::var("GVI_SIGNIFICANCE_POLICY")
                .unwrap_or_else(|_| "top_bottom_3".to_string())
                .parse()
                .map_err(|e| GviError::Config(format!("GVI_SIGNIFICANCE_POLICY: {}", e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(GviError::Config("database url is empty".to_string()));
        }
        self.significance_policy
            .validate()
            .map_err(|e| GviError::Config(e.to_string()))
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }
}
