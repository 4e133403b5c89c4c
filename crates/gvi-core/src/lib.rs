//! GVI Core
//!
//! Domain types, configuration and the pure parts of the decile-movement
//! engine: cohort ranking, snapshot joins and significance classification.

pub mod classifier;
pub mod config;
pub mod decile;
pub mod error;
pub mod movement;
pub mod traits;
pub mod types;

pub use classifier::{classify, Classification, Direction};
pub use config::{SignificancePolicy, TrackerConfig};
pub use error::{GviError, Result, RowError};
pub use movement::{join_snapshots, overall_movement, MovementEngine, MovementReport, RollingWindow};
pub use traits::SnapshotReader;
pub use types::*;
