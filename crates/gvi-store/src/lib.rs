pub mod db;
pub mod export;
pub mod ingest;
pub mod ledger;
pub mod migrator;
pub mod snapshots;


pub use db::GviDb;
pub use export::{write_movements, write_upload_history};
pub use ingest::{parse_snapshot, DecileSource, Ingestor, ParsedSnapshot, UploadOutcome};
pub use ledger::{LedgerFilter, StatusFilter, UploadLedger};
pub use migrator::{MigrationReport, Migrator, SchemaStatus, LATEST_SCHEMA_VERSION};
pub use snapshots::{SnapshotQuery, SnapshotStore, SnapshotSummary};
