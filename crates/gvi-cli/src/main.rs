use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use gvi_core::{
    overall_movement, Movement, MovementEngine, MovementReport, Region, RollingWindow,
    SignificancePolicy, TrackerConfig,
};
use gvi_store::{
    write_movements, write_upload_history, DecileSource, GviDb, Ingestor, LedgerFilter, Migrator,
    SnapshotStore, StatusFilter, UploadLedger,
};

/// How many significant movers to print per direction.
const DISPLAY_LIMIT: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "gvi", version, about = "GVI decile movement tracker")]
struct Cli {
    /// Database URL (overrides GVI_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Region for rows stored before regions existed (overrides GVI_DEFAULT_REGION)
    #[arg(long, global = true)]
    default_region: Option<Region>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the database schema up to date
    Migrate,
    /// Show the schema version and pending migrations
    Status,
    /// Upload a score file as one snapshot
    Upload {
        #[arg(short, long, value_name = "PATH")]
        file: PathBuf,
        /// Snapshot date (YYYY-MM-DD)
        #[arg(short, long)]
        date: NaiveDate,
        #[arg(short, long)]
        region: Option<Region>,
        /// Take deciles from the file instead of ranking scores
        #[arg(long)]
        decile_column: bool,
        /// The decile column ranks 1 = best
        #[arg(long, requires = "decile_column")]
        vendor_order: bool,
    },
    /// List snapshot dates, newest first
    Dates {
        #[arg(short, long)]
        region: Option<Region>,
    },
    /// List regions with stored data
    Regions,
    /// Record counts per snapshot
    Summary,
    /// Decile movements between two snapshots
    Analyze {
        #[arg(short, long)]
        region: Option<Region>,
        #[arg(long, conflicts_with = "window_months")]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Look back N months from --end (or the latest snapshot)
        #[arg(long, value_name = "N")]
        window_months: Option<RollingWindow>,
        /// top_bottom_3, magnitude_3, magnitude_5, edge:K or delta:N
        #[arg(long)]
        policy: Option<SignificancePolicy>,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
        /// Write every movement to a CSV file
        #[arg(long, value_name = "PATH")]
        export: Option<PathBuf>,
    },
    /// Decile history of one ticker
    Ticker {
        #[arg(short, long)]
        symbol: String,
        #[arg(short, long)]
        region: Option<Region>,
    },
    /// Upload audit trail, newest first
    History {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(short, long)]
        region: Option<Region>,
        #[arg(long, value_name = "PATH")]
        export: Option<PathBuf>,
    },
    /// Delete whole snapshots by date, region, or both
    Delete {
        #[arg(short, long)]
        date: Option<NaiveDate>,
        #[arg(short, long)]
        region: Option<Region>,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StatusArg {
    Success,
    Failed,
}

impl From<StatusArg> for StatusFilter {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Success => StatusFilter::Success,
            StatusArg::Failed => StatusFilter::Failed,
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("gvi=info,gvi_core=info,gvi_store=info")
    });
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    let cli = Cli::parse();

    let mut config = TrackerConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.database_url {
        config = config.with_database_url(url);
    }
    if let Some(region) = cli.default_region {
        config.default_region = region;
    }
    config.validate()?;
    tracing::debug!("Using database {}", config.database_url);

    match cli.command {
        Command::Migrate => {
            let db = GviDb::connect(&config.database_url).await?;
            let report = Migrator::new(&config).migrate(&db).await?;
            if report.is_noop() {
                println!("Schema already at version {}", report.to_version);
            } else {
                println!(
                    "Migrated schema {} -> {} ({}): {} rows carried over, {} skipped",
                    report.from_version,
                    report.to_version,
                    report.steps_applied.join(", "),
                    report.rows_migrated,
                    report.rows_skipped
                );
            }
            db.close().await;
        }
        Command::Status => {
            let db = GviDb::connect(&config.database_url).await?;
            let status = Migrator::new(&config).status(&db).await?;
            println!(
                "Schema version: {} (latest {})",
                status.current_version, status.target_version
            );
            if status.inferred_from_legacy {
                println!("Version inferred from table layout; run `gvi migrate` to record it");
            }
            if !status.pending_versions.is_empty() {
                println!("Pending: {:?}", status.pending_versions);
            }
            db.close().await;
        }
        command => {
            let (db, _) = GviDb::open(&config).await?;
            let outcome = run(command, &db, &config).await;
            db.close().await;
            outcome?;
        }
    }

    Ok(())
}

async fn run(command: Command, db: &GviDb, config: &TrackerConfig) -> Result<()> {
    let store = SnapshotStore::new(db);

    match command {
        Command::Upload {
            file,
            date,
            region,
            decile_column,
            vendor_order,
        } => {
            let region = region.unwrap_or(config.default_region);
            let source = if decile_column {
                DecileSource::Column {
                    reversed: vendor_order,
                }
            } else {
                DecileSource::Rank
            };

            println!("Uploading {} for {} on {}...", file.display(), region, date);
            let ingestor = Ingestor::new(store, UploadLedger::new(db));
            let outcome = ingestor.upload_file(&file, date, region, source).await;
            for rejected in &outcome.rejected {
                println!("  skipped {}", rejected);
            }
            println!("{}", outcome.message());
            if !outcome.is_success() {
                bail!("upload failed");
            }
        }
        Command::Dates { region } => {
            let dates = store.dates(region).await?;
            println!("\nAvailable dates ({} total):", dates.len());
            for date in dates {
                println!("  {}", date);
            }
        }
        Command::Regions => {
            for region in store.regions().await? {
                println!("{}", region);
            }
        }
        Command::Summary => {
            println!("{:<20} {:<12} {:>8}", "Region", "Date", "Stocks");
            for row in store.summary().await? {
                println!(
                    "{:<20} {:<12} {:>8}",
                    row.region.as_str(),
                    row.date.to_string(),
                    row.stock_count
                );
            }
        }
        Command::Analyze {
            region,
            start,
            end,
            window_months,
            policy,
            json,
            export,
        } => {
            let region = region.unwrap_or(config.default_region);
            let policy = policy.unwrap_or(config.significance_policy);
            let engine = MovementEngine::new(store.clone(), config);

            let (start, end) = match (window_months, start, end) {
                (Some(window), _, end) => {
                    let end = match end {
                        Some(end) => end,
                        None => store
                            .latest_date(region)
                            .await?
                            .with_context(|| format!("No snapshots stored for {}", region))?,
                    };
                    (engine.resolve_window_start(region, end, window).await?, end)
                }
                (None, Some(start), Some(end)) => (start, end),
                _ => bail!("analyze needs --start and --end, or --window-months"),
            };

            let report = engine.report_with(region, start, end, policy).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if let Some(path) = export {
                let file = File::create(&path)
                    .with_context(|| format!("Cannot create {}", path.display()))?;
                write_movements(BufWriter::new(file), &report.movements)?;
                println!("Exported {} movements to {}", report.movements.len(), path.display());
            }
        }
        Command::Ticker { symbol, region } => {
            let history = store.ticker_history(&symbol, region).await?;
            let Some(first) = history.first() else {
                println!("No data found for {}", symbol.to_uppercase());
                return Ok(());
            };
            println!(
                "\n{} - {}",
                first.ticker,
                first.company_name.as_deref().unwrap_or("")
            );
            println!("{}", "=".repeat(70));
            println!("{:<12} {:<20} {:>10} {:>7}", "Date", "Region", "Score", "Decile");
            for rec in &history {
                println!(
                    "{:<12} {:<20} {:>10.4} {:>7}",
                    rec.date.to_string(),
                    rec.region.as_str(),
                    rec.score,
                    rec.decile
                );
            }
            if let Some(overall) = overall_movement(&history) {
                println!(
                    "\nOverall ({}): decile {} on {} -> {} on {} ({:+})",
                    overall.region,
                    overall.decile_start,
                    overall.date_start,
                    overall.decile_end,
                    overall.date_end,
                    overall.decile_change
                );
            }
        }
        Command::History { status, region, export } => {
            let filter = LedgerFilter {
                status: status.map(StatusFilter::from),
                region,
                ..Default::default()
            };
            let events = UploadLedger::new(db).list(&filter).await?;
            match export {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("Cannot create {}", path.display()))?;
                    write_upload_history(BufWriter::new(file), &events)?;
                    println!("Exported {} upload events to {}", events.len(), path.display());
                }
                None => {
                    for e in &events {
                        println!(
                            "{}  {:<30} {}  {:<16} {:>6}  {}",
                            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            e.filename,
                            e.date,
                            e.region.as_str(),
                            e.stocks_count,
                            e.status
                        );
                    }
                }
            }
        }
        Command::Delete { date, region } => {
            let removed = store.delete(date, region).await?;
            println!("Deleted {} records", removed);
        }
        Command::Migrate | Command::Status => unreachable!("handled before the store is opened"),
    }

    Ok(())
}

fn print_report(report: &MovementReport) {
    println!(
        "\nAnalyzing movements from {} to {} ({})",
        report.date_start, report.date_end, report.region
    );
    println!("{}", "=".repeat(70));
    println!("Note: Decile 10 = Best Quality | Decile 1 = Worst Quality");
    println!("Policy: {}", report.policy);
    println!("{}", "=".repeat(70));
    println!(
        "Analyzed {} stocks, average change {:+.2}",
        report.total_analyzed, report.average_change
    );

    print_movers("Stocks Moving Up", &report.classification.improving);
    print_movers("Stocks Moving Down", &report.classification.declining);

    if !report.distribution.is_empty() {
        println!("\nDecile Movement Distribution:");
        println!("{:>6} {:>8}", "Change", "Stocks");
        for (change, count) in &report.distribution {
            println!("{:>+6} {:>8}", change, count);
        }
    }
}

fn print_movers(title: &str, movers: &[Movement]) {
    println!("\n{}: {}", title, movers.len());
    if movers.is_empty() {
        return;
    }
    println!(
        "{:<8} {:<32} {:<24} {:>5} {:>5} {:>6}",
        "Ticker", "Company", "Sector", "From", "To", "Change"
    );
    for m in movers.iter().take(DISPLAY_LIMIT) {
        println!(
            "{:<8} {:<32} {:<24} {:>5} {:>5} {:>+6}",
            m.ticker,
            m.company_name.as_deref().unwrap_or(""),
            m.sector.as_deref().unwrap_or(""),
            m.decile_start,
            m.decile_end,
            m.decile_change
        );
    }
}
