//! trackfuse: multi-source aircraft and vessel telemetry fusion service.

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use track_core::config::{self, Config};
use track_core::types::{EntityClass, FusedTrackRecord, RawTrackRecord};

mod adapter;
mod aggregator;
mod channel;
mod db;
mod logging;
mod notifier;
mod pipeline;
mod service;
mod web;

use db::{Database, TrackStore};
use service::Components;

#[derive(Parser)]
#[command(name = "trackfuse", version, about = "Aircraft and vessel telemetry fusion")]
struct Cli {
    /// Config file (defaults to ~/.trackfuse/config.yaml)
    #[arg(long, global = true, env = "TRACKFUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll all enabled providers and run the fusion pipeline
    Run {
        /// SQLite database path
        #[arg(long, env = "TRACKFUSE_DB")]
        db_path: Option<String>,

        /// Status API bind address
        #[arg(long)]
        host: Option<String>,

        /// Status API port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Feed a JSON-lines file of raw records through the pipeline
    Replay {
        /// Path to file containing one raw record per line ("-" for stdin)
        file: PathBuf,

        /// SQLite database path
        #[arg(long, env = "TRACKFUSE_DB")]
        db_path: Option<String>,
    },

    /// Show database statistics
    Stats {
        /// SQLite database path
        #[arg(long, env = "TRACKFUSE_DB")]
        db_path: Option<String>,

        /// Also list the durable history of one entity (ICAO hex or MMSI)
        #[arg(long)]
        entity: Option<String>,
    },

    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match cli.command {
        Commands::Run { db_path, host, port } => {
            let config = load(cli.config.as_deref());
            cmd_run(config, db_path, host, port).await
        }
        Commands::Replay { file, db_path } => {
            let config = load(cli.config.as_deref());
            cmd_replay(config, file, db_path).await
        }
        Commands::Stats { db_path, entity } => {
            let config = load(cli.config.as_deref());
            cmd_stats(db_path.unwrap_or(config.database.path), entity).await
        }
        Commands::InitConfig { force } => cmd_init_config(cli.config.as_deref(), force),
    }
}

fn load(path: Option<&Path>) -> Config {
    let result = match path {
        Some(p) => config::load_config_from(p),
        None => config::load_config(),
    };
    result.unwrap_or_else(|e| {
        eprintln!("Error loading config: {e}");
        std::process::exit(1);
    })
}

fn open_db(db_path: &str) -> Database {
    Database::open(db_path).unwrap_or_else(|e| {
        eprintln!("Error opening database {db_path}: {e}");
        std::process::exit(1);
    })
}

async fn cmd_run(mut config: Config, db_path: Option<String>, host: Option<String>, port: Option<u16>) {
    if let Some(p) = db_path {
        config.database.path = p;
    }
    let host = host.unwrap_or_else(|| config.status.host.clone());
    let port = port.unwrap_or(config.status.port);

    let database = open_db(&config.database.path);
    info!(db = %config.database.path, "database open");

    let components = Components::new(config, Arc::new(database));
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed");
        }
        ctrl_c.cancel();
    });

    service::run(components, host, port, cancel).await;
}

/// Replay uses record receipt times as the clock, so a fusion window closes
/// when the first record past its end arrives.
async fn cmd_replay(mut config: Config, file: PathBuf, db_path: Option<String>) {
    if let Some(p) = db_path {
        config.database.path = p;
    }
    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(&file).unwrap_or_else(|e| {
            eprintln!("Error opening {}: {e}", file.display());
            std::process::exit(1);
        });
        Box::new(io::BufReader::new(f))
    };

    let db_path = config.database.path.clone();
    let database = Arc::new(open_db(&db_path));
    let store: Arc<dyn TrackStore> = database.clone();
    let components = Components::new(config, store);

    let report = replay(&components, reader).await;

    // Print summary
    let s = components.stats.snapshot();
    println!();
    println!("Replay complete: {}", file.display());
    println!("  Lines: {} total, {} unreadable", report.lines, report.unreadable);
    println!("  Raw records: {} buffered, {} invalid", s.raw_received, s.raw_invalid);
    println!(
        "  Fusion: {} fused, {} filtered, {} failed",
        s.fused, s.filtered, s.fusion_failures
    );
    println!(
        "  Storage: {} persisted, {} cache-only, {} duplicates",
        s.persisted, s.cache_only, s.duplicates
    );
    println!();
    println!("Database: {db_path}");

    match database.current().await {
        Ok(current) if !current.is_empty() => {
            println!();
            println!("{}", track_table(&current));
        }
        Ok(_) => {}
        Err(e) => eprintln!("Error reading current tracks: {e}"),
    }
}

#[derive(Debug, Default, PartialEq)]
struct ReplayReport {
    lines: u64,
    unreadable: u64,
}

async fn replay(c: &Components, reader: impl BufRead) -> ReplayReport {
    let mut report = ReplayReport::default();
    let mut window_end: HashMap<EntityClass, f64> = HashMap::new();
    let mut clock = 0.0f64;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => continue,
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        report.lines += 1;

        let record = match serde_json::from_str::<RawTrackRecord>(line) {
            Ok(r) => r.normalized(),
            Err(e) => {
                report.unreadable += 1;
                warn!(line = report.lines, error = %e, "unreadable line");
                continue;
            }
        };
        if let Err(e) = record.validate() {
            pipeline::PipelineStats::incr(&c.stats.raw_invalid);
            warn!(entity = %record.entity_id, error = %e, "invalid record");
            continue;
        }

        let class = record.class;
        let aggregator = c.aggregator(class);
        clock = clock.max(record.received_at);

        if let Some(end) = window_end.get(&class).copied() {
            if record.received_at >= end {
                aggregator.flush(&c.engine, &c.pipeline, end).await;
                window_end.remove(&class);
            }
        }
        window_end
            .entry(class)
            .or_insert(record.received_at + c.config.fusion.timing(class).fusion_interval_secs);

        pipeline::PipelineStats::incr(&c.stats.raw_received);
        if aggregator.ingest(record) {
            aggregator.flush(&c.engine, &c.pipeline, clock).await;
            window_end.remove(&class);
        }
    }

    for class in EntityClass::ALL {
        let end = window_end.get(&class).copied().unwrap_or(clock);
        c.aggregator(class).flush(&c.engine, &c.pipeline, end).await;
    }
    report
}

fn track_table(records: &[FusedTrackRecord]) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "ID", "Class", "Callsign/Name", "Status", "Alt (ft)", "Speed", "Course", "Lat", "Lon", "Quality",
        "Sources",
    ]);

    for r in records {
        let f = &r.fields;
        table.add_row(vec![
            Cell::new(&r.entity_id),
            Cell::new(r.class),
            Cell::new(f.callsign.as_deref().or(f.name.as_deref()).unwrap_or("-")),
            Cell::new(f.status.as_deref().unwrap_or("-")),
            Cell::new(f.altitude_ft.map(|a| a.to_string()).unwrap_or("-".into())),
            Cell::new(f.speed_kts.map(|s| format!("{s:.0}")).unwrap_or("-".into())),
            Cell::new(f.course_deg.map(|c| format!("{c:.1}")).unwrap_or("-".into())),
            Cell::new(f.lat.map(|l| format!("{l:.4}")).unwrap_or("-".into())),
            Cell::new(f.lon.map(|l| format!("{l:.4}")).unwrap_or("-".into())),
            Cell::new(format!("{:.2}", r.quality)),
            Cell::new(r.sources.iter().cloned().collect::<Vec<_>>().join(",")),
        ]);
    }
    table
}

async fn cmd_stats(db_path: String, entity: Option<String>) {
    let database = open_db(&db_path);
    let stats = match database.stats().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading database {db_path}: {e}");
            std::process::exit(1);
        }
    };

    println!();
    println!("Database: {db_path}");
    println!();
    let mut table = Table::new();
    table.set_header(vec!["Class", "Current", "History", "Raw"]);
    table.add_row(vec![
        Cell::new("aircraft"),
        Cell::new(stats.current_aircraft),
        Cell::new(stats.history_aircraft),
        Cell::new(stats.raw_aircraft),
    ]);
    table.add_row(vec![
        Cell::new("vessel"),
        Cell::new(stats.current_vessels),
        Cell::new(stats.history_vessels),
        Cell::new(stats.raw_vessels),
    ]);
    println!("{table}");
    println!();

    let Some(id) = entity else {
        return;
    };
    let id = track_core::types::normalize_entity_id(&id);
    match database.history(&id).await {
        Ok(history) if history.is_empty() => println!("No history for {id}"),
        Ok(history) => {
            println!("History for {id}: {} snapshots", history.len());
            println!("{}", track_table(&history));
        }
        Err(e) => eprintln!("Error reading history for {id}: {e}"),
    }
    match database.raw_records(&id).await {
        Ok(raw) => {
            let linked = raw.iter().filter(|a| a.fused_at.is_some()).count();
            println!("Raw reports for {id}: {} archived, {linked} linked to a fused record", raw.len());
        }
        Err(e) => eprintln!("Error reading raw reports for {id}: {e}"),
    }
}

fn cmd_init_config(path: Option<&Path>, force: bool) {
    let target = path.map(Path::to_path_buf).unwrap_or_else(config::config_file);
    if target.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", target.display());
        std::process::exit(1);
    }
    let defaults = Config::default();
    let result = match path {
        Some(p) => std::fs::write(p, config::serialize_config(&defaults))
            .map(|_| p.to_path_buf())
            .map_err(|e| e.to_string()),
        None => config::save_config(&defaults).map_err(|e| e.to_string()),
    };
    match result {
        Ok(p) => println!("Wrote {}", p.display()),
        Err(e) => {
            eprintln!("Error writing config: {e}");
            std::process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
