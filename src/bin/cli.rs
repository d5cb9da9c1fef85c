//! Strata CLI
//!
//! Offline operations on a Strata data directory:
//! - Import and export series
//! - Inspect labels and series
//! - Delete series, manage snapshots, force merges
//!
//! The server must not be running on the same directory; the directory
//! lock refuses a second opener.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use strata::config::{generate_default_config, init_tracing, Config};
use strata::index::TagFilter;
use strata::ingest::{csv, jsonl, ImportFormat, Importer};
use strata::query::{parse_selector, parse_time_range};
use strata::storage::{SearchContext, StorageEngine, TimeRange};

#[derive(Parser)]
#[command(name = "strata-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Maintenance tool for Strata data directories")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment only)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overrides the config file
    #[arg(short, long, global = true)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import series from JSON lines or CSV
    Import {
        /// Input file
        path: PathBuf,
        /// jsonl or csv (default: from the file extension)
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Export matching series
    Export {
        /// Series selectors, e.g. 'cpu{host="a"}'
        #[arg(required = true)]
        selectors: Vec<String>,
        /// Start: now-1h, RFC3339 or unix seconds
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// jsonl or csv
        #[arg(short, long, default_value = "jsonl")]
        format: String,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List label names
    Labels {
        /// Restrict to series matching these selectors
        selectors: Vec<String>,
        #[arg(short, long, default_value = "1000")]
        limit: usize,
    },

    /// List values of one label
    LabelValues {
        name: String,
        selectors: Vec<String>,
        #[arg(short, long, default_value = "1000")]
        limit: usize,
    },

    /// Number of live series
    SeriesCount,

    /// Delete series matching the selectors
    DeleteSeries {
        #[arg(required = true)]
        selectors: Vec<String>,
    },

    /// Manage snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Merge all parts of matching partitions into one
    ForceMerge {
        /// Partition name prefix, e.g. 2024_05 (default: all)
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Show storage statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum SnapshotAction {
    Create,
    List,
    Delete { name: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        return write_config(output.as_ref());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    // Quiet unless asked; output goes to stdout
    config.logging.level = std::env::var("STRATA_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    init_tracing(&config.logging);

    let engine = Arc::new(
        StorageEngine::open(config.storage_config())
            .with_context(|| format!("cannot open {}", config.storage.data_dir))?,
    );
    let result = run(cli.command, &engine, &config);
    engine.must_close()?;
    result
}

fn run(command: Commands, engine: &Arc<StorageEngine>, config: &Config) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp_millis();

    match command {
        Commands::Import { path, format } => {
            let format: ImportFormat = match format {
                Some(f) => f.parse()?,
                None if path.extension().map(|e| e == "csv").unwrap_or(false) => ImportFormat::Csv,
                None => ImportFormat::JsonLines,
            };
            let file = File::open(&path).with_context(|| format!("cannot open {:?}", path))?;
            let importer = Importer::new(Arc::clone(engine), config.importer_config())?;
            let stats = importer.import(BufReader::new(file), format)?;
            println!("Imported {:?}: {}", path, stats);
            if let Some(err) = &stats.first_parse_error {
                eprintln!("First parse error: {}", err);
            }
            engine.force_flush()?;
        }

        Commands::Export {
            selectors,
            start,
            end,
            format,
            output,
        } => {
            let filter_sets = parse_selectors(&selectors)?;
            let tr = if start.is_none() && end.is_none() {
                TimeRange::all()
            } else {
                parse_time_range(start.as_deref(), end.as_deref(), now)?
            };
            let format: ImportFormat = format.parse()?;
            let out: Box<dyn Write> = match &output {
                Some(path) => Box::new(File::create(path).with_context(|| format!("cannot create {:?}", path))?),
                None => Box::new(std::io::stdout().lock()),
            };
            let mut out = BufWriter::new(out);
            let exported = match format {
                ImportFormat::JsonLines => {
                    export(engine, &filter_sets, &tr, |s| jsonl::write_series(&mut out, s))?
                }
                ImportFormat::Csv => {
                    let mut w = ::csv::Writer::from_writer(&mut out);
                    let n = export(engine, &filter_sets, &tr, |s| csv::write_series(&mut w, s))?;
                    w.flush()?;
                    n
                }
            };
            out.flush()?;
            if output.is_some() {
                println!("Exported {} series", exported);
            }
        }

        Commands::Labels { selectors, limit } => {
            let names = union(&parse_selectors(&selectors)?, |filters| {
                engine.search_label_names(filters, &TimeRange::all(), limit)
            })?;
            print_list(&names, limit);
        }

        Commands::LabelValues { name, selectors, limit } => {
            let values = union(&parse_selectors(&selectors)?, |filters| {
                engine.search_label_values(&name, filters, &TimeRange::all(), limit)
            })?;
            print_list(&values, limit);
        }

        Commands::SeriesCount => {
            println!("{}", engine.series_count());
        }

        Commands::DeleteSeries { selectors } => {
            let mut deleted = 0;
            for filters in parse_selectors(&selectors)? {
                deleted += engine.delete_series(&filters)?;
            }
            println!("Deleted {} series", deleted);
        }

        Commands::Snapshot { action } => match action {
            SnapshotAction::Create => {
                let name = engine.create_snapshot()?;
                println!("{}", name);
                println!("Path: {:?}", engine.snapshot_path(&name));
            }
            SnapshotAction::List => {
                let names = engine.list_snapshots()?;
                if names.is_empty() {
                    println!("No snapshots.");
                }
                for name in names {
                    println!("{}", name);
                }
            }
            SnapshotAction::Delete { name } => {
                engine.delete_snapshot(&name)?;
                println!("Deleted snapshot {}", name);
            }
        },

        Commands::ForceMerge { prefix } => {
            let merged = engine.force_merge(&prefix)?;
            println!("Merged {} partitions", merged);
        }

        Commands::Stats { json } => {
            let stats = engine.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Strata v{}", env!("CARGO_PKG_VERSION"));
                println!("Data directory: {:?}", engine.data_dir());
                println!();
                print!("{}", stats);
            }
        }

        Commands::Config { output } => write_config(output.as_ref())?,
    }
    Ok(())
}

fn write_config(output: Option<&PathBuf>) -> anyhow::Result<()> {
    let content = generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, content).with_context(|| format!("cannot write {:?}", path))?;
            println!("Config written to {:?}", path);
        }
        None => print!("{}", content),
    }
    Ok(())
}

fn parse_selectors(selectors: &[String]) -> anyhow::Result<Vec<Vec<TagFilter>>> {
    selectors
        .iter()
        .map(|s| parse_selector(s).with_context(|| format!("bad selector {:?}", s)))
        .collect()
}

/// Write every matching series once; returns how many
fn export(
    engine: &StorageEngine,
    filter_sets: &[Vec<TagFilter>],
    tr: &TimeRange,
    mut write: impl FnMut(&strata::storage::Series) -> strata::ingest::ImportResult<()>,
) -> anyhow::Result<usize> {
    let mut seen = HashSet::new();
    for filters in filter_sets {
        for series in engine.search(filters, tr, SearchContext::new())? {
            let series = series?;
            if seen.insert(series.tsid.metric_id) {
                write(&series)?;
            }
        }
    }
    Ok(seen.len())
}

fn union(
    filter_sets: &[Vec<TagFilter>],
    mut search: impl FnMut(&[TagFilter]) -> strata::storage::StorageResult<strata::index::Truncated<String>>,
) -> anyhow::Result<Vec<String>> {
    let mut out = std::collections::BTreeSet::new();
    if filter_sets.is_empty() {
        out.extend(search(&[])?.items);
    }
    for filters in filter_sets {
        out.extend(search(filters)?.items);
    }
    Ok(out.into_iter().collect())
}

fn print_list(items: &[String], limit: usize) {
    for item in items.iter().take(limit) {
        println!("{}", item);
    }
    if items.len() > limit {
        eprintln!("... {} more", items.len() - limit);
    }
}
