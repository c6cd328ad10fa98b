use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use elog_core::size::format_size;
use elog_ingest::{process_artifact, IngestReport};
use elog_storage::ExperimentStore;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "elog")]
#[command(about = "Reconcile crawled experiment artifacts into a SQLite store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk-load artifacts into a store, creating it if needed
    Load {
        /// Artifact files (*.info.json, *.file_manager.csv,
        /// *.logbook.csv, *.runtable.json)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Path to the SQLite store
        #[arg(long, default_value = "experiment_database.db")]
        db: PathBuf,
    },
    /// Incrementally refresh an existing store
    Update {
        /// Path to the existing SQLite store
        #[arg(long)]
        db: PathBuf,

        /// Artifact files to fold into the store
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Load { files, db } => {
            let mut store = ExperimentStore::open(&db)
                .with_context(|| format!("failed to open store at {}", db.display()))?;
            run_batch(&mut store, &files);
        }
        Commands::Update { db, files } => {
            let mut store = ExperimentStore::open_existing(&db)
                .with_context(|| format!("cannot update store at {}", db.display()))?;
            run_batch(&mut store, &files);
        }
    }

    Ok(())
}

/// Processes artifacts strictly in the order given. A failed artifact
/// is reported and skipped; committed artifacts and the rest of the
/// batch are unaffected.
fn run_batch(store: &mut ExperimentStore, files: &[PathBuf]) {
    let mut totals = IngestReport::default();

    for file in files {
        match process_artifact(store, file) {
            Ok(report) => totals.absorb(&report),
            Err(err) => error!(file = %file.display(), "failed to process artifact: {err}"),
        }
    }

    let summary = serde_json::to_string(&totals).unwrap_or_default();
    info!(
        total_size = %format_size(totals.total_size_bytes),
        "batch complete: {summary}"
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
