// Operator Expenses - pipeline CLI
//
//   operator-expenses run [--periods N] [--export]   download + process
//   operator-expenses offline [--export]             process data/raw only
//   operator-expenses export                         artifacts → SQLite

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use operator_expenses::config::EXPORT_DB_FILE;
use operator_expenses::logging::init_logging;
use operator_expenses::pipeline::DEFAULT_PERIODS;
use operator_expenses::registry::load_registry_file;
use operator_expenses::serving::{parse_expenses, parse_groups};
use operator_expenses::tabular::read_table;
use operator_expenses::{enrich, export_run, run_offline, run_online, Registry, RunOutput, Settings};

#[derive(Parser, Debug)]
#[command(name = "operator-expenses")]
#[command(about = "Quarterly operator expense pipeline")]
#[command(version)]
struct Args {
    /// Root directory holding data/ and output/
    #[arg(long, global = true, env = "HT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download the latest periods from the portal and run the pipeline
    Run {
        #[arg(short, long, default_value_t = DEFAULT_PERIODS)]
        periods: usize,

        /// Also write the SQLite export
        #[arg(long)]
        export: bool,
    },
    /// Run the pipeline over files already in data/raw
    Offline {
        #[arg(long)]
        export: bool,
    },
    /// Export existing artifacts into SQLite
    Export {
        /// Database path (default: output/expenses.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut settings = Settings::from_env().context("Failed to load settings")?;
    if let Some(dir) = args.data_dir {
        settings.data_dir = dir;
    }
    info!("data directory: {}", settings.data_dir.display());

    match args.command {
        Command::Run { periods, export } => {
            let output = run_online(settings.clone(), periods)?;
            finish(&settings, output, export)
        }
        Command::Offline { export } => {
            let output = run_offline(settings.clone())?;
            finish(&settings, output, export)
        }
        Command::Export { db } => export_artifacts(&settings, db),
    }
}

fn finish(settings: &Settings, output: RunOutput, export: bool) -> Result<()> {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ {}", output.report.summary());
    println!("   consolidated: {}", output.report.artifacts.consolidated.display());
    println!("   aggregated:   {}", output.report.artifacts.aggregated.display());

    if export {
        let db_path = settings.output_dir().join(EXPORT_DB_FILE);
        let report = export_run(
            &db_path,
            &output.enriched,
            &output.groups,
            output.registry.entries(),
            "pipeline",
        )?;
        println!("🗄️  {}", report.summary());
    }
    Ok(())
}

/// Re-read the persisted artifacts, re-join against the registry and export
fn export_artifacts(settings: &Settings, db: Option<PathBuf>) -> Result<()> {
    let consolidated = settings
        .resolved_consolidated()
        .context("No consolidated artifact found; run the pipeline first")?;
    let expenses = parse_expenses(&read_table(&consolidated)?);

    let groups = match settings.resolved_aggregated() {
        Some(path) => parse_groups(&read_table(&path)?),
        None => Vec::new(),
    };
    let registry = match settings.resolved_registry() {
        Some(path) => Registry::from_entries(load_registry_file(&path)?),
        None => Registry::default(),
    };

    let enriched = enrich(expenses, &registry);
    let db_path = db.unwrap_or_else(|| settings.output_dir().join(EXPORT_DB_FILE));
    let report = export_run(&db_path, &enriched, &groups, registry.entries(), "export")?;

    println!("🗄️  {}", report.summary());
    println!("   database: {}", db_path.display());
    Ok(())
}
