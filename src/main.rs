use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gigsync::pipeline::{self, PipelineOptions};
use gigsync::Config;

/// Pulls event listings from every configured source, standardizes them, and
/// syncs the local store to match.
#[derive(Debug, Parser)]
#[command(name = "gigsync", version)]
struct Cli {
    /// Run only sources whose name contains this substring.
    #[arg(long)]
    source: Option<String>,

    /// Fetch and report, but write and delete nothing.
    #[arg(long)]
    dry_run: bool,

    /// Cap pagination and fan-out so a run finishes in seconds.
    #[arg(long)]
    debug: bool,

    /// Path to the sqlite store.
    #[arg(long, env = "GIGSYNC_DB")]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let options = PipelineOptions {
        source_filter: cli.source,
        dry_run: cli.dry_run,
        debug: cli.debug,
    };
    let report = pipeline::run(&config, &options).await?;

    for source in &report.sources {
        match &source.error {
            None => println!("{}: {} events", source.name, source.fetched),
            Some(error) => println!("{}: FAILED ({error})", source.name),
        }
    }
    println!(
        "kept {} of {} fetched; wrote {}, deleted {} stale",
        report.summary.kept, report.summary.fetched, report.summary.written, report.summary.deleted
    );
    Ok(())
}
