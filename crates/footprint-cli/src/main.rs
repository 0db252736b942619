use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use footprint_core::{SourceId, SyncStats};
use footprint_storage::format_timestamp;
use footprint_sync::{AppConfig, DirectoryPublisher, Pipeline, SourceOutcome};
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "footprint")]
#[command(about = "Sync, aggregate and publish a personal digital footprint")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create every source's tables without syncing
    Init,
    /// Pull new records from one source, or all of them
    Sync { source: Option<SourceId> },
    /// Rebuild monthly analysis rows for one source, or all of them
    Analyze { source: Option<SourceId> },
    /// Row counts, watermarks and analysis coverage per source
    Status,
    /// Print the latest monthly report
    Report,
    /// Render the report and history files and publish them
    Publish {
        /// Check every source's configuration and render, without writing
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Loads `.env` before the subscriber is installed so `RUST_LOG` may come
/// from it; a missing file is not an error.
fn load_dotenv() -> Option<dotenvy::Error> {
    dotenvy::dotenv().err().filter(|err| !err.not_found())
}

fn selected(source: Option<SourceId>) -> Vec<SourceId> {
    source.map_or_else(|| SourceId::ALL.to_vec(), |s| vec![s])
}

fn print_sync(outcome: &SourceOutcome<SyncStats>) {
    match &outcome.result {
        Ok(stats) => println!(
            "{:<11} written={} skipped={} parents={}{}",
            outcome.source,
            stats.items_written,
            stats.items_skipped,
            stats.parents_created,
            if stats.interrupted { " (interrupted)" } else { "" }
        ),
        Err(err) => println!("{:<11} error: {err}", outcome.source),
    }
}

fn all_ok<T>(outcomes: &[SourceOutcome<T>]) -> bool {
    outcomes.iter().all(SourceOutcome::is_ok)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn status(pipeline: &Pipeline) -> Result<()> {
    for status in pipeline.status().await.context("reading source status")? {
        if !status.initialized {
            println!("{}: not initialized", status.source);
            continue;
        }
        println!("{}:", status.source);
        for (table, count) in &status.row_counts {
            println!("  {table}: {count} rows");
        }
        if status.watermarks.is_empty() {
            println!("  never synced");
        }
        for watermark in &status.watermarks {
            let at = watermark
                .last_sync_at
                .map(format_timestamp)
                .unwrap_or_else(|| "-".to_string());
            match &watermark.last_cursor {
                Some(cursor) => println!("  {} synced to {at} (cursor {cursor})", watermark.stream),
                None => println!("  {} synced to {at}", watermark.stream),
            }
        }
        match (&status.analysis.latest, &status.analysis.last_updated) {
            (Some(latest), Some(updated)) => println!(
                "  analysis: {} months, latest {latest} (updated {updated})",
                status.analysis.rows
            ),
            _ => println!("  analysis: none"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let dotenv_error = load_dotenv();
    init_tracing();
    if let Some(err) = dotenv_error {
        warn!(error = %err, "ignoring unreadable .env file");
    }
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let pipeline = Pipeline::new(config.clone());

    let ok = match cli.command {
        Commands::Init => {
            let outcomes = pipeline.init(&SourceId::ALL).await;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(()) => println!("{}: ready", outcome.source),
                    Err(err) => println!("{}: {err}", outcome.source),
                }
            }
            all_ok(&outcomes)
        }
        Commands::Sync { source } => {
            let outcomes = pipeline.sync_all(&selected(source)).await;
            outcomes.iter().for_each(print_sync);
            all_ok(&outcomes)
        }
        Commands::Analyze { source } => {
            let outcomes = pipeline.analyze_all(&selected(source)).await;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(months) => println!("{}: {months} months analysed", outcome.source),
                    Err(err) => println!("{}: {err}", outcome.source),
                }
            }
            all_ok(&outcomes)
        }
        Commands::Status => {
            status(&pipeline).await?;
            true
        }
        Commands::Report => match pipeline.report_markdown().await? {
            Some(markdown) => {
                println!("{markdown}");
                true
            }
            None => {
                println!("no analysed months yet; run `footprint analyze` first");
                false
            }
        },
        Commands::Publish { dry_run } => {
            let publisher = DirectoryPublisher::new(&config.publish_dir);
            let outcome = pipeline.publish(&publisher, dry_run).await?;
            for check in &outcome.checks {
                match &check.result {
                    Ok(()) => println!("{}: ok", check.source),
                    Err(err) => println!("{}: {err}", check.source),
                }
            }
            let verb = if dry_run { "would publish" } else { "published" };
            println!("{verb}: {}", outcome.receipt.message);
            for file in &outcome.receipt.files {
                let note = if file.unchanged { " (unchanged)" } else { "" };
                println!("  {} {} bytes{note}", file.path, file.bytes);
            }
            outcome.all_checks_passed()
        }
    };

    Ok(exit_code(ok))
}
