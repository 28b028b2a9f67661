//! citemap - Checkpointed citation-affiliation enrichment pipeline
//!
//! Enriches the citing-author list produced by the upstream citation crawler
//! with affiliations from Google Scholar, saving progress after every author
//! so interrupted or blocked runs resume instead of restarting.
//!
//! ## Usage
//!
//! ```bash
//! citemap enrich --scholar-id HNw5OdcAAAAJ
//! citemap report --scholar-id HNw5OdcAAAAJ --filter nasa
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use citemap::checkpoint::{default_cache_root, CheckpointStore};
use citemap::engine::{CancellationToken, EnrichmentEngine, RunOutcome};
use citemap::enrich::{EnrichmentClient, Strategy};
use citemap::report;
use citemap::scholar::ScholarClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Checkpointed citation-affiliation enrichment pipeline
#[derive(Parser)]
#[command(name = "citemap")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Cache root directory (default: ~/.citemap/cache)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich the citing-author list with affiliations
    Enrich {
        /// Google Scholar id of the cited author
        #[arg(long)]
        scholar_id: String,

        /// Use only verified organizations instead of self-reported affiliations
        #[arg(long)]
        conservative: bool,

        /// Maximum retry passes over failed authors
        #[arg(long, default_value = "3")]
        max_retry_passes: u32,

        /// Save progress every N authors (larger values widen the loss window)
        #[arg(long, default_value = "1")]
        save_interval: usize,

        /// Minimum pacing delay between lookups, in seconds
        #[arg(long, default_value = "1")]
        pace_min: u64,

        /// Maximum pacing delay between lookups, in seconds
        #[arg(long, default_value = "5")]
        pace_max: u64,

        /// Proxy URL (e.g., http://127.0.0.1:7890)
        #[arg(long)]
        proxy: Option<String>,

        /// Mirror site URL
        #[arg(long)]
        mirror: Option<String>,
    },

    /// Build CSV reports from the final affiliation set
    Report {
        /// Google Scholar id of the cited author
        #[arg(long)]
        scholar_id: String,

        /// Output directory
        #[arg(short, long, default_value = "./results")]
        output: PathBuf,

        /// Also write a detail report for affiliations matching this keyword
        #[arg(long)]
        filter: Option<String>,
    },

    /// Inspect or clear cached pipeline state
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show the cache directory and its contents
    Path {
        /// Google Scholar id of the cited author
        #[arg(long)]
        scholar_id: String,
    },
    /// Remove the progress snapshot (keeps the work list and final artifact)
    Clear {
        /// Google Scholar id of the cited author
        #[arg(long)]
        scholar_id: String,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cache_root = match cli.cache_dir {
        Some(dir) => dir,
        None => default_cache_root()?,
    };

    match cli.command {
        Commands::Enrich {
            scholar_id,
            conservative,
            max_retry_passes,
            save_interval,
            pace_min,
            pace_max,
            proxy,
            mirror,
        } => {
            run_enrich(
                cache_root,
                scholar_id,
                conservative,
                max_retry_passes,
                save_interval,
                pace_min,
                pace_max,
                proxy,
                mirror,
            )
            .await
        }
        Commands::Report {
            scholar_id,
            output,
            filter,
        } => run_report(cache_root, scholar_id, output, filter),
        Commands::Cache { action } => handle_cache(cache_root, action),
    }
}

// ============================================================================
// Enrichment
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_enrich(
    cache_root: PathBuf,
    scholar_id: String,
    conservative: bool,
    max_retry_passes: u32,
    save_interval: usize,
    pace_min: u64,
    pace_max: u64,
    proxy: Option<String>,
    mirror: Option<String>,
) -> Result<()> {
    if pace_max < pace_min {
        anyhow::bail!("--pace-max must be >= --pace-min");
    }

    let store = CheckpointStore::new(&cache_root, &scholar_id);
    let items = store
        .load_work_list()
        .context("Failed to load citing-author list")?;
    println!("Loaded {} citing authors.", items.len());

    let strategy = if conservative {
        Strategy::Conservative
    } else {
        Strategy::Aggressive
    };
    println!(
        "Identifying affiliations using the {} approach.",
        strategy.name()
    );
    if save_interval <= 1 {
        println!("Progress will be saved after every author to avoid data loss.\n");
    } else {
        println!("Progress will be saved every {} authors.\n", save_interval);
    }

    let mut scholar = ScholarClient::new(proxy.as_deref())?;
    if let Some(mirror) = mirror.as_deref() {
        scholar = scholar.with_base_url(mirror);
    }

    let client = EnrichmentClient::new(Arc::new(scholar), strategy)
        .with_pacing(Duration::from_secs(pace_min), Duration::from_secs(pace_max));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nInterrupt received, finishing the current author before stopping...");
                cancel.cancel();
            }
        });
    }

    let engine = EnrichmentEngine::new(client, store, max_retry_passes)
        .with_save_interval(save_interval)
        .with_cancellation(cancel);

    match engine.run(&items).await? {
        RunOutcome::Complete(report) => {
            println!(
                "\n[{}] Enrichment complete.",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            );
            println!("  Affiliation records: {}", report.records.len());
            println!("  Permanently failed:  {}", report.permanently_failed.len());
            for (index, item) in report.permanently_failed.iter().take(10) {
                println!("    [{}] Author ID: {}", index, item.author_id);
            }
            if report.permanently_failed.len() > 10 {
                println!("    ... and {} more", report.permanently_failed.len() - 10);
            }
            println!(
                "\nRun `citemap report --scholar-id {}` to build CSV reports.",
                scholar_id
            );
        }
        RunOutcome::Suspended { cursor, pass } => {
            info!(cursor, pass, "Run suspended");
            println!("\nInterrupted. Progress has been saved.");
            println!("Run the same command again to resume from where you left off.");
        }
    }

    Ok(())
}

// ============================================================================
// Reporting
// ============================================================================

fn run_report(
    cache_root: PathBuf,
    scholar_id: String,
    output: PathBuf,
    filter: Option<String>,
) -> Result<()> {
    let store = CheckpointStore::new(&cache_root, &scholar_id);
    let records = store
        .load_final()
        .context("Failed to read final affiliation set")?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No final affiliation set found for {}. Run `citemap enrich` first.",
                scholar_id
            )
        })?;

    println!("Loaded {} affiliation records.", records.len());

    let summaries = report::summarize_by_affiliation(&records);
    let summary_path = output.join("affiliation_summary.csv");
    report::write_csv(&summary_path, &summaries)?;
    println!("Summary saved to: {}", summary_path.display());
    println!("  Unique affiliations: {}", summaries.len());

    println!("\nTop affiliations by author count:");
    for summary in summaries.iter().take(20) {
        println!("  {:>4}  {}", summary.author_count, summary.affiliation);
    }

    if let Some(keyword) = filter {
        let details = report::filter_by_keyword(&records, &keyword);
        if details.is_empty() {
            println!("\nNo affiliations matching '{}'.", keyword);
        } else {
            let safe_keyword: String = keyword
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            let detail_path = output.join(format!("{}_affiliations.csv", safe_keyword.to_lowercase()));
            report::write_csv(&detail_path, &details)?;
            println!(
                "\n{} citation records matching '{}' saved to: {}",
                details.len(),
                keyword,
                detail_path.display()
            );
        }
    }

    Ok(())
}

// ============================================================================
// Cache Management
// ============================================================================

fn handle_cache(cache_root: PathBuf, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Path { scholar_id } => {
            let store = CheckpointStore::new(&cache_root, &scholar_id);
            println!("Cache directory: {}", store.dir().display());
            println!(
                "  progress snapshot: {}",
                if store.load()?.is_some() { "present" } else { "none" }
            );
            println!(
                "  final artifact:    {}",
                if store.load_final()?.is_some() { "present" } else { "none" }
            );
        }
        CacheAction::Clear { scholar_id } => {
            let store = CheckpointStore::new(&cache_root, &scholar_id);
            store.clear_progress()?;
            println!("Progress snapshot cleared.");
        }
    }
    Ok(())
}
