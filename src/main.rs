mod config;
mod directory;
mod export;
mod extract;
mod job;
mod model;
mod pipeline;
mod platforms;
mod session;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use config::Settings;
use job::JobContext;
use model::Platform;
use session::http::HttpDriverFactory;
use session::{AutomationSession, SessionOptions};
use store::Store;

#[derive(Parser)]
#[command(name = "county_harvest", about = "County property and tax record harvester")]
struct Cli {
    /// SQLite output (overrides db_path from settings)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate jurisdictions and record locators, storing them for later harvest
    Discover {
        #[arg(short, long)]
        platform: Platform,
        /// Entry URL (defaults to the platform's public site)
        #[arg(short, long)]
        seed: Option<String>,
    },
    /// Fetch, extract and persist stored locators not yet in the ledger
    Harvest {
        #[arg(short, long)]
        platform: Platform,
        /// Max locators to process (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Discover + harvest in one pipeline
    Run {
        #[arg(short, long)]
        platform: Platform,
        #[arg(short, long)]
        seed: Option<String>,
    },
    /// Re-run extraction over stored raw pages and rewrite the records
    Reparse {
        #[arg(short, long)]
        platform: Option<Platform>,
    },
    /// Harvest county office links from the public-records directory
    Directory {
        /// Two-letter state codes (default: all states)
        #[arg(short, long, num_args = 1..)]
        states: Vec<String>,
        /// Max counties per state
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show per-jurisdiction and aggregate counts
    Stats,
    /// Write stored records (or office rows) as CSV
    Export {
        #[arg(short, long)]
        out: PathBuf,
        /// Export the office directory instead of records
        #[arg(long)]
        offices: bool,
    },
}

fn open_store(settings: &Settings) -> anyhow::Result<Store> {
    Store::open(&settings.db_path)?.with_snapshots(&settings.snapshot_path, settings.snapshot_every)
}

fn job_context(settings: &Arc<Settings>, platform: Platform) -> anyhow::Result<Arc<JobContext>> {
    let adapter = platforms::adapter_for(platform, settings);
    let ctx = Arc::new(JobContext::new(
        Arc::clone(settings),
        adapter,
        Arc::new(HttpDriverFactory),
    )?);

    // Stop scheduling on Ctrl-C; in-flight jobs still finish and persist.
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight jobs");
            cancel.cancel();
        }
    });
    Ok(ctx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load()?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    settings.validate()?;
    let settings = Arc::new(settings);

    let result = match cli.command {
        Commands::Discover { platform, seed } => {
            let seed = Settings::seed_for(platform, seed.as_deref())?;
            let store = open_store(&settings)?;
            let ctx = job_context(&settings, platform)?;
            let report = pipeline::discover(&ctx, &store, &seed).await?;
            println!(
                "Discovered {} jurisdictions, {} locators ({} jurisdictions failed).",
                report.jurisdictions.len(),
                report.locators.len(),
                report.failed.len()
            );
            for (jurisdiction, reason) in &report.failed {
                println!("  {}: {}", jurisdiction.label(), reason);
            }
            Ok(())
        }
        Commands::Harvest { platform, limit } => {
            let mut store = open_store(&settings)?;
            let pending = store.pending_locators(Some(platform), limit)?;
            if pending.is_empty() {
                println!("No pending locators. Run 'discover' first or everything is harvested.");
                return Ok(());
            }
            println!("Harvesting {} locators (streaming to DB)...", pending.len());
            let ctx = job_context(&settings, platform)?;
            let stats = pipeline::harvest(ctx, &mut store, pending).await?;
            stats.print();
            Ok(())
        }
        Commands::Run { platform, seed } => {
            let seed = Settings::seed_for(platform, seed.as_deref())?;
            let mut store = open_store(&settings)?;
            let ctx = job_context(&settings, platform)?;
            println!("Pipeline: {} from {}", platform, seed);
            let stats = pipeline::run(ctx, &mut store, &seed).await?;
            stats.print();
            Ok(())
        }
        Commands::Reparse { platform } => {
            let mut store = open_store(&settings)?;
            let pages = store.raw_pages(platform)?;
            if pages.is_empty() {
                println!("No stored pages. Enable store_raw_pages and harvest first.");
                return Ok(());
            }
            println!("Reparsing {} pages...", pages.len());
            let counts = reparse_pages(&mut store, &pages)?;
            counts.print();
            Ok(())
        }
        Commands::Directory { states, limit } => {
            let states: Vec<String> = if states.is_empty() {
                extract::offices::state_codes().map(str::to_string).collect()
            } else {
                states
            };
            let store = open_store(&settings)?;
            let options = SessionOptions::from_settings(&settings);
            let mut session = AutomationSession::create(&HttpDriverFactory, &options)?;
            let cancel = tokio_util::sync::CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });
            let harvest = directory::DirectoryHarvest {
                base: directory::DIRECTORY_BASE.to_string(),
                delay: std::time::Duration::from_secs(1)..=std::time::Duration::from_secs(2),
                limit_per_state: limit,
                cancel: &cancel,
            };
            println!("Scraping office directory for {} states...", states.len());
            let summary = harvest.run(&mut session, &store, &states).await?;
            summary.print();
            Ok(())
        }
        Commands::Stats => {
            let store = open_store(&settings)?;
            let rows = store.jurisdiction_counts()?;
            if rows.is_empty() {
                println!("Nothing discovered yet.");
                return Ok(());
            }
            let mut stats = job::RunStats::default();
            for r in &rows {
                let c = stats
                    .by_jurisdiction
                    .entry(format!("{} {}, {}", r.platform, r.county, r.state))
                    .or_default();
                c.discovered = r.discovered;
                c.fetched = r.fetched;
                c.complete = r.complete;
                c.partial = r.partial;
                c.failed = r.failed;
            }
            stats.print();
            let checkpoint = store.checkpoint();
            println!(
                "\nLedger: {} keys | written: {}",
                checkpoint.ledger.len(),
                checkpoint.written_count
            );
            Ok(())
        }
        Commands::Export { out, offices } => {
            let store = open_store(&settings)?;
            if offices {
                let rows = store.offices()?;
                export::export_to(&out, |w| export::write_offices(w, &rows))?;
                println!("Wrote {} county rows to {}", rows.len(), out.display());
            } else {
                let records = store.records()?;
                export::export_to(&out, |w| export::write_records(w, &records))?;
                println!("Wrote {} records to {}", records.len(), out.display());
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_elapsed(elapsed));
    }

    result
}

struct ReparseCounts {
    complete: usize,
    partial: usize,
}

impl ReparseCounts {
    fn print(&self) {
        println!(
            "Rewrote {} records ({} complete, {} partial).",
            self.complete + self.partial,
            self.complete,
            self.partial
        );
    }
}

fn reparse_pages(store: &mut Store, pages: &[model::RawPage]) -> anyhow::Result<ReparseCounts> {
    use indicatif::{ProgressBar, ProgressStyle};
    use rayon::prelude::*;

    let pb = ProgressBar::new(pages.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    let mut counts = ReparseCounts {
        complete: 0,
        partial: 0,
    };

    for chunk in pages.chunks(500) {
        let rows: Vec<_> = chunk
            .par_iter()
            .map(|page| (page.locator.clone(), extract::extract_page(page)))
            .collect();
        for (_, record) in &rows {
            match record.status() {
                model::RecordStatus::Complete => counts.complete += 1,
                _ => counts.partial += 1,
            }
        }
        store
            .replace_records(&rows)
            .context("rewriting reparsed records")?;
        pb.inc(chunk.len() as u64);
    }

    pb.finish_and_clear();
    store.snapshot()?;
    info!(complete = counts.complete, partial = counts.partial, "reparse finished");
    Ok(counts)
}

fn format_elapsed(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, secs / 60 % 60, secs % 60) {
        (0, 0, _) => format!("{:.1}s", d.as_secs_f64()),
        (0, m, s) => format!("{m}m{s:02}s"),
        (h, m, s) => format!("{h}h{m:02}m{s:02}s"),
    }
}
