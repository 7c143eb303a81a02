mod aggregator;
mod db;
mod discovery;
mod error;
mod fetcher;
mod loader;
mod normalizer;
mod pipeline;
mod settings;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use db::Store;
use pipeline::RunSummary;
use settings::Settings;

#[derive(Parser)]
#[command(name = "pricepaid", about = "UK price-paid ingestion and monthly aggregation")]
struct Cli {
    /// Settings file (TOML). Missing is fine; PRICEPAID_* env vars override it.
    #[arg(short, long, global = true, default_value = settings::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List part files linked from the catalog pages
    Discover,
    /// Discover and download part files not yet in raw storage
    Fetch,
    /// Load raw files into the record store
    Load {
        /// Only load files for this year (repeatable)
        #[arg(short, long)]
        year: Vec<i32>,
    },
    /// Recompute monthly average prices
    Aggregate,
    /// Discover, fetch, load and aggregate
    Run {
        /// Only load files for this year (repeatable)
        #[arg(short, long)]
        year: Vec<i32>,
    },
    /// Print monthly average prices
    Show {
        /// Filter by year
        #[arg(short, long)]
        year: Option<i32>,
        /// Print JSON records instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show store statistics
    Stats,
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
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Invalid configuration ({})", cli.config.display()))?;

    let result = match cli.command {
        Commands::Discover => {
            let urls = discover(&settings).await?;
            for url in &urls {
                println!("{}", url);
            }
            println!("\nFound {} part files.", urls.len());
            Ok(())
        }
        Commands::Fetch => {
            let mut summary = RunSummary::default();
            fetch(&settings, &mut summary).await?;
            summary.print();
            Ok(())
        }
        Commands::Load { year } => {
            let store = open_store(&settings)?;
            let summary = load(&settings, &store, &year)?;
            summary.print();
            Ok(())
        }
        Commands::Aggregate => {
            let store = open_store(&settings)?;
            let report = aggregator::aggregate(&store)?;
            println!("Aggregated {} months.", report.months);
            Ok(())
        }
        Commands::Run { year } => {
            let mut summary = RunSummary::default();

            let t_fetch = Instant::now();
            fetch(&settings, &mut summary).await?;
            println!("Fetch stage done in {:.1}s", t_fetch.elapsed().as_secs_f64());

            let store = open_store(&settings)?;
            let t_load = Instant::now();
            let loaded = load(&settings, &store, &year)?;
            println!("Load stage done in {:.1}s", t_load.elapsed().as_secs_f64());

            let report = aggregator::aggregate(&store)?;
            summary = RunSummary {
                fetch: summary.fetch,
                ..loaded
            };
            summary.add_aggregate(&report);
            println!();
            summary.print();
            Ok(())
        }
        Commands::Show { year, json } => {
            let store = open_store(&settings)?;
            let rows = store.fetch_monthly_averages(year)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            if rows.is_empty() {
                println!("No monthly averages. Run 'load' and 'aggregate' first.");
                return Ok(());
            }

            println!("{:<14} | {:>14}", "Month", "Avg price");
            println!("{}", "-".repeat(31));
            for r in &rows {
                println!(
                    "{:<14} | {:>14}",
                    r.month.format("%B %Y").to_string(),
                    format!("£{:.2}", r.avg_price)
                );
            }
            println!("\n{} months", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let store = open_store(&settings)?;
            let s = store.get_stats()?;
            let date = |d: Option<chrono::NaiveDate>| {
                d.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
            };
            println!("Records:       {}", s.records);
            println!("Months:        {}", s.months);
            println!("Files loaded:  {}", s.files_loaded);
            println!("First sale:    {}", date(s.first_transfer));
            println!("Last sale:     {}", date(s.last_transfer));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_store(settings: &Settings) -> anyhow::Result<Store> {
    Store::open(&settings.database_path, settings.busy_timeout())
        .context("Record store unavailable")
}

async fn discover(settings: &Settings) -> anyhow::Result<Vec<String>> {
    let client = pipeline::http_client(settings.page_timeout(), settings.connect_timeout())?;
    Ok(discovery::discover(&client, &settings.catalog_pages).await)
}

async fn fetch(settings: &Settings, summary: &mut RunSummary) -> anyhow::Result<()> {
    let urls = discover(settings).await?;
    if urls.is_empty() {
        println!("No part files found on the catalog pages.");
    }
    let client = pipeline::http_client(settings.download_timeout(), settings.connect_timeout())?;
    let stats = fetcher::fetch_all(
        &client,
        urls,
        &settings.raw_dir,
        settings.download_concurrency,
    )
    .await;
    summary.fetch = Some(stats);
    Ok(())
}

fn load(settings: &Settings, store: &Store, years: &[i32]) -> anyhow::Result<RunSummary> {
    let files = loader::raw_files(&settings.raw_dir, years)
        .with_context(|| format!("Cannot list {}", settings.raw_dir.display()))?;
    if files.is_empty() {
        println!("No raw files in {}. Run 'fetch' first.", settings.raw_dir.display());
    } else {
        println!("Loading {} files...", files.len());
    }
    Ok(pipeline::load_all(store, &files, settings.batch_size)?)
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
