use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use eai_pipeline::apis::bea::BeaApiSource;
use eai_pipeline::apis::bulk_csv::BulkCsvSource;
use eai_pipeline::archive::{ArchiveStore, SqliteArchive};
use eai_pipeline::config::Config;
use eai_pipeline::error::Result;
use eai_pipeline::logging;
use eai_pipeline::pipeline::{Pipeline, PipelineResult};
use eai_pipeline::sink::PublicationSink;
use eai_pipeline::types::{ReleaseTag, SourceClient};

/// Exit codes reported to the external scheduler.
const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_NOOP: i32 = 3;

#[derive(Parser)]
#[command(name = "eai_pipeline")]
#[command(about = "County-level Economic Agency Index ingestion pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the pipeline configuration file
    #[arg(long, default_value = "config.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one release cycle for a single year
    Run {
        #[arg(long)]
        year: i32,
        /// Release maturity of this run
        #[arg(long, value_enum)]
        release: ReleaseTag,
        /// Read from a bulk CSV extract instead of the statistics API
        #[arg(long)]
        bulk_file: Option<PathBuf>,
    },
    /// Run a full historical backfill over an explicit year range
    Backfill {
        #[arg(long)]
        start_year: i32,
        #[arg(long)]
        end_year: i32,
        /// Release maturity applied to every year in the range
        #[arg(long, value_enum, default_value = "provisional")]
        release: ReleaseTag,
        /// Read from a bulk CSV extract instead of the statistics API
        #[arg(long)]
        bulk_file: Option<PathBuf>,
    },
    /// Re-publish the current view to the sink destinations
    Publish,
}

fn create_source(config: &Config, bulk_file: Option<PathBuf>) -> Result<Arc<dyn SourceClient>> {
    match bulk_file {
        Some(path) => Ok(Arc::new(BulkCsvSource::new(path))),
        None => Ok(Arc::new(BeaApiSource::new(
            &config.source,
            config.known_line_codes(),
        )?)),
    }
}

fn print_result(result: &PipelineResult) {
    println!("\n📊 Pipeline result for year {}:", result.year);
    println!("   Release tag: {}", result.release_tag);
    println!("   Records fetched: {}", result.records_fetched);
    println!("   Unknown lines dropped: {}", result.unknown_dropped);
    println!("   Rows emitted: {}", result.rows_emitted);
    println!("   Archived: {}", result.commit.archived);
    println!("   Promoted: {}", result.commit.promoted);
    println!("   Content hash: {}", result.commit.content_hash);

    if !result.malformed.is_empty() {
        println!("\n⚠️  {} malformed row group(s) dropped:", result.malformed.len());
        for group in &result.malformed {
            println!("   - region {} year {}: {}", group.region_id, group.year, group.detail);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(&cli.config)?;
    let archive: Arc<dyn ArchiveStore> = Arc::new(SqliteArchive::open_at_root(&config.archive.root)?);

    match cli.command {
        Commands::Run { year, release, bulk_file } => {
            let source = create_source(&config, bulk_file)?;
            let pipeline = Pipeline::new(config, source, archive);
            let result = pipeline.run_for_year(year, release).await?;
            print_result(&result);
            if result.is_noop() {
                info!("Run for year {} was a no-op", year);
                Ok(EXIT_NOOP)
            } else {
                Ok(EXIT_SUCCESS)
            }
        }
        Commands::Backfill { start_year, end_year, release, bulk_file } => {
            let source = create_source(&config, bulk_file)?;
            let pipeline = Pipeline::new(config, source, archive);
            let results = pipeline.backfill(start_year, end_year, release).await?;
            for result in &results {
                print_result(result);
            }
            if results.iter().all(PipelineResult::is_noop) {
                Ok(EXIT_NOOP)
            } else {
                Ok(EXIT_SUCCESS)
            }
        }
        Commands::Publish => {
            let sink = PublicationSink::new(&config.sink);
            eai_pipeline::pipeline::publish_current(&config, archive.as_ref(), &sink).await?;
            println!("✅ Current view re-published");
            Ok(EXIT_SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Pipeline failed: {}", e);
            eprintln!("❌ Pipeline failed: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}
