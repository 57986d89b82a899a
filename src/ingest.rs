use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use geotrace::config::{self, DEFAULT_LOG_FILTER, DEFAULT_PROGRESS_EVERY};
use geotrace::manager::SystemProfile;
use geotrace::{ArchiveBuilder, ColorLayoutExtractor, IngestConfig, ShardReader};
use tracing::{error, info};

/// Build a feature archive from a MessagePack shard of geotagged images.
#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Input shard (concatenated msgpack maps with image/id/latitude/longitude)
    #[clap(long)]
    dataset: PathBuf,

    /// Archive file to write; an existing file is replaced
    #[clap(long)]
    output: PathBuf,

    /// Only read the first N items
    #[clap(long)]
    limit: Option<usize>,

    /// Extraction threads (defaults to the detected system profile)
    #[clap(long)]
    workers: Option<usize>,

    #[clap(long, default_value_t = DEFAULT_PROGRESS_EVERY)]
    progress_every: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();
    config::init_logging(DEFAULT_LOG_FILTER);

    let profile = SystemProfile::detect();
    profile.log();

    let ingest = IngestConfig {
        workers: args.workers.unwrap_or(profile.worker_threads),
        limit: args.limit,
        progress_every: args.progress_every,
    };
    info!("Reading {:?} -> {:?} ({} workers)", args.dataset, args.output, ingest.workers);

    let reader = match ShardReader::open(&args.dataset) {
        Ok(reader) => reader,
        Err(e) => {
            error!("Cannot open dataset {:?}: {}", args.dataset, e);
            return ExitCode::FAILURE;
        }
    };

    let started = Instant::now();
    let builder = ArchiveBuilder::new(Arc::new(ColorLayoutExtractor::new())).with_config(ingest);
    match builder.build_to_file(reader, &args.output) {
        Ok(report) => {
            info!(
                "Archive written to {:?}: {} of {} items kept in {:.1?}",
                args.output,
                report.kept,
                report.total,
                started.elapsed()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Ingest failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
