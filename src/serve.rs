use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use geotrace::config::{self, QueryConfig, DEFAULT_EXTRACTION_TIMEOUT_SECS, DEFAULT_LOG_FILTER, DEFAULT_SERVER_ADDR};
use geotrace::manager::SystemProfile;
use geotrace::server::{self, AppState};
use geotrace::service::{self as query, GeolocationQueryService};
use geotrace::{ColorLayoutExtractor, Metric};
use tracing::{error, info};

/// Serve geolocation queries over HTTP from one archive.
#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long)]
    archive: PathBuf,

    #[clap(long, default_value = DEFAULT_SERVER_ADDR)]
    addr: SocketAddr,

    #[clap(long, value_enum, default_value_t = Metric::Cosine)]
    metric: Metric,

    #[clap(long, default_value_t = DEFAULT_EXTRACTION_TIMEOUT_SECS)]
    timeout_secs: u64,
}

fn main() {
    let args = Args::parse();
    config::init_logging(DEFAULT_LOG_FILTER);

    let profile = SystemProfile::detect();
    profile.log();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

async fn async_main(args: Args) {
    info!("Loading archive {:?}...", args.archive);
    let archive = match query::load_archive(&args.archive).await {
        Ok(archive) => archive,
        Err(e) => {
            error!("Cannot load archive: {}", e);
            std::process::exit(1);
        }
    };

    let config = QueryConfig {
        metric: args.metric,
        extraction_timeout: (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs)),
    };
    let state = AppState {
        service: GeolocationQueryService::new(Arc::new(ColorLayoutExtractor::new()), config),
        archive,
    };

    tokio::select! {
        _ = server::serve(state, args.addr) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down."),
    }
}
