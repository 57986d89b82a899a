use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use geotrace::config::{self, QueryConfig, DEFAULT_EXTRACTION_TIMEOUT_SECS, QUIET_LOG_FILTER};
use geotrace::manager::SystemProfile;
use geotrace::{ColorLayoutExtractor, GeoError, GeolocationQueryService, Metric, QueryResponse};

const USAGE: &str = "Usage: geotrace <image_path> <archive_path>";

/// Estimate where a photo was taken.
#[derive(Parser, Clone, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    image_path: PathBuf,

    archive_path: PathBuf,

    #[clap(long, value_enum, default_value_t = Metric::Cosine)]
    metric: Metric,

    /// Give up on embedding extraction after this many seconds (0 = wait forever)
    #[clap(long, default_value_t = DEFAULT_EXTRACTION_TIMEOUT_SECS)]
    timeout_secs: u64,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(_) => {
            print_json(&QueryResponse::Failed { error: USAGE.to_string() });
            return ExitCode::FAILURE;
        }
    };

    config::init_logging(QUIET_LOG_FILTER);
    let profile = SystemProfile::detect();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build();
    let response = match runtime {
        Ok(runtime) => runtime.block_on(run(args)),
        Err(e) => QueryResponse::from(Err(GeoError::Io(e))),
    };

    // Failures still print a well-formed payload and exit cleanly.
    print_json(&response);
    ExitCode::SUCCESS
}

async fn run(args: Args) -> QueryResponse {
    let image = match tokio::fs::read(&args.image_path).await {
        Ok(bytes) => bytes,
        Err(e) => return QueryResponse::from(Err(GeoError::Io(e))),
    };

    let config = QueryConfig {
        metric: args.metric,
        extraction_timeout: (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs)),
    };
    let service = GeolocationQueryService::new(Arc::new(ColorLayoutExtractor::new()), config);

    QueryResponse::from(service.locate(image, &args.archive_path).await)
}

fn print_json(response: &QueryResponse) {
    match serde_json::to_string(response) {
        Ok(line) => println!("{}", line),
        Err(e) => println!("{}", serde_json::json!({ "error": e.to_string() })),
    }
}
