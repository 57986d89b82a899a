//! Defaults and runtime settings.
//!
//! Compile-time defaults live here as constants; the binaries override them
//! through CLI arguments and `RUST_LOG`.

use std::time::Duration;

use crate::vector::Metric;

/// How long a single embedding extraction may run before the query gives up.
pub const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 120;

/// Items between two ingest progress lines.
pub const DEFAULT_PROGRESS_EVERY: usize = 1_000;

/// Default bind address of the HTTP server.
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:3030";

/// Largest image body the HTTP server accepts.
pub const MAX_IMAGE_BYTES: u64 = 32 * 1024 * 1024;

/// Upper bound for `k` on top-k queries.
pub const MAX_TOP_K: usize = 100;

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,geotrace=info";

/// The query CLI only reports problems; its stdout is the JSON answer.
pub const QUIET_LOG_FILTER: &str = "warn";

/// Settings for the query path.
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    pub metric: Metric,
    /// `None` waits for the extractor indefinitely
    pub extraction_timeout: Option<Duration>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            extraction_timeout: Some(Duration::from_secs(DEFAULT_EXTRACTION_TIMEOUT_SECS)),
        }
    }
}

/// Settings for the offline archive build.
#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    /// Extraction threads; 0 lets rayon pick
    pub workers: usize,
    /// Stop reading the dataset after this many items
    pub limit: Option<usize>,
    pub progress_every: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            limit: None,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

/// Installs the fmt subscriber used by every binary, `RUST_LOG` wins over `default_filter`.
/// Logs go to stderr so stdout stays free for JSON output.
pub fn init_logging(default_filter: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}
