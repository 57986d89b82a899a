//! Single-query orchestration: load, embed, match.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::{GeoError, Result};
use crate::extractor::EmbeddingExtractor;
use crate::matcher;
use crate::model::{FeatureArchive, QueryResult};
use crate::storage;

/// One entry of a top-k answer.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RankedMatch {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub distance: f64,
}

/// Shape of every answer that crosses the process boundary.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum QueryResponse {
    Located(QueryResult),
    Failed { error: String },
}

impl From<Result<QueryResult>> for QueryResponse {
    fn from(outcome: Result<QueryResult>) -> Self {
        match outcome {
            Ok(result) => QueryResponse::Located(result),
            Err(e) => QueryResponse::Failed { error: e.to_string() },
        }
    }
}

/// Answers "where was this photo taken?" against a feature archive.
///
/// Holds the process-wide extractor; the archive itself is either loaded per call
/// ([`locate`](Self::locate)) or shared by the caller ([`locate_in`](Self::locate_in)).
/// Neither path mutates the archive, so any number of queries may run at once.
#[derive(Clone)]
pub struct GeolocationQueryService {
    extractor: Arc<dyn EmbeddingExtractor>,
    config: QueryConfig,
}

impl GeolocationQueryService {
    pub fn new(extractor: Arc<dyn EmbeddingExtractor>, config: QueryConfig) -> Self {
        Self { extractor, config }
    }

    pub fn config(&self) -> QueryConfig {
        self.config
    }

    pub async fn locate(&self, image: Vec<u8>, archive_path: &Path) -> Result<QueryResult> {
        let archive = load_archive(archive_path).await?;
        self.locate_in(image, archive).await
    }

    pub async fn locate_in(&self, image: Vec<u8>, archive: Arc<FeatureArchive>) -> Result<QueryResult> {
        let embedding = self.embed(image).await?;
        let metric = self.config.metric;

        let result = tokio::task::spawn_blocking(move || {
            matcher::nearest(&embedding, &archive, metric).map(|m| {
                debug!("Nearest record #{} ({:?}) at {} distance {}", m.index, m.record.id, metric, m.distance);
                QueryResult::new(m.record, m.distance)
            })
        })
        .await
        .map_err(task_failed)??;
        Ok(result)
    }

    /// The `k` closest records, closest first.
    pub async fn top_matches(&self, image: Vec<u8>, archive: Arc<FeatureArchive>, k: usize) -> Result<Vec<RankedMatch>> {
        let embedding = self.embed(image).await?;
        let metric = self.config.metric;

        tokio::task::spawn_blocking(move || {
            matcher::k_nearest(&embedding, &archive, metric, k).map(|matches| {
                matches
                    .into_iter()
                    .map(|m| RankedMatch {
                        id: m.record.id.clone(),
                        latitude: m.record.latitude,
                        longitude: m.record.longitude,
                        distance: m.distance as f64,
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await
        .map_err(task_failed)?
    }

    /// Runs the extractor on the blocking pool under the configured timeout.
    /// A timed-out extraction keeps its thread until the extractor returns.
    async fn embed(&self, image: Vec<u8>) -> Result<Vec<f32>> {
        let extractor = Arc::clone(&self.extractor);
        let task = tokio::task::spawn_blocking(move || extractor.extract(&image));

        let joined = match self.config.extraction_timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| GeoError::ExtractionTimeout(limit))?,
            None => task.await,
        };

        match joined {
            Ok(Some(embedding)) => Ok(embedding),
            Ok(None) => Err(GeoError::ExtractionFailed),
            Err(e) => {
                warn!("Extractor task failed: {}", e);
                Err(GeoError::ExtractionFailed)
            }
        }
    }
}

/// Loads an archive off the async threads.
pub async fn load_archive(path: &Path) -> Result<Arc<FeatureArchive>> {
    let path = path.to_path_buf();
    let archive = tokio::task::spawn_blocking(move || storage::load(&path))
        .await
        .map_err(task_failed)??;
    Ok(Arc::new(archive))
}

fn task_failed(e: JoinError) -> GeoError {
    GeoError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}
