//! Offline archive construction.
//!
//! Items are validated and embedded in parallel, one chunk at a time. Each worker
//! turns an item into either a complete [`FeatureRecord`] or a [`SkipReason`]; the
//! results are then appended in input order, one whole record at a time, so a skipped
//! item never leaves half of itself in the archive.

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::dataset::RawItem;
use crate::error::{GeoError, Result};
use crate::extractor::{EmbeddingExtractor, LocalFeatureExtractor};
use crate::model::{check_coordinates, FeatureArchive, FeatureRecord};
use crate::storage;

const CHUNK_SIZE: usize = 1024;

/// Why an item did not make it into the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Image bytes or a coordinate is absent
    MissingInput(&'static str),
    /// The shard entry was readable but a field had the wrong type
    Malformed(&'static str),
    InvalidCoordinates,
    ExtractionFailed,
    /// The extractor produced NaN or infinity
    NonFiniteEmbedding,
    LocalFeaturesFailed,
    DimensionMismatch,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingInput(field) => write!(f, "missing {}", field),
            SkipReason::Malformed(field) => write!(f, "malformed {}", field),
            SkipReason::InvalidCoordinates => f.write_str("NaN coordinates"),
            SkipReason::ExtractionFailed => f.write_str("embedding extraction failed"),
            SkipReason::NonFiniteEmbedding => f.write_str("embedding has non-finite values"),
            SkipReason::LocalFeaturesFailed => f.write_str("local feature extraction failed"),
            SkipReason::DimensionMismatch => f.write_str("embedding dimension differs from archive"),
        }
    }
}

/// Kept/skipped tallies of one build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub total: usize,
    pub kept: usize,
    pub missing_input: usize,
    pub malformed: usize,
    pub invalid_coordinates: usize,
    pub extraction_failed: usize,
    pub non_finite_embedding: usize,
    pub local_features_failed: usize,
    pub dimension_mismatch: usize,
}

impl BuildReport {
    pub fn skipped(&self) -> usize {
        self.total - self.kept
    }

    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::MissingInput(_) => self.missing_input += 1,
            SkipReason::Malformed(_) => self.malformed += 1,
            SkipReason::InvalidCoordinates => self.invalid_coordinates += 1,
            SkipReason::ExtractionFailed => self.extraction_failed += 1,
            SkipReason::NonFiniteEmbedding => self.non_finite_embedding += 1,
            SkipReason::LocalFeaturesFailed => self.local_features_failed += 1,
            SkipReason::DimensionMismatch => self.dimension_mismatch += 1,
        }
    }
}

pub struct ArchiveBuilder {
    extractor: Arc<dyn EmbeddingExtractor>,
    local_extractor: Option<Arc<dyn LocalFeatureExtractor>>,
    config: IngestConfig,
}

impl ArchiveBuilder {
    pub fn new(extractor: Arc<dyn EmbeddingExtractor>) -> Self {
        Self {
            extractor,
            local_extractor: None,
            config: IngestConfig::default(),
        }
    }

    /// Also require the local-feature detector to succeed for every kept item.
    pub fn with_local_features(mut self, extractor: Arc<dyn LocalFeatureExtractor>) -> Self {
        self.local_extractor = Some(extractor);
        self
    }

    pub fn with_config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds an archive from in-memory items.
    pub fn build<I>(&self, items: I) -> Result<(FeatureArchive, BuildReport)>
    where
        I: IntoIterator<Item = RawItem>,
    {
        self.build_stream(items.into_iter().map(Ok))
    }

    /// Builds an archive from a fallible item stream such as a shard reader.
    /// A stream error aborts the build; per-item problems never do.
    pub fn build_stream<I>(&self, items: I) -> Result<(FeatureArchive, BuildReport)>
    where
        I: IntoIterator<Item = Result<RawItem>>,
    {
        let pool = self.pool()?;
        let limit = self.config.limit.unwrap_or(usize::MAX);
        let mut items = items.into_iter().take(limit);

        let mut archive = FeatureArchive::new();
        let mut report = BuildReport::default();
        let mut chunk = Vec::with_capacity(CHUNK_SIZE);

        loop {
            chunk.clear();
            for item in items.by_ref().take(CHUNK_SIZE) {
                chunk.push(item?);
            }
            if chunk.is_empty() {
                break;
            }

            let prepared: Vec<std::result::Result<FeatureRecord, SkipReason>> =
                pool.install(|| chunk.par_iter().map(|item| self.prepare(item)).collect());

            let before = report.total;
            for outcome in prepared {
                report.total += 1;
                let record = match outcome {
                    Ok(record) => record,
                    Err(reason) => {
                        debug!("Skipping item {}: {}", report.total - 1, reason);
                        report.record_skip(reason);
                        continue;
                    }
                };
                match archive.push(record) {
                    Ok(()) => report.kept += 1,
                    Err(GeoError::DimensionMismatch { expected, got }) => {
                        warn!(
                            "Skipping item {}: embedding has {} dims, archive has {}",
                            report.total - 1,
                            got,
                            expected
                        );
                        report.record_skip(SkipReason::DimensionMismatch);
                    }
                    Err(e) => return Err(e),
                }
            }

            let every = self.config.progress_every.max(1);
            if report.total / every > before / every {
                info!(
                    "Processed {} items ({} kept, {} skipped)",
                    report.total,
                    report.kept,
                    report.skipped()
                );
            }
        }

        info!(
            "Build finished: {} items, {} kept, {} skipped \
             (missing input {}, malformed {}, bad coordinates {}, extraction {}, non-finite {}, \
             local features {}, dimension {})",
            report.total,
            report.kept,
            report.skipped(),
            report.missing_input,
            report.malformed,
            report.invalid_coordinates,
            report.extraction_failed,
            report.non_finite_embedding,
            report.local_features_failed,
            report.dimension_mismatch
        );
        Ok((archive, report))
    }

    /// Builds from `items` and writes the archive to `output`.
    pub fn build_to_file<I>(&self, items: I, output: &Path) -> Result<BuildReport>
    where
        I: IntoIterator<Item = Result<RawItem>>,
    {
        let (archive, report) = self.build_stream(items)?;
        storage::save(&archive, output)?;
        Ok(report)
    }

    fn prepare(&self, item: &RawItem) -> std::result::Result<FeatureRecord, SkipReason> {
        if let Some(field) = item.malformed {
            return Err(SkipReason::Malformed(field));
        }
        let image = match item.image.as_deref() {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => return Err(SkipReason::MissingInput("image")),
        };
        let (latitude, longitude) = match (item.latitude, item.longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Err(SkipReason::MissingInput("coordinates")),
        };
        check_coordinates(latitude, longitude).map_err(|_| SkipReason::InvalidCoordinates)?;

        let embedding = self.extractor.extract(image).ok_or(SkipReason::ExtractionFailed)?;
        if !embedding.iter().all(|v| v.is_finite()) {
            return Err(SkipReason::NonFiniteEmbedding);
        }
        if let Some(local) = &self.local_extractor {
            local.extract(image).ok_or(SkipReason::LocalFeaturesFailed)?;
        }

        let id = item
            .id
            .as_deref()
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();

        Ok(FeatureRecord {
            id,
            latitude,
            longitude,
            embedding,
        })
    }

    fn pool(&self) -> Result<ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .thread_name(|i| format!("geotrace-ingest-{}", i))
            .build()
            .map_err(|e| GeoError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }
}
