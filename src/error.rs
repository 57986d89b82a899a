use std::time::Duration;

/// Failures surfaced by archive loading and geolocation queries.
#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("Failed to process the image: no embedding could be extracted")]
    ExtractionFailed,

    #[error("Embedding extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),

    #[error("Dimension mismatch: archive embeddings have {expected} values, query has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Archive contains no records")]
    EmptyArchive,

    #[error("Embedding contains non-finite values")]
    InvalidEmbedding,

    #[error("Invalid coordinates: latitude={latitude}, longitude={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GeoError>;
