//! Photo geolocation by nearest-neighbor search over an archive of image embeddings.
//!
//! The archive is built offline by [`ArchiveBuilder`] from a dataset of geotagged
//! images, persisted with [`storage::save`], and queried with
//! [`GeolocationQueryService`], which embeds the query photo and returns the
//! coordinates of the closest archived photo.

pub mod builder;
pub mod config;
pub mod dataset;
pub mod error;
pub mod extractor;
pub mod manager;
pub mod matcher;
pub mod model;
pub mod server;
pub mod service;
pub mod storage;
pub mod vector;

pub use builder::{ArchiveBuilder, BuildReport, SkipReason};
pub use config::{IngestConfig, QueryConfig};
pub use dataset::{RawItem, ShardReader};
pub use error::{GeoError, Result};
pub use extractor::{ColorLayoutExtractor, EmbeddingExtractor, LocalFeatureExtractor, LocalFeatures};
pub use model::{FeatureArchive, FeatureRecord, QueryResult};
pub use service::{GeolocationQueryService, QueryResponse};
pub use vector::Metric;
