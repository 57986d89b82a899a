use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::{GeoError, Result};

/// One archived photograph: where it was taken and what it looks like.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct FeatureRecord {
    /// Opaque dataset identifier, may be empty
    pub id: String,

    /// Degrees, never NaN
    pub latitude: f64,
    pub longitude: f64,

    /// Output of the embedding extractor, every value finite
    pub embedding: Vec<f32>,
}

impl FeatureRecord {
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64, embedding: Vec<f32>) -> Result<Self> {
        check_coordinates(latitude, longitude)?;
        Ok(Self {
            id: id.into(),
            latitude,
            longitude,
            embedding,
        })
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// No range validation is done, only NaN is refused.
pub fn check_coordinates(latitude: f64, longitude: f64) -> Result<()> {
    if latitude.is_nan() || longitude.is_nan() {
        return Err(GeoError::InvalidCoordinates { latitude, longitude });
    }
    Ok(())
}

/// The searchable set of records.
///
/// Embeddings and their metadata live in the same `FeatureRecord`, so the archive
/// can never hold an embedding without its coordinates or the other way round.
/// Every record has the same embedding dimensionality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureArchive {
    records: Vec<FeatureRecord>,
}

impl FeatureArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an archive, validating every record the same way `push` does.
    pub fn from_records(records: Vec<FeatureRecord>) -> Result<Self> {
        let mut archive = Self {
            records: Vec::with_capacity(records.len()),
        };
        for record in records {
            archive.push(record)?;
        }
        Ok(archive)
    }

    /// Appends a whole record or nothing at all.
    pub fn push(&mut self, record: FeatureRecord) -> Result<()> {
        check_coordinates(record.latitude, record.longitude)?;
        if let Some(expected) = self.dimension() {
            if record.dimension() != expected {
                return Err(GeoError::DimensionMismatch {
                    expected,
                    got: record.dimension(),
                });
            }
        }
        if !record.embedding.iter().all(|v| v.is_finite()) {
            return Err(GeoError::InvalidEmbedding);
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    pub(crate) fn as_vec(&self) -> &Vec<FeatureRecord> {
        &self.records
    }

    pub fn into_records(self) -> Vec<FeatureRecord> {
        self.records
    }

    pub fn get(&self, index: usize) -> Option<&FeatureRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Embedding length shared by all records, `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.records.first().map(FeatureRecord::dimension)
    }
}

/// Answer to a geolocation query.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct QueryResult {
    pub latitude: f64,
    pub longitude: f64,
    /// Raw metric value, not a similarity score
    pub distance: f64,
}

impl QueryResult {
    pub fn new(record: &FeatureRecord, distance: f32) -> Self {
        Self {
            latitude: record.latitude,
            longitude: record.longitude,
            distance: distance as f64,
        }
    }
}
