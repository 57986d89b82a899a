//! Archive container on disk.
//!
//! Layout (little endian):
//! `[magic "GEOA"][version u32][record count u64][dimension u32][payload len u64][payload][crc32 u32]`
//! where the payload is the rkyv-archived record list and the CRC covers every byte
//! before it. Files are written to a temp path and renamed into place.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use rkyv::{AlignedVec, Deserialize};
use tracing::{debug, info};

use crate::error::{GeoError, Result};
use crate::model::{FeatureArchive, FeatureRecord};

const MAGIC: &[u8; 4] = b"GEOA";
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8;
const FOOTER_LEN: usize = 4;

/// Writes `archive` to `path`, replacing any previous file.
pub fn save(archive: &FeatureArchive, path: &Path) -> Result<()> {
    let bytes = encode(archive)?;

    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    info!(
        "Saved archive {:?}: {} records, dim {}, {} bytes",
        path,
        archive.len(),
        archive.dimension().unwrap_or(0),
        bytes.len()
    );
    Ok(())
}

/// Reads an archive written by [`save`].
pub fn load(path: &Path) -> Result<FeatureArchive> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < (HEADER_LEN + FOOTER_LEN) as u64 {
        return Err(corrupt(format!("file is {} bytes, shorter than the frame", len)));
    }

    // SAFETY: archives are only ever replaced through rename, never rewritten in place.
    let mmap = unsafe { Mmap::map(&file)? };
    let archive = decode(&mmap)?;

    info!(
        "Loaded archive {:?}: {} records, dim {}",
        path,
        archive.len(),
        archive.dimension().unwrap_or(0)
    );
    Ok(archive)
}

/// Serializes an archive into the framed container bytes.
pub fn encode(archive: &FeatureArchive) -> Result<Vec<u8>> {
    let payload = rkyv::to_bytes::<_, 4096>(archive.as_vec())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?;

    let dimension = archive.dimension().unwrap_or(0);
    let dimension = u32::try_from(dimension)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedding dimension exceeds u32"))?;

    Ok(frame(archive.len() as u64, dimension, &payload))
}

/// Parses and validates container bytes.
pub fn decode(bytes: &[u8]) -> Result<FeatureArchive> {
    if bytes.len() < HEADER_LEN + FOOTER_LEN {
        return Err(corrupt(format!("{} bytes is shorter than the frame", bytes.len())));
    }
    let (body, footer) = bytes.split_at(bytes.len() - FOOTER_LEN);

    if &body[..4] != MAGIC {
        return Err(corrupt("bad magic, not an archive file"));
    }
    let version = le_u32(body, 4);
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {}", version)));
    }

    let stored_crc = le_u32(footer, 0);
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(corrupt(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored_crc, computed_crc
        )));
    }

    let count = le_u64(body, 8);
    let dimension = le_u32(body, 16) as usize;
    let payload_len = le_u64(body, 20);
    let payload = &body[HEADER_LEN..];
    if payload.len() as u64 != payload_len {
        return Err(corrupt(format!(
            "payload is {} bytes, header declares {}",
            payload.len(),
            payload_len
        )));
    }

    // rkyv needs aligned input; the mmap slice past the header is not.
    let mut aligned = AlignedVec::with_capacity(payload.len());
    aligned.extend_from_slice(payload);

    let archived = rkyv::check_archived_root::<Vec<FeatureRecord>>(&aligned)
        .map_err(|e| corrupt(format!("payload validation failed: {:?}", e)))?;
    let records: Vec<FeatureRecord> = archived
        .deserialize(&mut rkyv::Infallible)
        .unwrap_or_else(|never| match never {});

    if records.len() as u64 != count {
        return Err(corrupt(format!(
            "header declares {} records, payload holds {}",
            count,
            records.len()
        )));
    }
    for (i, record) in records.iter().enumerate() {
        if record.dimension() != dimension {
            return Err(corrupt(format!(
                "record {} has {} dimensions, expected {}",
                i,
                record.dimension(),
                dimension
            )));
        }
        if let Some(v) = record.embedding.iter().find(|v| !v.is_finite()) {
            return Err(corrupt(format!("record {} has non-finite embedding value {}", i, v)));
        }
    }
    debug!("Decoded {} records of dim {}", count, dimension);

    FeatureArchive::from_records(records).map_err(|e| corrupt(e.to_string()))
}

fn frame(count: u64, dimension: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + FOOTER_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&dimension.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn corrupt(msg: impl Into<String>) -> GeoError {
    GeoError::CorruptArchive(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> FeatureArchive {
        FeatureArchive::from_records(vec![
            FeatureRecord::new("paris", 48.85, 2.35, vec![1.0, 0.0, 0.1]).unwrap(),
            FeatureRecord::new("", 40.71, -74.0, vec![0.0, 1.0, f32::MIN_POSITIVE]).unwrap(),
            FeatureRecord::new("tōkyō", 35.6762, 139.6503, vec![-0.0, 1e-30, 3.4e38]).unwrap(),
        ])
        .unwrap()
    }

    fn raw_payload(records: &Vec<FeatureRecord>) -> Vec<u8> {
        rkyv::to_bytes::<_, 4096>(records).unwrap().into_vec()
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.geo");
        let archive = sample();

        save(&archive, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded, archive);
        for (a, b) in loaded.records().iter().zip(archive.records()) {
            let bits_a: Vec<u32> = a.embedding.iter().map(|f| f.to_bits()).collect();
            let bits_b: Vec<u32> = b.embedding.iter().map(|f| f.to_bits()).collect();
            assert_eq!(bits_a, bits_b);
            assert_eq!(a.latitude.to_bits(), b.latitude.to_bits());
        }
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn resave_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.geo");
        let second = dir.path().join("b.geo");

        save(&sample(), &first).unwrap();
        save(&load(&first).unwrap(), &second).unwrap();

        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn empty_archive_roundtrips() {
        let bytes = encode(&FeatureArchive::new()).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.dimension(), None);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut bytes = encode(&sample()).unwrap();
        let mid = HEADER_LEN + 10;
        bytes[mid] ^= 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, GeoError::CorruptArchive(ref m) if m.contains("checksum")));
    }

    #[test]
    fn wrong_magic_and_truncation_are_corrupt() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode(&bytes), Err(GeoError::CorruptArchive(_))));

        let bytes = encode(&sample()).unwrap();
        assert!(matches!(decode(&bytes[..10]), Err(GeoError::CorruptArchive(_))));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(GeoError::CorruptArchive(_))
        ));
    }

    #[test]
    fn count_mismatch_is_corrupt() {
        let records = sample().into_records();
        let bytes = frame(records.len() as u64 + 1, 3, &raw_payload(&records));
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, GeoError::CorruptArchive(ref m) if m.contains("declares 4 records")));
    }

    #[test]
    fn mixed_dimensions_are_corrupt() {
        let records = vec![
            FeatureRecord::new("a", 0.0, 0.0, vec![1.0, 2.0]).unwrap(),
            FeatureRecord::new("b", 0.0, 0.0, vec![1.0, 2.0, 3.0]).unwrap(),
        ];
        let bytes = frame(2, 2, &raw_payload(&records));
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, GeoError::CorruptArchive(ref m) if m.contains("record 1")));
    }

    #[test]
    fn nan_coordinates_in_payload_are_corrupt() {
        let records = vec![FeatureRecord {
            id: "x".into(),
            latitude: f64::NAN,
            longitude: 0.0,
            embedding: vec![1.0],
        }];
        let bytes = frame(1, 1, &raw_payload(&records));
        assert!(matches!(decode(&bytes), Err(GeoError::CorruptArchive(_))));
    }

    #[test]
    fn non_finite_embedding_in_payload_is_corrupt() {
        for poison in [f32::NAN, f32::INFINITY] {
            let records = vec![
                FeatureRecord::new("a", 0.0, 0.0, vec![1.0, 0.0]).unwrap(),
                FeatureRecord {
                    id: "b".into(),
                    latitude: 0.0,
                    longitude: 0.0,
                    embedding: vec![poison, 1.0],
                },
            ];
            let bytes = frame(2, 2, &raw_payload(&records));
            let err = decode(&bytes).unwrap_err();
            assert!(matches!(err, GeoError::CorruptArchive(ref m) if m.contains("record 1")));
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = load(&dir.path().join("nope.geo")).unwrap_err();
        assert!(matches!(err, GeoError::Io(_)));
    }

    #[test]
    fn short_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.geo");
        fs::write(&path, b"GEOA").unwrap();
        assert!(matches!(load(&path), Err(GeoError::CorruptArchive(_))));
    }
}
