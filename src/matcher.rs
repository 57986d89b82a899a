//! Exhaustive nearest-neighbor search over a loaded archive.
//!
//! Every query scans every record. Ties resolve to the lowest index so results are
//! deterministic for archives with duplicate embeddings.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::error::{GeoError, Result};
use crate::model::{FeatureArchive, FeatureRecord};
use crate::vector::Metric;

/// A record picked by the matcher and its reported distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match<'a> {
    pub index: usize,
    pub record: &'a FeatureRecord,
    pub distance: f32,
}

/// Closest record to `query` under `metric`.
pub fn nearest<'a>(query: &[f32], archive: &'a FeatureArchive, metric: Metric) -> Result<Match<'a>> {
    validate_query(query, archive)?;

    let mut best: Option<(usize, f64)> = None;
    for (index, record) in archive.records().iter().enumerate() {
        let d = metric.distance(query, &record.embedding);
        // Strict comparison keeps the first of equal distances; NaN never wins.
        let better = match best {
            None => !d.is_nan(),
            Some((_, best_d)) => d < best_d,
        };
        if better {
            best = Some((index, d));
        }
    }

    // No finite distance at all: nothing is comparable to the query.
    let (index, raw) = best.ok_or(GeoError::InvalidEmbedding)?;
    Ok(Match {
        index,
        record: &archive.records()[index],
        distance: metric.finalize(raw),
    })
}

#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    dist: OrderedFloat<f64>,
    index: usize,
}

// Max-heap on (dist, index): the root is the worst of the kept candidates.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.cmp(&other.dist).then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The `k` closest records in ascending distance, ties by lowest index.
pub fn k_nearest<'a>(
    query: &[f32],
    archive: &'a FeatureArchive,
    metric: Metric,
    k: usize,
) -> Result<Vec<Match<'a>>> {
    validate_query(query, archive)?;
    if k == 0 {
        return Ok(Vec::new());
    }

    let mut heap = BinaryHeap::with_capacity(k + 1);
    for (index, record) in archive.records().iter().enumerate() {
        let d = metric.distance(query, &record.embedding);
        if d.is_nan() {
            continue;
        }
        heap.push(Candidate { dist: OrderedFloat(d), index });
        if heap.len() > k {
            heap.pop();
        }
    }

    Ok(heap
        .into_sorted_vec()
        .into_iter()
        .map(|c| Match {
            index: c.index,
            record: &archive.records()[c.index],
            distance: metric.finalize(c.dist.into_inner()),
        })
        .collect())
}

fn validate_query(query: &[f32], archive: &FeatureArchive) -> Result<()> {
    let expected = archive.dimension().ok_or(GeoError::EmptyArchive)?;
    if query.len() != expected {
        return Err(GeoError::DimensionMismatch {
            expected,
            got: query.len(),
        });
    }
    if query.iter().any(|v| !v.is_finite()) {
        return Err(GeoError::InvalidEmbedding);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn archive(entries: &[(&str, f64, f64, &[f32])]) -> FeatureArchive {
        FeatureArchive::from_records(
            entries
                .iter()
                .map(|(id, lat, lon, emb)| FeatureRecord::new(*id, *lat, *lon, emb.to_vec()).unwrap())
                .collect(),
        )
        .unwrap()
    }

    fn paris_new_york() -> FeatureArchive {
        archive(&[
            ("paris", 48.85, 2.35, &[1.0, 0.0, 0.0]),
            ("new-york", 40.71, -74.0, &[0.0, 1.0, 0.0]),
        ])
    }

    #[test]
    fn picks_paris_under_cosine() {
        let a = paris_new_york();
        let m = nearest(&[0.9, 0.1, 0.0], &a, Metric::Cosine).unwrap();
        assert_eq!(m.index, 0);
        assert_eq!(m.record.id, "paris");
        assert_eq!((m.record.latitude, m.record.longitude), (48.85, 2.35));
        assert!(m.distance >= 0.0 && m.distance < 0.01, "distance {}", m.distance);
    }

    #[test]
    fn euclidean_reports_true_distance() {
        let a = paris_new_york();
        let m = nearest(&[0.0, 1.0, 1.0], &a, Metric::Euclidean).unwrap();
        assert_eq!(m.record.id, "new-york");
        assert!((m.distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn exact_duplicate_resolves_to_lowest_index() {
        let a = archive(&[
            ("far", 0.0, 0.0, &[0.0, 0.0, 1.0]),
            ("first", 1.0, 1.0, &[0.3, 0.4, 0.0]),
            ("second", 2.0, 2.0, &[0.3, 0.4, 0.0]),
        ]);
        for metric in [Metric::Cosine, Metric::Euclidean] {
            let m = nearest(&[0.3, 0.4, 0.0], &a, metric).unwrap();
            assert_eq!(m.record.id, "first", "{metric}");
            assert_eq!(m.distance, 0.0);
        }
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let a = archive(&[("a", 0.0, 0.0, &[1.0, 2.0, 3.0, 4.0])]);
        let err = nearest(&[1.0, 2.0, 3.0], &a, Metric::Cosine).unwrap_err();
        assert!(matches!(err, GeoError::DimensionMismatch { expected: 4, got: 3 }));
        assert!(k_nearest(&[1.0], &a, Metric::Cosine, 1).is_err());
    }

    #[test]
    fn empty_archive_is_an_error() {
        let err = nearest(&[1.0], &FeatureArchive::new(), Metric::Cosine).unwrap_err();
        assert!(matches!(err, GeoError::EmptyArchive));
    }

    #[test]
    fn non_finite_query_is_rejected() {
        let a = paris_new_york();
        let err = nearest(&[f32::NAN, 0.0, 0.0], &a, Metric::Cosine).unwrap_err();
        assert!(matches!(err, GeoError::InvalidEmbedding));
    }

    #[test]
    fn huge_finite_query_still_ranks_by_angle() {
        let a = archive(&[("x-axis", 1.0, 1.0, &[1.0, 0.0]), ("y-axis", 2.0, 2.0, &[0.0, 1.0])]);
        let m = nearest(&[0.0, 1e20], &a, Metric::Cosine).unwrap();
        assert_eq!(m.record.id, "y-axis");
        assert_eq!(m.distance, 0.0);

        let top = k_nearest(&[1e30, 0.0], &a, Metric::Cosine, 2).unwrap();
        assert_eq!(top[0].record.id, "x-axis");
        assert!(top.iter().all(|m| m.distance.is_finite()));
    }

    #[test]
    fn k_nearest_orders_and_truncates() {
        let a = archive(&[
            ("d3", 0.0, 0.0, &[3.0, 0.0]),
            ("d1", 0.0, 0.0, &[1.0, 0.0]),
            ("d2a", 0.0, 0.0, &[2.0, 0.0]),
            ("d2b", 0.0, 0.0, &[2.0, 0.0]),
        ]);
        let got = k_nearest(&[0.0, 0.0], &a, Metric::Euclidean, 3).unwrap();
        let ids: Vec<&str> = got.iter().map(|m| m.record.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2a", "d2b"]);
        assert_eq!(got[0].distance, 1.0);

        assert!(k_nearest(&[0.0, 0.0], &a, Metric::Euclidean, 0).unwrap().is_empty());
        assert_eq!(k_nearest(&[0.0, 0.0], &a, Metric::Euclidean, 10).unwrap().len(), 4);
    }

    #[test]
    fn k_nearest_first_agrees_with_nearest() {
        let a = paris_new_york();
        let top = k_nearest(&[0.2, 0.7, 0.1], &a, Metric::Cosine, 1).unwrap();
        let best = nearest(&[0.2, 0.7, 0.1], &a, Metric::Cosine).unwrap();
        assert_eq!(top[0].index, best.index);
        assert_eq!(top[0].distance, best.distance);
    }

    #[test]
    fn random_archives_find_their_own_records() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let dim = rng.gen_range(1..40);
            let n = rng.gen_range(1..60);
            let records: Vec<FeatureRecord> = (0..n)
                .map(|i| {
                    let emb = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                    FeatureRecord::new(i.to_string(), i as f64, -(i as f64), emb).unwrap()
                })
                .collect();
            let a = FeatureArchive::from_records(records).unwrap();

            let pick = rng.gen_range(0..n);
            let query = a.get(pick).unwrap().embedding.clone();
            for metric in [Metric::Cosine, Metric::Euclidean] {
                let m = nearest(&query, &a, metric).unwrap();
                assert!(m.distance >= 0.0);
                assert!(m.distance < 1e-6, "{metric}: {}", m.distance);
                assert!(m.index <= pick);
                assert_eq!(m.record, &a.records()[m.index]);
            }

            let other: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            let m = nearest(&other, &a, Metric::Cosine).unwrap();
            assert!(m.index < n && m.distance >= 0.0);
        }
    }
}
