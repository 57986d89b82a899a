use serde::{Deserialize, Serialize};

/// Distance metric shared by the builder's consumers and the matcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
}

impl Metric {
    /// Ranking distance. LOWER is ALWAYS closer.
    /// Euclidean stays squared here so the scan skips a sqrt per record;
    /// pass the winner through [`Metric::finalize`] before reporting it.
    #[inline(always)]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Metric::Euclidean => squared_l2(a, b),
            Metric::Cosine => cosine_distance(a, b),
        }
    }

    /// Converts a ranking distance into the reported value.
    pub fn finalize(&self, raw: f64) -> f32 {
        match self {
            Metric::Euclidean => raw.sqrt() as f32,
            Metric::Cosine => raw as f32,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// 8 independent accumulators let LLVM keep a full AVX2 register busy;
// the tail is folded in scalar. Sums and ranking values stay in f64 so
// large finite inputs cannot overflow to inf.
const LANES: usize = 8;

fn squared_l2(a: &[f32], b: &[f32]) -> f64 {
    let mut acc = [0.0f64; LANES];

    let a_chunks = a.chunks_exact(LANES);
    let b_chunks = b.chunks_exact(LANES);
    let a_tail = a_chunks.remainder();
    let b_tail = b_chunks.remainder();

    for (ac, bc) in a_chunks.zip(b_chunks) {
        for lane in 0..LANES {
            let d = ac[lane] as f64 - bc[lane] as f64;
            acc[lane] += d * d;
        }
    }

    let mut sum: f64 = acc.iter().sum();
    for (x, y) in a_tail.iter().zip(b_tail) {
        let d = *x as f64 - *y as f64;
        sum += d * d;
    }
    sum
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = [0.0f64; LANES];
    let mut norm_a = [0.0f64; LANES];
    let mut norm_b = [0.0f64; LANES];

    let a_chunks = a.chunks_exact(LANES);
    let b_chunks = b.chunks_exact(LANES);
    let a_tail = a_chunks.remainder();
    let b_tail = b_chunks.remainder();

    for (ac, bc) in a_chunks.zip(b_chunks) {
        for lane in 0..LANES {
            let (x, y) = (ac[lane] as f64, bc[lane] as f64);
            dot[lane] += x * y;
            norm_a[lane] += x * x;
            norm_b[lane] += y * y;
        }
    }

    let mut dot: f64 = dot.iter().sum();
    let mut norm_a: f64 = norm_a.iter().sum();
    let mut norm_b: f64 = norm_b.iter().sum();
    for (x, y) in a_tail.iter().zip(b_tail) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    // sqrt of the product keeps identical inputs at exactly 1.0 similarity.
    let d = 1.0 - dot / (norm_a * norm_b).sqrt();
    // Rounding can dip below zero; NaN must stay NaN so the matcher can drop it.
    if d < 0.0 {
        0.0
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
    }

    #[test]
    fn cosine_basics() {
        let m = Metric::Cosine;
        assert_eq!(m.distance(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert!((m.distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((m.distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        // Scale does not matter.
        assert!(m.distance(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) < 1e-6);
    }

    #[test]
    fn cosine_zero_norm_is_maximally_unrelated() {
        assert_eq!(Metric::Cosine.distance(&[0.0, 0.0], &[1.0, 1.0]), 1.0);
        assert_eq!(Metric::Cosine.distance(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
    }

    #[test]
    fn cosine_identical_long_vector_is_zero() {
        let v: Vec<f32> = (0..2048).map(|i| ((i * 37) % 101) as f32 / 7.0).collect();
        assert!(Metric::Cosine.distance(&v, &v) < 1e-6);
    }

    #[test]
    fn euclidean_matches_naive_across_tail_lengths() {
        for len in [1usize, 7, 8, 9, 19, 64] {
            let a: Vec<f32> = (0..len).map(|i| i as f32 * 0.5).collect();
            let b: Vec<f32> = (0..len).map(|i| (len - i) as f32 * 0.25).collect();
            let got = Metric::Euclidean.distance(&a, &b);
            let want = naive_l2(&a, &b) as f64;
            assert!((got - want).abs() <= want * 1e-5, "len {len}: {got} vs {want}");
        }
    }

    #[test]
    fn euclidean_finalize_reports_root() {
        let raw = Metric::Euclidean.distance(&[0.0, 0.0], &[3.0, 4.0]);
        assert_eq!(raw, 25.0);
        assert_eq!(Metric::Euclidean.finalize(raw), 5.0);
        assert_eq!(Metric::Cosine.finalize(0.3), 0.3);
    }

    #[test]
    fn large_finite_inputs_do_not_overflow() {
        let m = Metric::Cosine;
        assert_eq!(m.distance(&[0.0, 1e20], &[0.0, 1.0]), 0.0);
        assert!((m.distance(&[0.0, 1e20], &[1.0, 0.0]) - 1.0).abs() < 1e-6);

        let far = Metric::Euclidean.distance(&[3e19, 0.0], &[0.0, 4e19]);
        assert!(far.is_finite());
        assert!((Metric::Euclidean.finalize(far) - 5e19).abs() <= 5e19 * 1e-5);
    }

    #[test]
    fn nan_input_is_not_a_perfect_match() {
        assert!(Metric::Cosine.distance(&[f32::NAN, 1.0], &[1.0, 0.0]).is_nan());
        assert!(Metric::Euclidean.distance(&[f32::NAN, 1.0], &[1.0, 0.0]).is_nan());
    }

    #[test]
    fn default_and_names() {
        assert_eq!(Metric::default(), Metric::Cosine);
        assert_eq!(Metric::Euclidean.to_string(), "euclidean");
        let parsed: Metric = serde_json::from_str("\"euclidean\"").unwrap();
        assert_eq!(parsed, Metric::Euclidean);
    }
}
