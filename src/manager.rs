use std::thread;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    None,
    Sse2,
    Avx2,
    Avx512,
    Neon,
}

impl std::fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What the host can give the extraction and distance workloads.
#[derive(Debug, Clone, Copy)]
pub struct SystemProfile {
    pub logical_cores: usize,
    /// Ingest extraction threads
    pub worker_threads: usize,
    pub simd_level: SimdLevel,
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let simd_level = Self::detect_simd();

        // Extraction dominates ingest; leave one core for the reader and the
        // sequential append step once there are enough to spare.
        let worker_threads = if cores <= 2 { cores } else { cores - 1 };

        Self {
            logical_cores: cores,
            worker_threads,
            simd_level,
        }
    }

    pub fn log(&self) {
        info!(
            "System profile: {} cores, {} ingest workers, SIMD {}",
            self.logical_cores, self.worker_threads, self.simd_level
        );
        if self.simd_level == SimdLevel::None {
            warn!("No SIMD support detected, distance scans will run scalar");
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    fn detect_simd() -> SimdLevel {
        if is_x86_feature_detected!("avx512f") {
            SimdLevel::Avx512
        } else if is_x86_feature_detected!("avx2") {
            SimdLevel::Avx2
        } else if is_x86_feature_detected!("sse2") {
            SimdLevel::Sse2
        } else {
            SimdLevel::None
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn detect_simd() -> SimdLevel {
        SimdLevel::Neon
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    fn detect_simd() -> SimdLevel {
        SimdLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_profile_is_usable() {
        let profile = SystemProfile::detect();
        assert!(profile.logical_cores >= 1);
        assert!(profile.worker_threads >= 1);
        assert!(profile.worker_threads <= profile.logical_cores);
    }
}
