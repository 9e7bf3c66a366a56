//! Dimension Adapter (C2): projects a native vector of length `N` to
//! exactly `T` dimensions, via compression (learned PCA, falling back to
//! truncation) or expansion (random projection + text-hash + polynomial +
//! Fourier features), always finishing with an L2-normalise pass.

mod compress;
mod expand;
mod projection;

use std::path::PathBuf;
use std::sync::Arc;

use crate::stats::Stats;

pub use projection::{LearnedProjectionStore, RandomProjectionCache};

/// Expansion deficit budget shares, each a fraction of `D = T - N`.
const RANDOM_PROJECTION_SHARE: f64 = 0.40;
const TEXT_HASH_SHARE: f64 = 0.20;
const POLYNOMIAL_SHARE: f64 = 0.25;
const FOURIER_SHARE: f64 = 0.15;

pub struct DimensionAdapter {
    random_projection_cache: RandomProjectionCache,
    learned_projections: LearnedProjectionStore,
    stats: Arc<Stats>,
}

impl DimensionAdapter {
    pub fn new(cache_dir: PathBuf, stats: Arc<Stats>) -> Self {
        DimensionAdapter {
            random_projection_cache: RandomProjectionCache::new(),
            learned_projections: LearnedProjectionStore::new(cache_dir),
            stats,
        }
    }

    /// Produces exactly `target_dims` floats from `native`, L2-normalised
    /// unless the result is the zero vector. `text` is the source text
    /// when available (absent for pre-tokenised batch items), used only by
    /// the text-hash expansion source.
    pub fn adapt(&self, native: &[f32], target_dims: usize, text: Option<&str>) -> Vec<f32> {
        let n = native.len();
        let t = target_dims;

        let mut out = if t == n {
            self.stats.record_native();
            native.to_vec()
        } else if t < n {
            self.stats.record_compression();
            compress::compress(native, t, &self.learned_projections)
        } else {
            self.stats.record_expansion();
            self.expand(native, t, text)
        };

        l2_normalize(&mut out);
        out
    }

    fn expand(&self, native: &[f32], target_dims: usize, text: Option<&str>) -> Vec<f32> {
        let n = native.len();
        let deficit = target_dims - n;

        let text_available = text.is_some();
        // Open question (b): when text is unavailable, the text-hash
        // share folds back into the random-projection source.
        let random_share = if text_available {
            RANDOM_PROJECTION_SHARE
        } else {
            RANDOM_PROJECTION_SHARE + TEXT_HASH_SHARE
        };

        let k_random = (deficit as f64 * random_share).floor() as usize;
        let k_text = if text_available {
            (deficit as f64 * TEXT_HASH_SHARE).floor() as usize
        } else {
            0
        };
        let k_poly = (deficit as f64 * POLYNOMIAL_SHARE).floor() as usize;
        let k_fourier = (deficit as f64 * FOURIER_SHARE).floor() as usize;

        let mut out = Vec::with_capacity(target_dims);
        out.extend_from_slice(native);
        out.extend(expand::random_projection(native, k_random, &self.random_projection_cache));
        if let Some(text_features) = expand::text_hash_features(text, k_text) {
            out.extend(text_features);
        }
        out.extend(expand::polynomial_features(native, k_poly));
        out.extend(expand::fourier_features(native, k_fourier));

        // Residual deficit (rounding + skipped text-hash-without-text
        // share beyond what was folded back) is filled with zeros.
        out.resize(target_dims, 0.0);
        out
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn adapter() -> (DimensionAdapter, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = DimensionAdapter::new(dir.path().to_path_buf(), Arc::new(Stats::default()));
        (adapter, dir)
    }

    #[test]
    fn same_dims_is_passthrough_and_normalised() {
        let (adapter, _dir) = adapter();
        let native = vec![3.0_f32, 4.0];
        let out = adapter.adapt(&native, 2, Some("x"));
        assert_eq!(out.len(), 2);
        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn expansion_reaches_exact_target_length() {
        let (adapter, _dir) = adapter();
        let native = vec![0.1_f32; 8];
        let out = adapter.adapt(&native, 80, Some("hello world"));
        assert_eq!(out.len(), 80);
    }

    #[test]
    fn expansion_without_text_still_reaches_exact_length() {
        let (adapter, _dir) = adapter();
        let native = vec![0.1_f32; 8];
        let out = adapter.adapt(&native, 80, None);
        assert_eq!(out.len(), 80);
    }

    #[test]
    fn truncation_path_below_ten_percent_shrink() {
        let (adapter, _dir) = adapter();
        let native: Vec<f32> = (0..100).map(|i| i as f32 * 0.01).collect();
        let out = adapter.adapt(&native, 95, Some("x"));
        assert_eq!(out.len(), 95);
    }

    #[test]
    fn zero_vector_stays_zero_after_normalisation() {
        let (adapter, _dir) = adapter();
        let native = vec![0.0_f32; 4];
        let out = adapter.adapt(&native, 4, Some("x"));
        assert_eq!(out, vec![0.0; 4]);
    }
}
