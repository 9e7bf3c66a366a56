//! Seeded Gaussian random-projection matrices and incrementally-learned PCA
//! compression projections. Both caches are bounded (redesign note: "use a
//! proper LRU structure... for the projection-matrix cache").

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, Result};

const RANDOM_PROJECTION_CACHE_CAPACITY: usize = 100;
const PROJECTION_MAGIC: [u8; 4] = *b"SPJ1";
const PROJECTION_FORMAT_VERSION: u16 = 1;
const MIN_SAMPLES: usize = 100;
const SUBSPACE_ITERATIONS: usize = 12;

/// Deterministic seed so the same `(native_dims, k)` pair always yields the
/// same matrix, even across process restarts, without persisting it.
fn seed_for(native_dims: usize, k: usize) -> u64 {
    // Mix with a fixed odd constant to avoid small-seed correlation between
    // adjacent (native_dims, k) pairs.
    (native_dims as u64)
        .wrapping_mul(0x9E3779B97F4A7C15)
        .wrapping_add(k as u64)
        .wrapping_mul(0xBF58476D1CE4E5B9)
}

fn gaussian_pair(rng: &mut StdRng) -> (f32, f32) {
    // Box-Muller transform over two independent uniforms in (0, 1].
    let u1: f32 = rng.random_range(f32::EPSILON..1.0);
    let u2: f32 = rng.random::<f32>();
    let r = (-2.0 * u1.ln()).sqrt();
    let theta = std::f32::consts::TAU * u2;
    (r * theta.cos(), r * theta.sin())
}

fn gaussian_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let scale = 1.0 / (rows as f32).sqrt();
    let mut data = Vec::with_capacity(rows * cols);
    while data.len() < rows * cols {
        let (a, b) = gaussian_pair(&mut rng);
        data.push(a * scale);
        if data.len() < rows * cols {
            data.push(b * scale);
        }
    }
    Array2::from_shape_vec((rows, cols), data).unwrap_or_else(|_| Array2::zeros((rows, cols)))
}

/// LRU-bounded cache of seeded `N x k` Gaussian matrices for random
/// projection expansion.
pub struct RandomProjectionCache {
    inner: Mutex<LruCache<(usize, usize), Array2<f32>>>,
}

impl RandomProjectionCache {
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(RANDOM_PROJECTION_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        RandomProjectionCache {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns the seeded `native_dims x k` matrix, generating (and
    /// caching) it on first use.
    pub fn get_or_create(&self, native_dims: usize, k: usize) -> Array2<f32> {
        let mut inner = self.inner.lock();
        if let Some(m) = inner.get(&(native_dims, k)) {
            return m.clone();
        }
        let matrix = gaussian_matrix(native_dims, k, seed_for(native_dims, k));
        inner.put((native_dims, k), matrix.clone());
        matrix
    }
}

impl Default for RandomProjectionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedProjection {
    native_dims: usize,
    target_dims: usize,
    mean: Vec<f32>,
    components: Vec<f32>, // row-major native_dims x target_dims
}

/// A fitted PCA-style compression projection: centers by the training
/// mean, then projects onto `target_dims` orthonormal components found via
/// subspace iteration on the sample covariance.
pub struct LearnedProjection {
    pub native_dims: usize,
    pub target_dims: usize,
    mean: Array1<f32>,
    components: Array2<f32>, // native_dims x target_dims, orthonormal columns
}

impl LearnedProjection {
    pub fn apply(&self, native: &[f32]) -> Vec<f32> {
        let x = Array1::from_vec(native.to_vec()) - &self.mean;
        x.dot(&self.components).to_vec()
    }

    fn fit(samples: &[Vec<f32>], native_dims: usize, target_dims: usize) -> Self {
        let n = samples.len() as f32;
        let mut mean = Array1::<f32>::zeros(native_dims);
        for s in samples {
            for (i, v) in s.iter().enumerate() {
                mean[i] += v / n;
            }
        }

        let centered: Vec<Array1<f32>> = samples
            .iter()
            .map(|s| Array1::from_vec(s.clone()) - &mean)
            .collect();

        // Subspace iteration on the (implicit) covariance matrix
        // C = X^T X / n, approximating the top `target_dims` eigenvectors
        // without materialising an N x N matrix when N is large: each
        // C @ Q is computed as X^T (X @ Q) / n.
        let mut q = gaussian_matrix(native_dims, target_dims, seed_for(native_dims, target_dims) ^ 1);
        for _ in 0..SUBSPACE_ITERATIONS {
            let mut xq = Array2::<f32>::zeros((samples.len(), target_dims));
            for (row, c) in centered.iter().enumerate() {
                let projected = c.dot(&q);
                xq.row_mut(row).assign(&projected);
            }
            let mut cq = Array2::<f32>::zeros((native_dims, target_dims));
            for (row, c) in centered.iter().enumerate() {
                let coeffs = xq.row(row);
                for j in 0..target_dims {
                    let coeff = coeffs[j] / n;
                    for i in 0..native_dims {
                        cq[[i, j]] += c[i] * coeff;
                    }
                }
            }
            q = modified_gram_schmidt(cq);
        }

        LearnedProjection {
            native_dims,
            target_dims,
            mean,
            components: q,
        }
    }

    fn to_persisted(&self) -> PersistedProjection {
        PersistedProjection {
            native_dims: self.native_dims,
            target_dims: self.target_dims,
            mean: self.mean.to_vec(),
            components: self.components.iter().copied().collect(),
        }
    }

    fn from_persisted(p: PersistedProjection) -> Option<Self> {
        let components = Array2::from_shape_vec((p.native_dims, p.target_dims), p.components).ok()?;
        Some(LearnedProjection {
            native_dims: p.native_dims,
            target_dims: p.target_dims,
            mean: Array1::from_vec(p.mean),
            components,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let body = bincode::serde::encode_to_vec(self.to_persisted(), bincode::config::standard())
            .map_err(|e| EmbedError::Encode(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("bin.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            use std::io::Write;
            f.write_all(&PROJECTION_MAGIC)?;
            f.write_all(&PROJECTION_FORMAT_VERSION.to_le_bytes())?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EmbedError::Io(e)),
        };
        if bytes.len() < 6 || bytes[..4] != PROJECTION_MAGIC {
            return Ok(None);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != PROJECTION_FORMAT_VERSION {
            return Ok(None);
        }
        let (persisted, _): (PersistedProjection, usize) =
            bincode::serde::decode_from_slice(&bytes[6..], bincode::config::standard())
                .map_err(|e| EmbedError::Encode(e.to_string()))?;
        Ok(Self::from_persisted(persisted))
    }
}

fn modified_gram_schmidt(mut m: Array2<f32>) -> Array2<f32> {
    let cols = m.ncols();
    for j in 0..cols {
        for k in 0..j {
            let (col_k, col_j) = {
                let col_k = m.column(k).to_owned();
                let col_j = m.column(j).to_owned();
                (col_k, col_j)
            };
            let proj = col_k.dot(&col_j);
            let mut col_j_mut = m.column_mut(j);
            col_j_mut.scaled_add(-proj, &col_k);
        }
        let norm = m.column(j).dot(&m.column(j)).sqrt();
        if norm > 1e-8 {
            let mut col_j_mut = m.column_mut(j);
            col_j_mut /= norm;
        }
    }
    m
}

/// Accumulates native vectors per target dimension until [`MIN_SAMPLES`] is
/// reached, then fits and persists a [`LearnedProjection`]; thereafter the
/// projection is read-only.
pub struct LearnedProjectionStore {
    cache_dir: PathBuf,
    state: Mutex<std::collections::HashMap<usize, ProjectionState>>,
}

enum ProjectionState {
    Collecting(Vec<Vec<f32>>),
    Fitted(std::sync::Arc<LearnedProjection>),
}

impl LearnedProjectionStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        LearnedProjectionStore {
            cache_dir,
            state: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn path_for(&self, target_dims: usize) -> PathBuf {
        self.cache_dir.join("projections").join(format!("{target_dims}.bin"))
    }

    /// Returns a fitted projection for `target_dims` if one is already
    /// available (in memory or on disk), and records `native` as a
    /// training sample otherwise (fitting once enough samples accumulate).
    pub fn get_or_observe(
        &self,
        native_dims: usize,
        target_dims: usize,
        native: &[f32],
    ) -> Option<std::sync::Arc<LearnedProjection>> {
        {
            let state = self.state.lock();
            if let Some(ProjectionState::Fitted(p)) = state.get(&target_dims) {
                return Some(p.clone());
            }
        }

        if let Ok(Some(loaded)) = LearnedProjection::load(&self.path_for(target_dims)) {
            let arc = std::sync::Arc::new(loaded);
            self.state
                .lock()
                .insert(target_dims, ProjectionState::Fitted(arc.clone()));
            return Some(arc);
        }

        let mut state = self.state.lock();
        let entry = state
            .entry(target_dims)
            .or_insert_with(|| ProjectionState::Collecting(Vec::with_capacity(MIN_SAMPLES)));

        match entry {
            ProjectionState::Fitted(p) => Some(p.clone()),
            ProjectionState::Collecting(samples) => {
                samples.push(native.to_vec());
                if samples.len() >= MIN_SAMPLES {
                    let fitted = LearnedProjection::fit(samples, native_dims, target_dims);
                    let arc = std::sync::Arc::new(fitted);
                    if let Err(e) = arc.save(&self.path_for(target_dims)) {
                        tracing::warn!(error = %e, target_dims, "failed to persist learned projection");
                    }
                    *entry = ProjectionState::Fitted(arc.clone());
                    Some(arc)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn random_projection_is_deterministic_for_same_shape() {
        let cache = RandomProjectionCache::new();
        let a = cache.get_or_create(8, 4);
        let b = cache.get_or_create(8, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn random_projection_differs_across_shapes() {
        let cache = RandomProjectionCache::new();
        let a = cache.get_or_create(8, 4);
        let b = cache.get_or_create(8, 5);
        assert_ne!(a.shape(), b.shape());
    }

    #[test]
    fn learned_projection_save_and_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let samples: Vec<Vec<f32>> = (0..MIN_SAMPLES)
            .map(|i| vec![i as f32 * 0.01, 1.0 - i as f32 * 0.01, 0.5])
            .collect();
        let projection = LearnedProjection::fit(&samples, 3, 2);
        let path = dir.path().join("proj.bin");
        projection.save(&path).expect("save");
        let loaded = LearnedProjection::load(&path).expect("load").expect("present");
        assert_eq!(loaded.native_dims, 3);
        assert_eq!(loaded.target_dims, 2);
        let out = loaded.apply(&[0.1, 0.2, 0.3]);
        assert_eq!(out.len(), 2);
    }
}
