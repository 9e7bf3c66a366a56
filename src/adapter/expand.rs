//! Expansion feature sources for `T > N` (§4.2). Each source contributes a
//! bounded share of the deficit `D = T - N`; any residual is zero-padded by
//! the caller.

use ndarray::Array1;

use super::projection::RandomProjectionCache;

const FREQUENCY_LADDER: [f32; 5] = [0.5, 1.0, 2.0, 4.0, 8.0];

/// `native . R`, `R` a fixed seeded `N x k` Gaussian matrix scaled by
/// `1/sqrt(N)`.
pub fn random_projection(native: &[f32], k: usize, cache: &RandomProjectionCache) -> Vec<f32> {
    if k == 0 {
        return Vec::new();
    }
    let matrix = cache.get_or_create(native.len(), k);
    let x = Array1::from_vec(native.to_vec());
    x.dot(&matrix).to_vec()
}

/// Character n-grams (n in {1,2,3}) and whole-word hashes mapped into `k`
/// buckets with `1 / (n * |text| + 1)` weights, L2-normalised before
/// return. Returns `None` when `k == 0` or the text is unavailable
/// (callers fold that share back into the random-projection source; see
/// DESIGN.md's resolution of the open question).
pub fn text_hash_features(text: Option<&str>, k: usize) -> Option<Vec<f32>> {
    if k == 0 {
        return None;
    }
    let text = text?;
    let len = text.chars().count().max(1);
    let mut buckets = vec![0f32; k];

    let chars: Vec<char> = text.chars().collect();
    for n in 1..=3usize {
        if chars.len() < n {
            continue;
        }
        let weight = 1.0 / (n as f32 * len as f32 + 1.0);
        for window in chars.windows(n) {
            let gram: String = window.iter().collect();
            let bucket = bucket_index(&gram, k);
            buckets[bucket] += weight;
        }
    }

    for word in text.split_whitespace() {
        let weight = 1.0 / (len as f32 + 1.0);
        let bucket = bucket_index(word, k);
        buckets[bucket] += weight;
    }

    l2_normalize_in_place(&mut buckets);
    Some(buckets)
}

fn bucket_index(s: &str, k: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    (hasher.finish() % k as u64) as usize
}

/// Pairwise products `v_i . v_j` over the first `min(N, 100)` dimensions,
/// in lexicographic `(i <= j)` order, truncated to `k`.
pub fn polynomial_features(native: &[f32], k: usize) -> Vec<f32> {
    if k == 0 {
        return Vec::new();
    }
    let bound = native.len().min(100);
    let mut out = Vec::with_capacity(k);
    'outer: for i in 0..bound {
        for j in i..bound {
            if out.len() >= k {
                break 'outer;
            }
            out.push(native[i] * native[j]);
        }
    }
    out.resize(k, 0.0);
    out
}

/// Interleaved `sin(2*pi*f*v_i)` / `cos(2*pi*f*v_i)` over the frequency
/// ladder `{0.5, 1, 2, 4, 8}` and `i`, truncated to `k`.
pub fn fourier_features(native: &[f32], k: usize) -> Vec<f32> {
    if k == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(k);
    'outer: for &f in FREQUENCY_LADDER.iter() {
        for &v in native {
            if out.len() >= k {
                break 'outer;
            }
            let angle = std::f32::consts::TAU * f * v;
            out.push(angle.sin());
            if out.len() < k {
                out.push(angle.cos());
            }
        }
    }
    out.resize(k, 0.0);
    out
}

fn l2_normalize_in_place(v: &mut [f32]) {
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

    #[test]
    fn random_projection_has_requested_length() {
        let cache = RandomProjectionCache::new();
        let native = vec![0.1_f32; 16];
        let out = random_projection(&native, 10, &cache);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn text_hash_features_are_unit_norm() {
        let out = text_hash_features(Some("hello world"), 32).expect("present");
        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }

    #[test]
    fn text_hash_features_absent_without_text() {
        assert!(text_hash_features(None, 32).is_none());
    }

    #[test]
    fn polynomial_and_fourier_features_respect_k() {
        let native = vec![0.2_f32; 20];
        assert_eq!(polynomial_features(&native, 17).len(), 17);
        assert_eq!(fourier_features(&native, 23).len(), 23);
    }
}
