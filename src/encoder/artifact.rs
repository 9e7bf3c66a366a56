//! Selects the best quantised model artifact for the host CPU, preferring
//! (in order) AVX-512-VNNI, AVX-512, AVX2, generic quantised, unquantised.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactTier {
    Avx512Vnni,
    Avx512,
    Avx2,
    GenericQuantized,
    Unquantized,
}

impl fmt::Display for ArtifactTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactTier::Avx512Vnni => "avx512-vnni",
            ArtifactTier::Avx512 => "avx512",
            ArtifactTier::Avx2 => "avx2",
            ArtifactTier::GenericQuantized => "generic-quantized",
            ArtifactTier::Unquantized => "unquantized",
        };
        f.write_str(s)
    }
}

impl ArtifactTier {
    /// File-name suffix used to locate the artifact under the model cache
    /// directory, e.g. `model.avx512-vnni.onnx`.
    pub fn suffix(&self) -> &'static str {
        match self {
            ArtifactTier::Avx512Vnni => "avx512vnni",
            ArtifactTier::Avx512 => "avx512",
            ArtifactTier::Avx2 => "avx2",
            ArtifactTier::GenericQuantized => "int8",
            ArtifactTier::Unquantized => "fp32",
        }
    }

    /// Probes the host CPU feature set and returns the best tier available.
    /// Non-x86_64 targets always fall back to the generic quantised tier,
    /// since AVX probing is meaningless there.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if std::is_x86_feature_detected!("avx512vnni") {
                return ArtifactTier::Avx512Vnni;
            }
            if std::is_x86_feature_detected!("avx512f") {
                return ArtifactTier::Avx512;
            }
            if std::is_x86_feature_detected!("avx2") {
                return ArtifactTier::Avx2;
            }
            ArtifactTier::GenericQuantized
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            ArtifactTier::GenericQuantized
        }
    }

    /// The ordered fallback chain starting from `self`, ending at
    /// [`ArtifactTier::Unquantized`], used when the preferred artifact
    /// file doesn't exist on disk.
    pub fn fallback_chain(self) -> Vec<ArtifactTier> {
        let all = [
            ArtifactTier::Avx512Vnni,
            ArtifactTier::Avx512,
            ArtifactTier::Avx2,
            ArtifactTier::GenericQuantized,
            ArtifactTier::Unquantized,
        ];
        let start = all.iter().position(|t| *t == self).unwrap_or(0);
        all[start..].to_vec()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn fallback_chain_always_ends_unquantized() {
        let chain = ArtifactTier::Avx2.fallback_chain();
        assert_eq!(*chain.last().unwrap_or(&ArtifactTier::Unquantized), ArtifactTier::Unquantized);
    }

    #[test]
    fn fallback_chain_starts_at_self() {
        let chain = ArtifactTier::Avx512.fallback_chain();
        assert_eq!(chain[0], ArtifactTier::Avx512);
    }

    #[test]
    fn detect_returns_a_value_on_any_arch() {
        // Must not panic, whichever tier it lands on.
        let _ = ArtifactTier::detect();
    }
}
