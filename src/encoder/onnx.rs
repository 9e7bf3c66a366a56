//! ONNX Runtime session wrapper. Grounded in the teacher's `onnx_models.rs`,
//! rewritten against the current `ort` session-builder API (the teacher's
//! version targeted an older generation with a global `Environment` and
//! `SessionBuilder::new(&env)`, since replaced by `Session::builder()`).

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, Array3, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;

use crate::error::{EmbedError, Result};

use super::artifact::ArtifactTier;

#[derive(Debug, Clone, Copy)]
pub enum PoolingStrategy {
    Mean,
    Cls,
    Max,
}

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub model_id: String,
    pub cache_dir: PathBuf,
    pub max_length: usize,
    pub pooling: PoolingStrategy,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            model_id: "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            cache_dir: PathBuf::from("./models/onnx"),
            max_length: 384,
            pooling: PoolingStrategy::Mean,
        }
    }
}

pub struct OnnxEncoder {
    session: Session,
    config: OnnxConfig,
    native_dims: usize,
    tier: ArtifactTier,
}

impl OnnxEncoder {
    /// Builds a session over the best artifact available for the host CPU,
    /// walking the fallback chain until one of the candidate files exists.
    pub fn load(config: OnnxConfig, thread_min: usize, thread_max: usize) -> Result<Self> {
        let preferred = ArtifactTier::detect();
        let intra_threads = thread_max.max(thread_min).max(1);
        set_blas_thread_env(intra_threads);

        let mut last_err: Option<EmbedError> = None;
        for tier in preferred.fallback_chain() {
            let path = artifact_path(&config, tier);
            if !path.exists() {
                continue;
            }
            match build_session(&path, intra_threads) {
                Ok(session) => {
                    let native_dims = probe_native_dims(&session, config.max_length)?;
                    return Ok(OnnxEncoder {
                        session,
                        config,
                        native_dims,
                        tier,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            EmbedError::ModelArtifactMissing(format!(
                "no ONNX artifact found under {} for {}",
                config.cache_dir.display(),
                config.model_id
            ))
        }))
    }

    pub fn native_dims(&self) -> usize {
        self.native_dims
    }

    pub fn tier(&self) -> ArtifactTier {
        self.tier
    }

    /// Runs inference on a batch of equal-length (already padded) token
    /// sequences, returning one pooled, un-normalised vector per input.
    pub fn infer_batch(&self, token_batches: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        if token_batches.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = token_batches.len();
        let seq_len = token_batches[0].len();

        let mut input_ids = Array2::<i64>::zeros((batch_size, seq_len));
        let mut attention_mask = Array2::<i64>::ones((batch_size, seq_len));
        for (i, tokens) in token_batches.iter().enumerate() {
            for (j, &token) in tokens.iter().enumerate() {
                input_ids[[i, j]] = token as i64;
                if token == 0 {
                    attention_mask[[i, j]] = 0;
                }
            }
        }
        let token_type_ids = Array2::<i64>::zeros((batch_size, seq_len));

        let input_ids_value = Value::from_array(input_ids.clone())
            .map_err(|e| EmbedError::EncoderInference(format!("input_ids tensor: {e}")))?;
        let attention_mask_value = Value::from_array(attention_mask.clone())
            .map_err(|e| EmbedError::EncoderInference(format!("attention_mask tensor: {e}")))?;
        let token_type_ids_value = Value::from_array(token_type_ids)
            .map_err(|e| EmbedError::EncoderInference(format!("token_type_ids tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input_ids" => input_ids_value,
                "attention_mask" => attention_mask_value,
                "token_type_ids" => token_type_ids_value,
            ])
            .map_err(|e| EmbedError::EncoderInference(format!("session run failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::EncoderInference(format!("output extraction failed: {e}")))?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        if dims.len() != 3 {
            return Err(EmbedError::EncoderInference(format!(
                "unexpected output rank {} (expected token embeddings [batch, seq, hidden])",
                dims.len()
            )));
        }
        let token_embeddings = Array3::from_shape_vec((dims[0], dims[1], dims[2]), data.to_vec())
            .map_err(|e| EmbedError::EncoderInference(format!("output reshape failed: {e}")))?;

        Ok(self.pool(token_embeddings, &attention_mask))
    }

    fn pool(&self, embeddings: Array3<f32>, attention_mask: &Array2<i64>) -> Vec<Vec<f32>> {
        let batch_size = embeddings.shape()[0];
        let mut pooled = Vec::with_capacity(batch_size);

        for i in 0..batch_size {
            let embedding = embeddings.index_axis(Axis(0), i);
            let mask = attention_mask.index_axis(Axis(0), i);

            let vector = match self.config.pooling {
                PoolingStrategy::Mean => {
                    let mut sum = Array1::<f32>::zeros(embedding.shape()[1]);
                    let mut count = 0f32;
                    for (j, &mask_val) in mask.iter().enumerate() {
                        if mask_val == 1 {
                            sum += &embedding.index_axis(Axis(0), j);
                            count += 1.0;
                        }
                    }
                    if count == 0.0 {
                        sum.to_vec()
                    } else {
                        (sum / count).to_vec()
                    }
                }
                PoolingStrategy::Cls => embedding.index_axis(Axis(0), 0).to_vec(),
                PoolingStrategy::Max => {
                    let hidden = embedding.shape()[1];
                    let mut max_vals = vec![f32::NEG_INFINITY; hidden];
                    for (j, &mask_val) in mask.iter().enumerate() {
                        if mask_val == 1 {
                            let token_embedding = embedding.index_axis(Axis(0), j);
                            for (k, &val) in token_embedding.iter().enumerate() {
                                max_vals[k] = max_vals[k].max(val);
                            }
                        }
                    }
                    max_vals
                }
            };
            pooled.push(vector);
        }
        pooled
    }
}

/// Caps the BLAS backends ONNX Runtime's CPU execution provider may call
/// into, so the configured thread budget holds even inside vendored math
/// libraries that don't go through `ort`'s own thread pool.
fn set_blas_thread_env(threads: usize) {
    let value = threads.to_string();
    // SAFETY: called once from the single-threaded encoder-load path before
    // any session (and thus any BLAS call) exists.
    unsafe {
        std::env::set_var("OMP_NUM_THREADS", &value);
        std::env::set_var("MKL_NUM_THREADS", &value);
        std::env::set_var("OPENBLAS_NUM_THREADS", &value);
        std::env::set_var("BLIS_NUM_THREADS", &value);
    }
}

fn build_session(path: &Path, intra_threads: usize) -> Result<Session> {
    Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_intra_threads(intra_threads))
        .and_then(|b| b.with_inter_threads(1))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| EmbedError::EncoderLoad(format!("{}: {e}", path.display())))
}

/// Runs a single-token dummy inference to read the hidden dimension off the
/// model's own output shape, rather than hardcoding it per model family.
fn probe_native_dims(session: &Session, max_length: usize) -> Result<usize> {
    let seq_len = max_length.min(8).max(1);
    let input_ids = Array2::<i64>::zeros((1, seq_len));
    let attention_mask = Array2::<i64>::ones((1, seq_len));
    let token_type_ids = Array2::<i64>::zeros((1, seq_len));

    let input_ids_value = Value::from_array(input_ids)
        .map_err(|e| EmbedError::EncoderLoad(format!("probe input_ids: {e}")))?;
    let attention_mask_value = Value::from_array(attention_mask)
        .map_err(|e| EmbedError::EncoderLoad(format!("probe attention_mask: {e}")))?;
    let token_type_ids_value = Value::from_array(token_type_ids)
        .map_err(|e| EmbedError::EncoderLoad(format!("probe token_type_ids: {e}")))?;

    let outputs = session
        .run(ort::inputs![
            "input_ids" => input_ids_value,
            "attention_mask" => attention_mask_value,
            "token_type_ids" => token_type_ids_value,
        ])
        .map_err(|e| EmbedError::EncoderLoad(format!("probe run failed: {e}")))?;

    let (shape, _) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| EmbedError::EncoderLoad(format!("probe extraction failed: {e}")))?;
    shape
        .last()
        .map(|&d| d as usize)
        .ok_or_else(|| EmbedError::EncoderLoad("probe output has no hidden axis".to_string()))
}

fn artifact_path(config: &OnnxConfig, tier: ArtifactTier) -> PathBuf {
    let file_name = format!("{}.{}.onnx", config.model_id.replace('/', "_"), tier.suffix());
    config.cache_dir.join(file_name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_includes_tier_suffix() {
        let config = OnnxConfig {
            cache_dir: PathBuf::from("/models"),
            model_id: "org/model".to_string(),
            ..Default::default()
        };
        let path = artifact_path(&config, ArtifactTier::Avx2);
        assert_eq!(path, PathBuf::from("/models/org_model.avx2.onnx"));
    }
}
