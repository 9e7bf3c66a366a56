//! Encoder (C1): wraps tokenizer + ONNX session, producing native-dimension
//! vectors, bounded to a configured CPU-thread budget.

mod artifact;
mod onnx;
mod tokenizer;

use std::path::PathBuf;

use tracing::info;

use crate::error::Result;

pub use artifact::ArtifactTier;
pub use onnx::{OnnxConfig, PoolingStrategy};
pub use tokenizer::{FastTokenizer, TokenizerConfig};

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub model_id: String,
    pub model_cache_dir: PathBuf,
    pub tokenizer_cache_dir: PathBuf,
    pub max_length: usize,
    pub batch_size: usize,
    pub thread_min: usize,
    pub thread_max: usize,
}

pub struct Encoder {
    tokenizer: FastTokenizer,
    session: onnx::OnnxEncoder,
}

impl Encoder {
    pub fn load(config: &EncoderConfig) -> Result<Self> {
        let tokenizer = FastTokenizer::from_pretrained(
            &config.model_id,
            TokenizerConfig {
                max_length: config.max_length,
                padding: true,
                truncation: true,
                cache_dir: config.tokenizer_cache_dir.clone(),
                batch_size: config.batch_size,
            },
        )?;

        let session = onnx::OnnxEncoder::load(
            OnnxConfig {
                model_id: config.model_id.clone(),
                cache_dir: config.model_cache_dir.clone(),
                max_length: config.max_length,
                pooling: PoolingStrategy::Mean,
            },
            config.thread_min,
            config.thread_max,
        )?;

        info!(
            model_id = %config.model_id,
            artifact_tier = %session.tier(),
            native_dims = session.native_dims(),
            "encoder loaded"
        );

        Ok(Encoder { tokenizer, session })
    }

    /// Dimension of vectors produced before adaptation; constant for the
    /// lifetime of this instance.
    pub fn native_dims(&self) -> usize {
        self.session.native_dims()
    }

    pub fn artifact_tier(&self) -> ArtifactTier {
        self.session.tier()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = self.tokenizer.encode(text)?;
        let mut embeddings = self.session.infer_batch(&[tokens])?;
        Ok(embeddings.pop().unwrap_or_default())
    }

    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let token_batches = self.tokenizer.encode_batch(texts)?;
        self.session.infer_batch(&token_batches)
    }
}
