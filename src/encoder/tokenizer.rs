//! HuggingFace tokenizer wrapper with an in-process token cache. Grounded
//! in the teacher's fast-tokenizer module; the token cache key uses the
//! standard library's `DefaultHasher` rather than a vendored xxhash crate
//! (the hash is never persisted and doesn't need to be portable), and a
//! missing tokenizer file is resolved via the HF Hub cache instead of
//! requiring a manual download step.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use parking_lot::RwLock;
use tokenizers::{tokenizer::Tokenizer, PaddingParams, PaddingStrategy, TruncationParams};

use crate::error::{EmbedError, Result};

#[derive(Debug, Clone)]
pub struct TokenizerConfig {
    pub max_length: usize,
    pub padding: bool,
    pub truncation: bool,
    pub cache_dir: PathBuf,
    pub batch_size: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_length: 384,
            padding: true,
            truncation: true,
            cache_dir: PathBuf::from("./models/tokenizers"),
            batch_size: 128,
        }
    }
}

pub struct FastTokenizer {
    tokenizer: Tokenizer,
    config: TokenizerConfig,
    token_cache: RwLock<HashMap<u64, Vec<u32>>>,
}

impl FastTokenizer {
    pub fn from_pretrained(model_id: &str, config: TokenizerConfig) -> Result<Self> {
        let path = resolve_tokenizer_path(model_id, &config.cache_dir)?;
        let mut tokenizer = Tokenizer::from_file(&path)
            .map_err(|e| EmbedError::ModelArtifactMissing(format!("tokenizer load failed: {e}")))?;

        if config.truncation {
            tokenizer
                .with_truncation(Some(TruncationParams {
                    max_length: config.max_length,
                    ..Default::default()
                }))
                .map_err(|e| EmbedError::EncoderLoad(format!("truncation config: {e}")))?;
        }
        if config.padding {
            tokenizer.with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::Fixed(config.max_length),
                ..Default::default()
            }));
        }

        Ok(FastTokenizer {
            tokenizer,
            config,
            token_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let hash = hash_text(text);
        if let Some(tokens) = self.token_cache.read().get(&hash) {
            return Ok(tokens.clone());
        }
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| EmbedError::EncoderInference(format!("tokenization failed: {e}")))?;
        let tokens = encoding.get_ids().to_vec();
        self.token_cache.write().insert(hash, tokens.clone());
        Ok(tokens)
    }

    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size) {
            let encodings = self
                .tokenizer
                .encode_batch(chunk.to_vec(), false)
                .map_err(|e| EmbedError::EncoderInference(format!("batch tokenization failed: {e}")))?;
            for encoding in encodings {
                out.push(encoding.get_ids().to_vec());
            }
        }
        Ok(out)
    }
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Resolves `{cache_dir}/{model_id}.json`, downloading it from the HF Hub
/// cache on first use when the `hf-hub` feature is enabled.
fn resolve_tokenizer_path(model_id: &str, cache_dir: &std::path::Path) -> Result<PathBuf> {
    let local_path = cache_dir.join(format!("{}.json", model_id.replace('/', "_")));
    if local_path.exists() {
        return Ok(local_path);
    }

    #[cfg(feature = "hf-hub")]
    {
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| EmbedError::ModelArtifactMissing(format!("hf-hub api init failed: {e}")))?;
        let repo = api.model(model_id.to_string());
        let downloaded = repo
            .get("tokenizer.json")
            .map_err(|e| EmbedError::ModelArtifactMissing(format!("tokenizer.json download failed: {e}")))?;
        std::fs::create_dir_all(cache_dir)?;
        std::fs::copy(&downloaded, &local_path)?;
        return Ok(local_path);
    }

    #[cfg(not(feature = "hf-hub"))]
    {
        Err(EmbedError::ModelArtifactMissing(format!(
            "tokenizer not found at {} and the hf-hub feature is disabled",
            local_path.display()
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_same_text() {
        assert_eq!(hash_text("hello"), hash_text("hello"));
    }

    #[test]
    fn hash_differs_for_different_text() {
        assert_ne!(hash_text("hello"), hash_text("world"));
    }
}
