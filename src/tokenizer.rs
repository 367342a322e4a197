//! Text encoding and decoding.
//!
//! The scheduler only needs a deterministic, stateless encode/decode pair.
//! [`TextCodec`] is implemented for [`tokenizers::Tokenizer`]; tests plug in
//! a byte-level codec.

use std::ops::Deref;
use std::path::Path;

use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

/// Encode/decode contract used by session sources and incremental detokenization.
pub trait TextCodec {
    /// Encode text into token ids.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token ids into text.
    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> Result<String>;
}

// `encode`/`decode` live on the inner `TokenizerImpl`; calling them through
// `Tokenizer` would resolve back to this trait.
impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = Deref::deref(self)
            .encode(text, true)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        Deref::deref(self)
            .decode(token_ids, skip_special_tokens)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }
}

/// Load a tokenizer from a local `tokenizer.json`, or fetch it from the
/// HuggingFace Hub when `source` is not an existing path.
pub fn load_tokenizer(source: &str) -> Result<Tokenizer> {
    let path = Path::new(source);
    let path = if path.exists() {
        path.to_path_buf()
    } else {
        let api =
            Api::new().map_err(|e| Error::ModelLoad(format!("Failed to create HF API: {e}")))?;
        api.repo(Repo::new(source.to_string(), RepoType::Model))
            .get("tokenizer.json")
            .map_err(|e| Error::ModelLoad(format!("Failed to download tokenizer.json: {e}")))?
    };

    Tokenizer::from_file(&path).map_err(|e| Error::Tokenization(e.to_string()))
}

/// Byte-level codec shared by the unit tests.
#[cfg(test)]
pub(crate) struct ByteCodec;

#[cfg(test)]
impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, token_ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
        let bytes: Vec<u8> = token_ids.iter().map(|&t| t as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
