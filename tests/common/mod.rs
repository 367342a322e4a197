//! Helpers shared by the integration tests.

use multi_lora::tokenizer::TextCodec;
use multi_lora::Result;

/// One token per byte.
pub struct ByteCodec;

impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, token_ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
        let bytes: Vec<u8> = token_ids.iter().map(|&t| t as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
