//! Configuration types for multi-lora.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sampling configuration for one generation session.
///
/// Validated once, when the session is created. `top_k` uses `-1` (or `0`)
/// to mean "disabled".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0 = greedy, 1.0 = no change).
    pub temperature: f32,
    /// Repetition penalty over the whole history (1.0 = disabled).
    pub repetition_penalty: f32,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Top-k sampling (-1 or 0 = disabled).
    pub top_k: i64,
    /// Maximum total length (prompt + generated) of the session.
    pub max_length: usize,
    /// Token id that ends generation.
    pub stop_token_id: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.9,
            repetition_penalty: 1.1,
            top_p: 0.9,
            top_k: -1,
            max_length: 1024,
            stop_token_id: 2,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding with no filtering.
    pub fn greedy(max_length: usize, stop_token_id: u32) -> Self {
        Self {
            temperature: 0.0,
            repetition_penalty: 1.0,
            top_p: 1.0,
            top_k: -1,
            max_length,
            stop_token_id,
        }
    }

    /// Check every field against its domain for a prompt of `prompt_len` tokens.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self, prompt_len: usize) -> Result<()> {
        if prompt_len == 0 {
            return Err(Error::Config("prompt must contain at least one token".into()));
        }
        if self.max_length <= prompt_len {
            return Err(Error::Config(format!(
                "max_length {} must exceed prompt length {prompt_len}",
                self.max_length
            )));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            return Err(Error::Config(format!(
                "repetition_penalty must be a finite value > 0, got {}",
                self.repetition_penalty
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::Config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k < -1 {
            return Err(Error::Config(format!(
                "top_k must be >= 0 or -1 (disabled), got {}",
                self.top_k
            )));
        }
        Ok(())
    }

    /// Effective top-k, or `None` when disabled.
    pub fn top_k(&self) -> Option<usize> {
        usize::try_from(self.top_k).ok().filter(|&k| k > 0)
    }
}

/// Cache pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per page.
    pub page_len: usize,
    /// Total number of pages in the pool.
    pub num_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_len: 16,
            num_pages: 4096,
        }
    }
}

impl CacheConfig {
    /// Total token positions the pool can hold.
    pub fn capacity(&self) -> usize {
        self.page_len * self.num_pages
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Emit a session's prompt text to the sink as soon as it is created.
    pub echo_prompt: bool,
    /// Marker emitted after a session ends, before its replacement starts.
    pub end_marker: String,
    /// Base seed for per-session samplers. Unseeded samplers draw from OS entropy.
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            echo_prompt: true,
            end_marker: "\n------\n\n".to_string(),
            seed: None,
        }
    }
}

/// Prompts and weights served for one adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraSpec {
    /// Path to the adapter's safetensors file.
    pub weight_path: PathBuf,
    /// Prompts run with the adapter applied.
    #[serde(default)]
    pub lora_prompts: Vec<String>,
    /// Prompts run against the base model (identity adapter).
    #[serde(default)]
    pub base_prompts: Vec<String>,
}

/// Top-level configuration read by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// HuggingFace id of the base model (used to fetch its tokenizer).
    #[serde(default = "default_base_model")]
    pub base_model: String,
    /// Adapters by name.
    pub adapters: BTreeMap<String, LoraSpec>,
    /// Sampling defaults applied to every session.
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Cache pool settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_base_model() -> String {
    "meta-llama/Llama-2-7b-hf".to_string()
}

impl ServeConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parse a configuration from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        if config.cache.page_len == 0 {
            return Err(Error::Config("cache.page_len must be > 0".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sampling_is_valid() {
        assert!(SamplingConfig::default().validate(16).is_ok());
    }

    #[test]
    fn test_max_length_must_exceed_prompt() {
        let config = SamplingConfig {
            max_length: 4,
            ..SamplingConfig::default()
        };
        assert!(matches!(config.validate(4), Err(Error::Config(_))));
        assert!(config.validate(3).is_ok());
    }

    #[test]
    fn test_top_k_sentinels() {
        let mut config = SamplingConfig::default();
        config.top_k = -1;
        assert_eq!(config.top_k(), None);
        config.top_k = 0;
        assert_eq!(config.top_k(), None);
        config.top_k = 40;
        assert_eq!(config.top_k(), Some(40));
        config.top_k = -2;
        assert!(config.validate(1).is_err());
    }

    #[test]
    fn test_serve_config_from_json() {
        let json = r#"{
            "adapters": {
                "gsm8k": {
                    "weight_path": "/tmp/gsm8k.safetensors",
                    "lora_prompts": ["a", "b"],
                    "base_prompts": ["c"]
                }
            }
        }"#;
        let config = ServeConfig::from_json(json).unwrap();

        assert_eq!(config.base_model, "meta-llama/Llama-2-7b-hf");
        assert_eq!(config.adapters["gsm8k"].lora_prompts.len(), 2);
        assert_eq!(config.cache.page_len, 16);
        assert_eq!(config.sampling, SamplingConfig::default());
        assert!(config.scheduler.echo_prompt);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let json = r#"{
            "adapters": {},
            "sampling": { "temperature": 0.0 },
            "scheduler": { "seed": 7 }
        }"#;
        let config = ServeConfig::from_json(json).unwrap();

        assert_eq!(config.sampling.temperature, 0.0);
        assert_eq!(config.sampling.max_length, 1024);
        assert_eq!(config.scheduler.seed, Some(7));
        assert_eq!(config.scheduler.end_marker, "\n------\n\n");
    }

    #[test]
    fn test_zero_page_len_rejected() {
        let json = r#"{ "adapters": {}, "cache": { "page_len": 0 } }"#;
        assert!(matches!(ServeConfig::from_json(json), Err(Error::Config(_))));
    }
}
