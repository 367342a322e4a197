//! Integration tests for the `tokenizers` codec.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use multi_lora::adapter::AdapterRegistry;
use multi_lora::config::{LoraSpec, SamplingConfig, SchedulerConfig};
use multi_lora::core::cache::CacheSlotManager;
use multi_lora::core::{GenerationSession, PagedKvPool};
use multi_lora::engine::forward::{ForwardBatch, ModelForward};
use multi_lora::scheduler::{
    BatchScheduler, Role, SessionKey, TenantPromptSource, TranscriptSink,
};
use multi_lora::tokenizer::{load_tokenizer, TextCodec};
use multi_lora::{Error, Result};

const HELLO: u32 = 1;
const WORLD: u32 = 2;

/// Word-level tokenizer with a whitespace pre-tokenizer and no decoder.
const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": { "type": "Whitespace" },
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": { "[UNK]": 0, "hello": 1, "world": 2, "!": 3 },
    "unk_token": "[UNK]"
  }
}"#;

fn write_tokenizer(dir: &Path) -> String {
    let path = dir.join("tokenizer.json");
    fs::write(&path, TOKENIZER_JSON).unwrap();
    path.to_string_lossy().into_owned()
}

/// Always predicts `WORLD`.
struct WorldForward;

impl ModelForward for WorldForward {
    fn forward(&mut self, batch: &ForwardBatch<'_>) -> Result<Tensor> {
        let rows = batch.lens.num_outputs();
        let mut values = vec![0f32; rows * 4];
        for row in 0..rows {
            values[row * 4 + WORLD as usize] = 10.0;
        }
        Ok(Tensor::from_vec(values, (rows, 4), &Device::Cpu)?)
    }
}

#[test]
fn test_local_tokenizer_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer = load_tokenizer(&write_tokenizer(dir.path())).unwrap();

    let ids = TextCodec::encode(&tokenizer, "hello world").unwrap();
    assert_eq!(ids, vec![HELLO, WORLD]);
    assert_eq!(
        TextCodec::decode(&tokenizer, &ids, true).unwrap(),
        "hello world"
    );
}

#[test]
fn test_invalid_tokenizer_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokenizer.json");
    fs::write(&path, "{ not json").unwrap();

    assert!(matches!(
        load_tokenizer(&path.to_string_lossy()),
        Err(Error::Tokenization(_))
    ));
}

#[test]
fn test_incremental_text_through_tokenizer() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer = load_tokenizer(&write_tokenizer(dir.path())).unwrap();
    let mut cache = CacheSlotManager::new(PagedKvPool::new(8, 4).unwrap());
    let mut session =
        GenerationSession::create(vec![HELLO], "empty", SamplingConfig::greedy(8, 0), &mut cache)
            .unwrap();

    assert_eq!(session.flush_incremental_text(&tokenizer).unwrap(), "hello");

    session.extend_cache(&mut cache).unwrap();
    session.append(WORLD);
    assert_eq!(session.flush_incremental_text(&tokenizer).unwrap(), " world");
}

#[test]
fn test_scheduler_runs_with_tokenizer_codec() {
    let dir = tempfile::tempdir().unwrap();
    let tokenizer = load_tokenizer(&write_tokenizer(dir.path())).unwrap();
    let codec: Arc<dyn TextCodec> = Arc::new(tokenizer);

    let mut specs = BTreeMap::new();
    specs.insert(
        "greet".to_string(),
        LoraSpec {
            weight_path: "unused.safetensors".into(),
            lora_prompts: Vec::new(),
            base_prompts: vec!["hello".into()],
        },
    );
    let sampling = SamplingConfig::greedy(3, 0);
    let source = TenantPromptSource::from_specs(&specs, codec.clone(), sampling);
    let mut scheduler = BatchScheduler::new(
        SchedulerConfig::default(),
        PagedKvPool::new(8, 4).unwrap(),
        AdapterRegistry::new(),
        source,
        codec,
    );
    let mut sink = TranscriptSink::new("|");

    scheduler.run(&mut WorldForward, &mut sink).unwrap();

    let key = SessionKey::new("greet", Role::Base);
    assert_eq!(sink.transcript(&key), Some("hello world world|"));
}
