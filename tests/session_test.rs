//! Integration tests for GenerationSession.

use candle_core::{Device, Tensor};
use multi_lora::config::SamplingConfig;
use multi_lora::core::cache::CacheSlotManager;
use multi_lora::core::{FinishReason, GenerationSession, PagedKvPool, Phase};
use multi_lora::{Error, TextCodec};

mod common;
use common::ByteCodec;

fn test_cache() -> CacheSlotManager<PagedKvPool> {
    CacheSlotManager::new(PagedKvPool::new(32, 4).unwrap())
}

fn advance(
    session: &mut GenerationSession,
    cache: &mut CacheSlotManager<PagedKvPool>,
    token: u32,
) {
    session.extend_cache(cache).unwrap();
    session.append(token);
}

#[test]
fn test_session_lifecycle() {
    let mut cache = test_cache();
    let config = SamplingConfig::greedy(6, 2);
    let mut session = GenerationSession::create(vec![5, 6, 7], "math", config, &mut cache).unwrap();

    assert_eq!(session.phase(), Phase::Prefill);
    assert_eq!(session.adapter_id(), "math");
    assert_eq!(session.num_rows(), 3);

    advance(&mut session, &mut cache, 9);
    assert_eq!(session.phase(), Phase::Decode);
    assert_eq!(session.num_rows(), 1);
    assert_eq!(session.last_token(), Some(9));
    assert_eq!(session.generated_tokens(), &[9]);
    assert_eq!(session.cache_len(), 4);

    session.release_cache(&mut cache).unwrap();
    assert!(session.cache_slot().is_released());
    assert!(matches!(
        session.release_cache(&mut cache),
        Err(Error::DoubleRelease(_))
    ));
    assert!(matches!(
        session.extend_cache(&mut cache),
        Err(Error::SlotReleased(_))
    ));
}

#[test]
fn test_stop_takes_precedence_over_length() {
    let mut cache = test_cache();
    let config = SamplingConfig::greedy(3, 2);
    let mut session = GenerationSession::create(vec![1, 1], "a", config, &mut cache).unwrap();

    advance(&mut session, &mut cache, 2);
    assert_eq!(session.finish_reason(), Some(FinishReason::Stop));
}

#[test]
fn test_create_rejects_invalid_configs() {
    let mut cache = test_cache();
    let cases = [
        SamplingConfig {
            temperature: -0.5,
            ..SamplingConfig::default()
        },
        SamplingConfig {
            temperature: f32::NAN,
            ..SamplingConfig::default()
        },
        SamplingConfig {
            repetition_penalty: 0.0,
            ..SamplingConfig::default()
        },
        SamplingConfig {
            top_p: 0.0,
            ..SamplingConfig::default()
        },
        SamplingConfig {
            top_p: 1.5,
            ..SamplingConfig::default()
        },
        SamplingConfig {
            top_k: -3,
            ..SamplingConfig::default()
        },
    ];

    for config in cases {
        let result = GenerationSession::create(vec![1, 2], "a", config, &mut cache);
        assert!(matches!(result, Err(Error::Config(_))));
    }
    let empty = GenerationSession::create(vec![], "a", SamplingConfig::default(), &mut cache);
    assert!(matches!(empty, Err(Error::Config(_))));
    assert_eq!(cache.live_slots(), 0);
}

#[test]
fn test_create_propagates_cache_exhaustion() {
    let mut cache = CacheSlotManager::new(PagedKvPool::new(1, 4).unwrap());
    let config = SamplingConfig::greedy(16, 0);

    let result = GenerationSession::create(vec![1; 5], "a", config, &mut cache);
    assert!(matches!(result, Err(Error::CacheExhausted(_))));
}

#[test]
fn test_select_next_token_does_not_touch_history() {
    let mut cache = test_cache();
    let config = SamplingConfig::greedy(8, 0);
    let mut session = GenerationSession::create(vec![1, 2], "a", config, &mut cache).unwrap();
    let logits = Tensor::new(&[0.0f32, 0.0, 0.0, 4.0], &Device::Cpu).unwrap();

    assert_eq!(session.select_next_token(&logits).unwrap(), 3);
    assert_eq!(session.history(), &[1, 2]);
}

#[test]
fn test_incremental_text_with_multibyte_characters() {
    let mut cache = test_cache();
    let codec = ByteCodec;
    let config = SamplingConfig::greedy(32, 0);
    let prompt = codec.encode("Q:").unwrap();
    let mut session = GenerationSession::create(prompt, "a", config, &mut cache).unwrap();

    let mut out = session.flush_incremental_text(&codec).unwrap();
    // "日" is three bytes
    for byte in "日x".bytes() {
        advance(&mut session, &mut cache, u32::from(byte));
        out.push_str(&session.flush_incremental_text(&codec).unwrap());
    }

    assert_eq!(out, "Q:日x");
    let cursor = session.cursor();
    assert!(cursor.prefix_offset <= cursor.read_offset);
    assert_eq!(cursor.read_offset, session.len());
}
