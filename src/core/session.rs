//! Per-session generation state.
//!
//! A [`GenerationSession`] tracks one request from prompt to termination:
//! its token history, sampler, stop condition, incremental decode cursor and
//! the KV cache slot it exclusively owns. It knows nothing about batching.
//!
//! ## Phases
//!
//! ```text
//!   create(prompt) ──► Prefill ──append──► Decode ──append──► ... ──► terminal
//!                    len == prompt_len      len > prompt_len
//!                                             │      ▲
//!                                     preempt │      │ append
//!                                             ▼      │
//!                                   Prefill (replays whole history)
//! ```
//!
//! ## Example
//!
//! ```
//! use multi_lora::config::SamplingConfig;
//! use multi_lora::core::cache::CacheSlotManager;
//! use multi_lora::core::kv_pool::PagedKvPool;
//! use multi_lora::core::session::GenerationSession;
//!
//! let mut cache = CacheSlotManager::new(PagedKvPool::new(16, 16).unwrap());
//! let config = SamplingConfig::greedy(8, 2);
//! let mut session = GenerationSession::create(vec![1, 5, 7], "empty", config, &mut cache).unwrap();
//! assert!(session.is_prefill());
//!
//! session.extend_cache(&mut cache).unwrap();
//! session.append(42);
//! assert!(!session.is_prefill());
//! assert_eq!(session.history(), &[1, 5, 7, 42]);
//! ```

use candle_core::Tensor;
use tracing::debug;

use super::cache::{CachePool, CacheSlotManager, SlotHandle};
use crate::config::SamplingConfig;
use crate::engine::sampler::Sampler;
use crate::error::Result;
use crate::tokenizer::TextCodec;

/// Adapter identifier.
pub type AdapterId = String;

/// Prompt tokens kept in the decode window by [`GenerationSession::skip_prompt_text`].
const PROMPT_CONTEXT_TOKENS: usize = 5;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// The stop token was generated.
    Stop,
    /// The history reached `max_length`.
    Length,
}

impl FinishReason {
    /// Get the reason name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// The prompt has not been run through the model yet.
    Prefill,
    /// Advancing one token per step.
    Decode,
}

/// Offsets into the history used for incremental detokenization.
///
/// Both offsets only ever move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeCursor {
    /// Start of the window re-decoded on each flush.
    pub prefix_offset: usize,
    /// End of the text already flushed.
    pub read_offset: usize,
}

/// One text-generation session.
#[derive(Debug)]
pub struct GenerationSession {
    /// Prompt followed by generated tokens.
    history: Vec<u32>,
    /// Number of prompt tokens.
    prompt_len: usize,
    /// Adapter applied to this session.
    adapter_id: AdapterId,
    /// Validated sampling configuration.
    sampling_config: SamplingConfig,
    /// Sampler built from `sampling_config`.
    sampler: Sampler,
    /// Owned KV cache slot.
    cache_slot: SlotHandle,
    /// Incremental detokenization cursor.
    cursor: DecodeCursor,
    /// Cache was dropped by preemption; the history must be replayed.
    recompute: bool,
}

impl GenerationSession {
    /// Create a session and acquire a cache slot sized to the prompt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for an invalid sampling
    /// configuration (checked before touching the cache) and
    /// [`Error::CacheExhausted`](crate::Error::CacheExhausted) when the pool
    /// cannot hold the prompt.
    pub fn create<P: CachePool>(
        prompt_tokens: Vec<u32>,
        adapter_id: impl Into<AdapterId>,
        sampling_config: SamplingConfig,
        cache: &mut CacheSlotManager<P>,
    ) -> Result<Self> {
        let sampler = Sampler::new(&sampling_config);
        Self::create_with_sampler(prompt_tokens, adapter_id, sampling_config, sampler, cache)
    }

    /// Like [`create`](Self::create), with a seeded sampler.
    pub fn create_seeded<P: CachePool>(
        prompt_tokens: Vec<u32>,
        adapter_id: impl Into<AdapterId>,
        sampling_config: SamplingConfig,
        seed: u64,
        cache: &mut CacheSlotManager<P>,
    ) -> Result<Self> {
        let sampler = Sampler::with_seed(&sampling_config, seed);
        Self::create_with_sampler(prompt_tokens, adapter_id, sampling_config, sampler, cache)
    }

    fn create_with_sampler<P: CachePool>(
        prompt_tokens: Vec<u32>,
        adapter_id: impl Into<AdapterId>,
        sampling_config: SamplingConfig,
        sampler: Sampler,
        cache: &mut CacheSlotManager<P>,
    ) -> Result<Self> {
        sampling_config.validate(prompt_tokens.len())?;
        let cache_slot = cache.acquire(prompt_tokens.len())?;
        let adapter_id = adapter_id.into();

        debug!(
            adapter = %adapter_id,
            prompt_len = prompt_tokens.len(),
            slot = cache_slot.id(),
            "created generation session"
        );

        Ok(Self {
            prompt_len: prompt_tokens.len(),
            history: prompt_tokens,
            adapter_id,
            sampling_config,
            sampler,
            cache_slot,
            cursor: DecodeCursor::default(),
            recompute: false,
        })
    }

    // ========== Getters ==========

    /// Prompt followed by generated tokens.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    /// Tokens generated so far.
    pub fn generated_tokens(&self) -> &[u32] {
        &self.history[self.prompt_len..]
    }

    /// Number of prompt tokens.
    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Length of the history.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Always false: a session holds at least its prompt.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Last token of the history.
    pub fn last_token(&self) -> Option<u32> {
        self.history.last().copied()
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn sampling_config(&self) -> &SamplingConfig {
        &self.sampling_config
    }

    pub fn cursor(&self) -> DecodeCursor {
        self.cursor
    }

    /// Owned cache slot.
    pub fn cache_slot(&self) -> &SlotHandle {
        &self.cache_slot
    }

    /// Reserved length of the cache slot.
    pub fn cache_len(&self) -> usize {
        self.cache_slot.len()
    }

    // ========== Phase & termination ==========

    /// True while no token has been generated yet.
    pub fn is_prefill(&self) -> bool {
        self.history.len() == self.prompt_len
    }

    /// Whether the cache slot was given up by [`preempt`](Self::preempt).
    pub fn is_preempted(&self) -> bool {
        self.recompute
    }

    pub fn phase(&self) -> Phase {
        if self.is_prefill() || self.recompute {
            Phase::Prefill
        } else {
            Phase::Decode
        }
    }

    /// Rows this session contributes to the next batch.
    pub fn num_rows(&self) -> usize {
        match self.phase() {
            Phase::Prefill => self.history.len(),
            Phase::Decode => 1,
        }
    }

    /// Whether generation is over.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason().is_some()
    }

    /// Which stop condition holds, if any. The stop token takes precedence.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        if self.history.len() > self.prompt_len
            && self.last_token() == Some(self.sampling_config.stop_token_id)
        {
            Some(FinishReason::Stop)
        } else if self.history.len() >= self.sampling_config.max_length {
            Some(FinishReason::Length)
        } else {
            None
        }
    }

    // ========== Token operations ==========

    /// Choose the next token from this session's logits row.
    ///
    /// Does not touch the history.
    pub fn select_next_token(&mut self, logits: &Tensor) -> Result<u32> {
        self.sampler.sample(logits, &self.history)
    }

    /// Append a generated token.
    ///
    /// The caller must have extended the cache slot by one position first
    /// (see [`extend_cache`](Self::extend_cache)).
    pub fn append(&mut self, token_id: u32) {
        self.history.push(token_id);
        self.recompute = false;
    }

    /// Reserve the cache position for the next appended token.
    pub fn extend_cache<P: CachePool>(&mut self, cache: &mut CacheSlotManager<P>) -> Result<()> {
        cache.extend_by_one(&mut self.cache_slot)
    }

    /// Return the cache slot to the pool.
    pub fn release_cache<P: CachePool>(&mut self, cache: &mut CacheSlotManager<P>) -> Result<()> {
        cache.release(&mut self.cache_slot)
    }

    /// Give the cache slot back while keeping history, sampler and cursor.
    ///
    /// The session runs as a prefill over its whole history once
    /// [`resume`](Self::resume) has found it a new slot.
    pub fn preempt<P: CachePool>(&mut self, cache: &mut CacheSlotManager<P>) -> Result<()> {
        cache.release(&mut self.cache_slot)?;
        self.recompute = true;
        Ok(())
    }

    /// Acquire a fresh slot sized to the history of a preempted session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheExhausted`](crate::Error::CacheExhausted) when
    /// the pool cannot hold the history; the session stays preempted.
    pub fn resume<P: CachePool>(&mut self, cache: &mut CacheSlotManager<P>) -> Result<()> {
        if !self.cache_slot.is_released() {
            return Ok(());
        }
        self.cache_slot = cache.acquire(self.history.len())?;
        debug!(
            len = self.history.len(),
            slot = self.cache_slot.id(),
            "resumed preempted session"
        );
        Ok(())
    }

    /// Mark the prompt as already flushed so only generated text is emitted.
    ///
    /// A few prompt tokens stay in the decode window so that the first
    /// generated token is detokenized in context.
    pub fn skip_prompt_text(&mut self) {
        if self.cursor.read_offset < self.prompt_len {
            self.cursor = DecodeCursor {
                prefix_offset: self.prompt_len.saturating_sub(PROMPT_CONTEXT_TOKENS),
                read_offset: self.prompt_len,
            };
        }
    }

    /// Newly finalized text since the last flush.
    ///
    /// Text whose decode ends in U+FFFD (an incomplete multi-token character)
    /// is held back until a later token completes it.
    pub fn flush_incremental_text(&mut self, codec: &dyn TextCodec) -> Result<String> {
        let DecodeCursor {
            prefix_offset,
            read_offset,
        } = self.cursor;

        let prefix_text = codec.decode(&self.history[prefix_offset..read_offset], true)?;
        let new_text = codec.decode(&self.history[prefix_offset..], true)?;

        let prefix_chars = prefix_text.chars().count();
        if new_text.chars().count() > prefix_chars && !new_text.ends_with('\u{FFFD}') {
            let delta: String = new_text.chars().skip(prefix_chars).collect();
            self.cursor = DecodeCursor {
                prefix_offset: read_offset,
                read_offset: self.history.len(),
            };
            Ok(delta)
        } else {
            Ok(String::new())
        }
    }
}
