//! Continuous batching scheduler.
//!
//! The scheduler owns one slot per session key. Each key holds at most one
//! live [`GenerationSession`]; when that session ends, the key is refilled
//! from its [`SessionSource`] on the same step, so the batch composition
//! changes at every iteration.
//!
//! ## Step Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          One step                                   │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   refill vacant keys ──► form_batch() ──► capacity check ──► forward()
//!                                 ▲                │                 │
//!                                 └── preempt ◄────┘ (no room)       │
//!                                     newest                         │
//!   recycle terminal ◄── emit deltas ◄── extend + append ◄── sample all
//! ```
//!
//! Sampling happens for every session before any history is touched, so a
//! failed forward pass or sampling error leaves all sessions unchanged.
//!
//! ## Key states
//!
//! ```text
//!   Vacant ──next_prompt()──► Active ──terminal──► Vacant
//!     │  ▲                     │  ▲
//!     │  │   no room to grow   │  │ resume()
//!     │  │                     ▼  │
//!     │  │                   Preempted
//!     │  └──── cache freed ──── Deferred ◄── cache exhausted
//!     └──── source exhausted ──► Idle
//! ```
//!
//! A preempted session keeps its history and replays it as a prefill once
//! it gets a slot again, so no text is emitted twice.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::plan::{form_batch, AdapterRun, BatchPlan, SessionDescriptor};
use super::sink::OutputSink;
use super::source::{SessionSource, WorkItem};
use crate::adapter::AdapterRegistry;
use crate::config::SchedulerConfig;
use crate::core::cache::{CachePool, CacheSlotManager, SlotHandle, SlotId};
use crate::core::kv_pool::PagedKvPool;
use crate::core::session::{FinishReason, GenerationSession, Phase};
use crate::engine::forward::{select_output_rows, ForwardBatch, ModelForward};
use crate::error::{Error, Result};
use crate::tokenizer::TextCodec;

/// State of one session key.
#[derive(Debug)]
pub enum KeyState {
    /// A session is in flight.
    Active(GenerationSession),
    /// Work is waiting for cache capacity.
    Deferred(WorkItem),
    /// A session gave up its cache slot so that older sessions could grow.
    Preempted(GenerationSession),
    /// Needs its next work item.
    Vacant,
    /// The source has no more work for this key.
    Idle,
}

impl KeyState {
    /// Whether the key still has (or may get) work.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Shared flag checked once per iteration of [`BatchScheduler::run`].
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop after the current step.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters accumulated over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Steps that ran a forward pass.
    pub steps: usize,
    /// Tokens appended across all sessions.
    pub tokens_generated: usize,
    /// Prompt rows run through prefill.
    pub prefill_rows: usize,
    pub sessions_started: usize,
    pub sessions_finished: usize,
    pub sessions_preempted: usize,
}

/// Summary of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport<K> {
    /// Sessions that ran their prompt this step.
    pub num_prefill: usize,
    /// Sessions that advanced by one token.
    pub num_decode: usize,
    /// Adapter runs of the batch, in row order.
    pub adapter_runs: Vec<AdapterRun>,
    /// Sessions that ended this step.
    pub finished: Vec<(K, FinishReason)>,
    /// Sessions that gave up their cache slot this step.
    pub preempted: Vec<K>,
}

impl<K> StepReport<K> {
    fn idle() -> Self {
        Self {
            num_prefill: 0,
            num_decode: 0,
            adapter_runs: Vec::new(),
            finished: Vec::new(),
            preempted: Vec::new(),
        }
    }

    /// True when no session was batched.
    pub fn is_empty(&self) -> bool {
        self.num_prefill + self.num_decode == 0
    }
}

/// Multi-adapter continuous batching scheduler.
pub struct BatchScheduler<S: SessionSource, P: CachePool = PagedKvPool> {
    config: SchedulerConfig,
    keys: BTreeMap<S::Key, KeyState>,
    /// Keys that are not `Idle`.
    active_count: usize,
    cache: CacheSlotManager<P>,
    adapters: AdapterRegistry,
    source: S,
    codec: Arc<dyn TextCodec>,
    stop: StopSignal,
    stats: RunStats,
    sessions_created: u64,
    /// Admission order of active sessions; the newest is preempted first.
    admitted: BTreeMap<S::Key, u64>,
    admissions: u64,
}

impl<S: SessionSource, P: CachePool> BatchScheduler<S, P> {
    /// Create a scheduler with every source key vacant.
    ///
    /// Keys are filled on the first [`step`](Self::step).
    pub fn new(
        config: SchedulerConfig,
        pool: P,
        adapters: AdapterRegistry,
        source: S,
        codec: Arc<dyn TextCodec>,
    ) -> Self {
        let keys: BTreeMap<S::Key, KeyState> = source
            .keys()
            .into_iter()
            .map(|key| (key, KeyState::Vacant))
            .collect();

        Self {
            config,
            active_count: keys.len(),
            keys,
            cache: CacheSlotManager::new(pool),
            adapters,
            source,
            codec,
            stop: StopSignal::new(),
            stats: RunStats::default(),
            sessions_created: 0,
            admitted: BTreeMap::new(),
            admissions: 0,
        }
    }

    // ========== Getters ==========

    /// Number of keys that still have (or may get) work.
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Whether every key is idle.
    pub fn is_finished(&self) -> bool {
        self.active_count == 0
    }

    /// Live session under `key`, if any.
    pub fn session(&self, key: &S::Key) -> Option<&GenerationSession> {
        match self.keys.get(key) {
            Some(KeyState::Active(session)) => Some(session),
            _ => None,
        }
    }

    pub fn key_state(&self, key: &S::Key) -> Option<&KeyState> {
        self.keys.get(key)
    }

    /// Live sessions in key order.
    pub fn sessions(&self) -> impl Iterator<Item = (&S::Key, &GenerationSession)> {
        self.keys.iter().filter_map(|(key, state)| match state {
            KeyState::Active(session) => Some((key, session)),
            _ => None,
        })
    }

    pub fn cache(&self) -> &CacheSlotManager<P> {
        &self.cache
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Handle that stops [`run`](Self::run) from another thread.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    // ========== Stepping ==========

    /// Run one batched iteration.
    ///
    /// # Errors
    ///
    /// - Refill errors are returned before any batch is formed.
    /// - [`Error::CacheExhausted`] when a lone session cannot grow by one
    ///   position, or when only deferred or preempted work remains. Larger
    ///   batches preempt their newest sessions until the rest fits.
    /// - [`Error::Backend`] when the forward pass fails; no history changes.
    /// - Errors raised while recycling finished sessions are returned after
    ///   the step completes; the first one wins.
    #[instrument(skip_all, fields(step = self.stats.steps))]
    pub fn step<M, O>(&mut self, model: &mut M, sink: &mut O) -> Result<StepReport<S::Key>>
    where
        M: ModelForward,
        O: OutputSink<S::Key>,
    {
        self.refill(sink)?;

        let mut preempted = Vec::new();
        let plan = loop {
            let plan = form_batch(self.descriptors());
            if plan.is_empty() {
                let waiting = self
                    .keys
                    .values()
                    .filter(|state| {
                        matches!(state, KeyState::Deferred(_) | KeyState::Preempted(_))
                    })
                    .count();
                if waiting > 0 {
                    return Err(Error::CacheExhausted(format!(
                        "{waiting} sessions waiting for cache with none running"
                    )));
                }
                return Ok(StepReport::idle());
            }
            if self.batch_fits(&plan)? {
                break plan;
            }
            if plan.num_sessions() < 2 {
                return Err(Error::CacheExhausted(
                    "a lone session cannot grow by one position".into(),
                ));
            }
            preempted.push(self.preempt_newest(&plan)?);
        };

        let mut input_ids = Vec::with_capacity(plan.lens.total_rows());
        let mut prefill_slots: Vec<SlotId> = Vec::with_capacity(plan.num_prefill());
        let mut decode_slots: Vec<SlotId> = Vec::with_capacity(plan.num_decode());
        for entry in &plan.entries {
            let session = active(&self.keys, &entry.key)?;
            match entry.phase {
                Phase::Prefill => {
                    input_ids.extend_from_slice(session.history());
                    prefill_slots.push(session.cache_slot().id());
                }
                Phase::Decode => {
                    input_ids.extend(session.last_token());
                    decode_slots.push(session.cache_slot().id());
                }
            }
        }

        let adapters = self.adapters.batch(&plan.adapter_runs)?;
        let batch = ForwardBatch {
            input_ids: &input_ids,
            lens: &plan.lens,
            prefill_cache: (!prefill_slots.is_empty()).then_some(prefill_slots.as_slice()),
            decode_cache: (!decode_slots.is_empty()).then_some(decode_slots.as_slice()),
            adapters: &adapters,
        };

        debug!(
            prefill = plan.num_prefill(),
            decode = plan.num_decode(),
            rows = plan.lens.total_rows(),
            runs = plan.adapter_runs.len(),
            "running batch"
        );

        let logits = model.forward(&batch).map_err(|err| match err {
            Error::Backend(_) => err,
            other => Error::Backend(other.to_string()),
        })?;
        let logits = select_output_rows(&logits, &plan.lens)?;

        let mut next_tokens = Vec::with_capacity(plan.num_sessions());
        for (row, entry) in plan.entries.iter().enumerate() {
            let row_logits = logits.get(row)?;
            let session = active_mut(&mut self.keys, &entry.key)?;
            next_tokens.push(session.select_next_token(&row_logits)?);
        }

        // Grow every slot before touching any history.
        for entry in &plan.entries {
            active_mut(&mut self.keys, &entry.key)?.extend_cache(&mut self.cache)?;
        }

        for (entry, token) in plan.entries.iter().zip(next_tokens) {
            let session = active_mut(&mut self.keys, &entry.key)?;
            session.append(token);
            let delta = session.flush_incremental_text(self.codec.as_ref())?;
            if !delta.is_empty() {
                sink.emit(&entry.key, &delta);
            }
        }

        self.stats.steps += 1;
        self.stats.tokens_generated += plan.num_sessions();
        self.stats.prefill_rows += plan.lens.doff();

        let mut finished = Vec::new();
        for entry in &plan.entries {
            if let Some(reason) = active(&self.keys, &entry.key)?.finish_reason() {
                finished.push((entry.key.clone(), reason));
            }
        }

        let mut first_error = None;
        for (key, reason) in &finished {
            if let Err(err) = self.recycle(key, *reason, sink) {
                warn!(key = ?key, error = %err, "failed to recycle session");
                first_error.get_or_insert(err);
            }
        }

        let report = StepReport {
            num_prefill: plan.num_prefill(),
            num_decode: plan.num_decode(),
            adapter_runs: plan.adapter_runs,
            finished,
            preempted,
        };

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Step until every key is idle or the stop signal is raised.
    pub fn run<M, O>(&mut self, model: &mut M, sink: &mut O) -> Result<RunStats>
    where
        M: ModelForward,
        O: OutputSink<S::Key>,
    {
        info!(keys = self.keys.len(), "starting generation loop");

        while self.active_count > 0 {
            if self.stop.is_stopped() {
                info!(active = self.active_count, "stop requested");
                break;
            }
            self.step(model, sink)?;
        }

        info!(
            steps = self.stats.steps,
            tokens = self.stats.tokens_generated,
            sessions = self.stats.sessions_finished,
            "generation loop finished"
        );
        Ok(self.stats)
    }

    /// Release every live cache slot and mark all keys idle.
    ///
    /// Returns the number of sessions dropped.
    pub fn abort_all(&mut self) -> Result<usize> {
        let mut aborted = 0;
        let mut first_error = None;

        for state in self.keys.values_mut() {
            match state {
                KeyState::Active(session) => {
                    if let Err(err) = session.release_cache(&mut self.cache) {
                        first_error.get_or_insert(err);
                    }
                    aborted += 1;
                }
                KeyState::Preempted(_) => aborted += 1,
                _ => {}
            }
            *state = KeyState::Idle;
        }
        self.active_count = 0;
        self.admitted.clear();

        if aborted > 0 {
            warn!(aborted, "aborted in-flight sessions");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(aborted),
        }
    }

    // ========== Key lifecycle ==========

    fn refill<O: OutputSink<S::Key>>(&mut self, sink: &mut O) -> Result<()> {
        let pending: Vec<S::Key> = self
            .keys
            .iter()
            .filter(|(_, state)| {
                matches!(
                    state,
                    KeyState::Vacant | KeyState::Deferred(_) | KeyState::Preempted(_)
                )
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &pending {
            self.fill(key, sink)?;
        }
        Ok(())
    }

    /// End the session under `key` and start its replacement.
    fn recycle<O: OutputSink<S::Key>>(
        &mut self,
        key: &S::Key,
        reason: FinishReason,
        sink: &mut O,
    ) -> Result<()> {
        sink.emit_end(key, reason);

        self.admitted.remove(key);
        if let Some(KeyState::Active(mut session)) = self.keys.insert(key.clone(), KeyState::Vacant)
        {
            session.release_cache(&mut self.cache)?;
            debug!(
                key = ?key,
                reason = reason.as_str(),
                generated = session.generated_tokens().len(),
                "session finished"
            );
        }
        self.stats.sessions_finished += 1;

        self.fill(key, sink)
    }

    /// Start a session for a vacant or deferred key, or resume a preempted one.
    fn fill<O: OutputSink<S::Key>>(&mut self, key: &S::Key, sink: &mut O) -> Result<()> {
        let item = match self.keys.insert(key.clone(), KeyState::Vacant) {
            Some(KeyState::Preempted(session)) => return self.resume(key, session),
            Some(KeyState::Deferred(item)) => item,
            Some(KeyState::Vacant) => match self.source.next_prompt(key)? {
                Some(item) => item,
                None => {
                    self.retire(key);
                    return Ok(());
                }
            },
            Some(state) => {
                self.keys.insert(key.clone(), state);
                return Ok(());
            }
            None => {
                self.keys.remove(key);
                return Err(Error::SessionNotFound(format!("{key:?}")));
            }
        };

        if !self.adapters.contains(&item.adapter_id) {
            self.retire(key);
            return Err(Error::AdapterNotFound(item.adapter_id));
        }

        let created = match self.config.seed {
            Some(seed) => GenerationSession::create_seeded(
                item.prompt_tokens.clone(),
                item.adapter_id.clone(),
                item.sampling.clone(),
                seed.wrapping_add(self.sessions_created),
                &mut self.cache,
            ),
            None => GenerationSession::create(
                item.prompt_tokens.clone(),
                item.adapter_id.clone(),
                item.sampling.clone(),
                &mut self.cache,
            ),
        };

        let mut session = match created {
            Ok(session) => session,
            Err(err) if err.is_retryable() => {
                debug!(key = ?key, error = %err, "deferring session until cache frees up");
                self.keys.insert(key.clone(), KeyState::Deferred(item));
                return Ok(());
            }
            Err(err) => {
                self.retire(key);
                return Err(err);
            }
        };

        self.sessions_created += 1;
        self.stats.sessions_started += 1;
        debug!(
            key = ?key,
            adapter = %item.adapter_id,
            prompt_len = session.prompt_len(),
            "session started"
        );

        if !self.config.echo_prompt {
            session.skip_prompt_text();
            self.admit(key, session);
            return Ok(());
        }

        self.admit(key, session);
        let session = active_mut(&mut self.keys, key)?;
        let prompt_text = session.flush_incremental_text(self.codec.as_ref())?;
        if !prompt_text.is_empty() {
            sink.emit(key, &prompt_text);
        }
        Ok(())
    }

    /// Give a preempted session a new cache slot, or keep it waiting.
    fn resume(&mut self, key: &S::Key, mut session: GenerationSession) -> Result<()> {
        match session.resume(&mut self.cache) {
            Ok(()) => {
                debug!(key = ?key, len = session.len(), "session resumed");
                self.admit(key, session);
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                self.keys.insert(key.clone(), KeyState::Preempted(session));
                Ok(())
            }
            Err(err) => {
                self.retire(key);
                Err(err)
            }
        }
    }

    fn admit(&mut self, key: &S::Key, session: GenerationSession) {
        self.admissions += 1;
        self.admitted.insert(key.clone(), self.admissions);
        self.keys.insert(key.clone(), KeyState::Active(session));
    }

    // ========== Batch formation ==========

    fn descriptors(&self) -> Vec<SessionDescriptor<S::Key>> {
        self.keys
            .iter()
            .filter_map(|(key, state)| match state {
                KeyState::Active(session) => Some(SessionDescriptor {
                    key: key.clone(),
                    phase: session.phase(),
                    adapter_id: session.adapter_id().to_string(),
                    num_rows: session.num_rows(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Whether every session in `plan` can grow by one position.
    fn batch_fits(&self, plan: &BatchPlan<S::Key>) -> Result<bool> {
        let mut handles: Vec<&SlotHandle> = Vec::with_capacity(plan.num_sessions());
        for entry in &plan.entries {
            handles.push(active(&self.keys, &entry.key)?.cache_slot());
        }
        Ok(self.cache.can_extend_all(handles))
    }

    /// Release the slot of the most recently admitted session in `plan`.
    fn preempt_newest(&mut self, plan: &BatchPlan<S::Key>) -> Result<S::Key> {
        let key = plan
            .entries
            .iter()
            .map(|entry| &entry.key)
            .max_by_key(|key| self.admitted.get(*key).copied().unwrap_or(0))
            .cloned()
            .ok_or_else(|| Error::CacheExhausted("no session to preempt".into()))?;

        active_mut(&mut self.keys, &key)?.preempt(&mut self.cache)?;
        if let Some(state) = self.keys.get_mut(&key) {
            if let KeyState::Active(session) = std::mem::replace(state, KeyState::Vacant) {
                *state = KeyState::Preempted(session);
            }
        }
        self.admitted.remove(&key);
        self.stats.sessions_preempted += 1;
        info!(key = ?key, live_slots = self.cache.live_slots(), "preempted session");
        Ok(key)
    }

    /// Mark `key` as exhausted.
    fn retire(&mut self, key: &S::Key) {
        if let Some(state) = self.keys.get_mut(key) {
            if state.is_live() {
                *state = KeyState::Idle;
                self.active_count -= 1;
                info!(key = ?key, remaining = self.active_count, "key exhausted");
            }
        }
    }
}

fn active<'a, K: Ord + Debug>(
    keys: &'a BTreeMap<K, KeyState>,
    key: &K,
) -> Result<&'a GenerationSession> {
    match keys.get(key) {
        Some(KeyState::Active(session)) => Ok(session),
        _ => Err(Error::SessionNotFound(format!("{key:?}"))),
    }
}

fn active_mut<'a, K: Ord + Debug>(
    keys: &'a mut BTreeMap<K, KeyState>,
    key: &K,
) -> Result<&'a mut GenerationSession> {
    match keys.get_mut(key) {
        Some(KeyState::Active(session)) => Ok(session),
        _ => Err(Error::SessionNotFound(format!("{key:?}"))),
    }
}
