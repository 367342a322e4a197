//! Work sources for session keys.
//!
//! A session key names a logical slot that survives session replacement.
//! Whenever a key's session ends, the scheduler pulls the key's next work
//! item from a [`SessionSource`]; `None` means the key is exhausted.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::adapter::IDENTITY_ADAPTER;
use crate::config::{LoraSpec, SamplingConfig};
use crate::core::session::AdapterId;
use crate::error::Result;
use crate::tokenizer::TextCodec;

/// Everything needed to start one session.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub prompt_tokens: Vec<u32>,
    pub adapter_id: AdapterId,
    pub sampling: SamplingConfig,
}

/// Pull-based supplier of work per key.
pub trait SessionSource {
    /// Identity of a logical session slot.
    type Key: Clone + Ord + fmt::Debug;

    /// Keys to serve, in the order they are first filled.
    fn keys(&self) -> Vec<Self::Key>;

    /// Next work item for `key`, or `None` once the key is exhausted.
    fn next_prompt(&mut self, key: &Self::Key) -> Result<Option<WorkItem>>;
}

/// Whether a tenant's queue runs with its adapter or against the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Lora,
    Base,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lora => "lora",
            Self::Base => "base",
        }
    }
}

/// `(tenant, role)` session key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    pub tenant: String,
    pub role: Role,
}

impl SessionKey {
    pub fn new(tenant: impl Into<String>, role: Role) -> Self {
        Self {
            tenant: tenant.into(),
            role,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.tenant, self.role.as_str())
    }
}

#[derive(Debug)]
struct PromptQueue {
    adapter_id: AdapterId,
    prompts: VecDeque<String>,
    served: usize,
}

/// Ordered prompt queues, one per `(tenant, role)`.
///
/// Prompts are tokenized when they are pulled, not up front.
pub struct TenantPromptSource {
    queues: BTreeMap<SessionKey, PromptQueue>,
    codec: Arc<dyn TextCodec>,
    sampling: SamplingConfig,
}

impl TenantPromptSource {
    /// Empty source; every session uses `sampling`.
    pub fn new(codec: Arc<dyn TextCodec>, sampling: SamplingConfig) -> Self {
        Self {
            queues: BTreeMap::new(),
            codec,
            sampling,
        }
    }

    /// One lora queue and one base queue per configured adapter.
    pub fn from_specs(
        specs: &BTreeMap<String, LoraSpec>,
        codec: Arc<dyn TextCodec>,
        sampling: SamplingConfig,
    ) -> Self {
        let mut source = Self::new(codec, sampling);
        for (tenant, spec) in specs {
            source.add_queue(
                SessionKey::new(tenant.clone(), Role::Lora),
                tenant.clone(),
                spec.lora_prompts.iter().cloned(),
            );
            source.add_queue(
                SessionKey::new(tenant.clone(), Role::Base),
                IDENTITY_ADAPTER,
                spec.base_prompts.iter().cloned(),
            );
        }
        source
    }

    /// Add (or replace) the queue for `key`.
    pub fn add_queue(
        &mut self,
        key: SessionKey,
        adapter_id: impl Into<AdapterId>,
        prompts: impl IntoIterator<Item = String>,
    ) {
        self.queues.insert(
            key,
            PromptQueue {
                adapter_id: adapter_id.into(),
                prompts: prompts.into_iter().collect(),
                served: 0,
            },
        );
    }

    /// Prompts already handed out for `key`.
    pub fn served(&self, key: &SessionKey) -> usize {
        self.queues.get(key).map_or(0, |queue| queue.served)
    }

    /// Prompts still queued for `key`.
    pub fn remaining(&self, key: &SessionKey) -> usize {
        self.queues.get(key).map_or(0, |queue| queue.prompts.len())
    }
}

impl SessionSource for TenantPromptSource {
    type Key = SessionKey;

    fn keys(&self) -> Vec<SessionKey> {
        self.queues.keys().cloned().collect()
    }

    fn next_prompt(&mut self, key: &SessionKey) -> Result<Option<WorkItem>> {
        let Some(queue) = self.queues.get_mut(key) else {
            return Ok(None);
        };
        let Some(prompt) = queue.prompts.front() else {
            return Ok(None);
        };

        let prompt_tokens = self.codec.encode(prompt)?;
        queue.prompts.pop_front();
        queue.served += 1;

        Ok(Some(WorkItem {
            prompt_tokens,
            adapter_id: queue.adapter_id.clone(),
            sampling: self.sampling.clone(),
        }))
    }
}
