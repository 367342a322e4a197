//! multi-lora: continuous batching for many LoRA adapters over one base model.
//!
//! This crate implements the serving loop of a multi-tenant LoRA server:
//! - Per-session generation state with incremental detokenization
//! - Batches grouped by phase and adapter, refilled every step
//! - A paged KV pool with exclusively owned slots
//! - An adapter registry with a reserved identity adapter

pub mod config;
pub mod error;

pub mod adapter;
pub mod core;
pub mod engine;
pub mod scheduler;
pub mod tokenizer;

pub use adapter::{AdapterRegistry, AdapterSource, LoraWeight, SafetensorsAdapterSource};
pub use config::{CacheConfig, LoraSpec, SamplingConfig, SchedulerConfig, ServeConfig};
pub use crate::core::{CacheSlotManager, FinishReason, GenerationSession, PagedKvPool};
pub use engine::{DryRunForward, ModelForward, Sampler};
pub use error::{Error, Result};
pub use scheduler::{BatchScheduler, OutputSink, SessionSource, TenantPromptSource};
pub use tokenizer::{load_tokenizer, TextCodec};
