//! Core infrastructure.
//!
//! This module contains the fundamental building blocks:
//! - CachePool and CacheSlotManager for KV slot ownership
//! - PagedKvPool, a page-table backed pool
//! - GenerationSession for per-request state

pub mod cache;
pub mod kv_pool;
pub mod session;

pub use cache::{CachePool, CacheSlotManager, SlotHandle, SlotId};
pub use kv_pool::PagedKvPool;
pub use session::{AdapterId, FinishReason, GenerationSession, Phase};
