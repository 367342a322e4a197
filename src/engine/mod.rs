//! Inference engine seams.
//!
//! This module contains:
//! - The model-forward contract and batch row layout
//! - Sampler for token sampling

pub mod forward;
pub mod sampler;

pub use forward::{BatchLenInfo, BatchedAdapterWeights, DryRunForward, ForwardBatch, ModelForward};
pub use sampler::Sampler;
