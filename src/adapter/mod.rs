//! Low-rank adapters.
//!
//! This module contains:
//! - LoraWeight and SafeTensors loading
//! - AdapterRegistry with the reserved identity adapter

pub mod loader;
pub mod registry;

pub use loader::{AdapterSource, LoraWeight, SafetensorsAdapterSource};
pub use registry::{AdapterRegistry, IDENTITY_ADAPTER};
