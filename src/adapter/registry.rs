//! Adapter registry.
//!
//! Maps adapter ids to loaded weights. The reserved [`IDENTITY_ADAPTER`] is
//! always present: a zero-valued adapter with the rank of the most recently
//! registered one, so base-model sessions go through the same batched
//! adapter path as everyone else.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::loader::{AdapterSource, LoraWeight};
use crate::engine::forward::BatchedAdapterWeights;
use crate::error::{Error, Result};
use crate::scheduler::plan::AdapterRun;

/// Id of the zero-effect adapter used for base-model sessions.
pub const IDENTITY_ADAPTER: &str = "empty";

/// Adapter id → weights.
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    weights: BTreeMap<String, Arc<LoraWeight>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    /// Registry holding only a rank-0 identity adapter.
    pub fn new() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(IDENTITY_ADAPTER.to_string(), Arc::new(LoraWeight::empty()));
        Self { weights }
    }

    /// Load every adapter in `adapter_ids` from `source`.
    pub fn load_all<S: AdapterSource>(source: &S, adapter_ids: &[String]) -> Result<Self> {
        let mut registry = Self::new();
        for adapter_id in adapter_ids {
            let weight = source.load(adapter_id)?;
            info!(adapter = %adapter_id, rank = weight.rank(), "loaded adapter");
            registry.insert(adapter_id.clone(), weight)?;
        }
        Ok(registry)
    }

    /// Register an adapter and resize the identity adapter to match it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `adapter_id` is the reserved identity id.
    pub fn insert(&mut self, adapter_id: impl Into<String>, weight: LoraWeight) -> Result<()> {
        let adapter_id = adapter_id.into();
        if adapter_id == IDENTITY_ADAPTER {
            return Err(Error::Config(format!(
                "adapter id {IDENTITY_ADAPTER:?} is reserved"
            )));
        }

        let identity = LoraWeight::zeros_like(&weight)?;
        self.weights
            .insert(IDENTITY_ADAPTER.to_string(), Arc::new(identity));
        self.weights.insert(adapter_id, Arc::new(weight));
        Ok(())
    }

    /// Look up an adapter.
    pub fn resolve(&self, adapter_id: &str) -> Result<Arc<LoraWeight>> {
        self.weights
            .get(adapter_id)
            .cloned()
            .ok_or_else(|| Error::AdapterNotFound(adapter_id.to_string()))
    }

    /// Whether `adapter_id` is registered.
    pub fn contains(&self, adapter_id: &str) -> bool {
        self.weights.contains_key(adapter_id)
    }

    /// Registered ids, identity included, in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.weights.keys().map(String::as_str)
    }

    /// Number of registered adapters, identity included.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Never true: the identity adapter is always present.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Resolve a batch's adapter runs to weight handles.
    pub fn batch(&self, runs: &[AdapterRun]) -> Result<BatchedAdapterWeights> {
        let mut weights = Vec::with_capacity(runs.len());
        let mut run_lens = Vec::with_capacity(runs.len());
        for run in runs {
            weights.push(self.resolve(&run.adapter_id)?);
            run_lens.push(run.len);
        }
        Ok(BatchedAdapterWeights { weights, run_lens })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use super::*;

    fn lora(rank: usize) -> LoraWeight {
        let mut tensors = HashMap::new();
        tensors.insert(
            "q.A".to_string(),
            Tensor::ones((4, rank), DType::F32, &Device::Cpu).unwrap(),
        );
        LoraWeight::from_tensors(tensors).unwrap()
    }

    #[test]
    fn test_identity_always_present() {
        let registry = AdapterRegistry::new();
        assert!(registry.contains(IDENTITY_ADAPTER));
        assert_eq!(registry.resolve(IDENTITY_ADAPTER).unwrap().rank(), 0);
    }

    #[test]
    fn test_identity_tracks_registered_rank() {
        let mut registry = AdapterRegistry::new();
        registry.insert("math", lora(8)).unwrap();

        assert_eq!(registry.resolve(IDENTITY_ADAPTER).unwrap().rank(), 8);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_reserved_id_rejected() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.insert(IDENTITY_ADAPTER, lora(2)).is_err());
    }

    #[test]
    fn test_batch_resolves_runs() {
        let mut registry = AdapterRegistry::new();
        registry.insert("math", lora(4)).unwrap();

        let runs = vec![
            AdapterRun::new("empty", 2),
            AdapterRun::new("math", 1),
        ];
        let batched = registry.batch(&runs).unwrap();
        assert_eq!(batched.run_lens, vec![2, 1]);
        assert_eq!(batched.weights[1].rank(), 4);

        let missing = vec![AdapterRun::new("nope", 1)];
        assert!(matches!(
            registry.batch(&missing),
            Err(Error::AdapterNotFound(_))
        ));
    }
}
