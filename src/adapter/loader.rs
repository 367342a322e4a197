//! Adapter weight loading.
//!
//! Adapters are stored as SafeTensors files holding low-rank `A`/`B` factor
//! pairs per projection (`q.A`, `q.B`, `k.A`, ...). The rank is read from the
//! second dimension of `q.A`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Loaded low-rank adapter weights.
#[derive(Debug, Clone)]
pub struct LoraWeight {
    rank: usize,
    tensors: HashMap<String, Tensor>,
}

impl LoraWeight {
    /// Build from named tensors, inferring the rank.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] when no `*.A` factor is present.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let rank_source = tensors.get("q.A").or_else(|| {
            let mut names: Vec<&String> = tensors.keys().filter(|k| k.ends_with(".A")).collect();
            names.sort();
            names.first().and_then(|name| tensors.get(*name))
        });
        let rank = match rank_source {
            Some(a) => a.dim(1)?,
            None => {
                return Err(Error::ModelLoad(
                    "adapter has no low-rank A factor (expected e.g. \"q.A\")".into(),
                ))
            }
        };
        Ok(Self { rank, tensors })
    }

    /// A rank-0 adapter with no tensors.
    pub fn empty() -> Self {
        Self {
            rank: 0,
            tensors: HashMap::new(),
        }
    }

    /// Zero-effect adapter with the same shapes as `other`.
    pub fn zeros_like(other: &LoraWeight) -> Result<Self> {
        let tensors = other
            .tensors
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.zeros_like()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self {
            rank: other.rank,
            tensors,
        })
    }

    /// Low-rank dimension.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Factor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Number of stored tensors.
    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }
}

/// Supplies adapter weights by identifier.
pub trait AdapterSource {
    /// Load one adapter.
    fn load(&self, adapter_id: &str) -> Result<LoraWeight>;
}

/// Loads adapters from SafeTensors files.
#[derive(Debug, Clone)]
pub struct SafetensorsAdapterSource {
    paths: BTreeMap<String, PathBuf>,
    device: Device,
}

impl SafetensorsAdapterSource {
    /// Create a source mapping adapter ids to files.
    pub fn new(paths: BTreeMap<String, PathBuf>, device: Device) -> Self {
        Self { paths, device }
    }
}

impl AdapterSource for SafetensorsAdapterSource {
    fn load(&self, adapter_id: &str) -> Result<LoraWeight> {
        let path = self
            .paths
            .get(adapter_id)
            .ok_or_else(|| Error::AdapterNotFound(adapter_id.to_string()))?;
        load_lora_safetensors(path, &self.device)
    }
}

/// Read one adapter file onto `device`.
pub fn load_lora_safetensors(path: &Path, device: &Device) -> Result<LoraWeight> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        Error::ModelLoad(format!("Failed to load adapter {}: {e}", path.display()))
    })?;
    LoraWeight::from_tensors(tensors)
}
