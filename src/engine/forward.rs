//! Model-forward contract.
//!
//! The scheduler hands one [`ForwardBatch`] per step to a [`ModelForward`]
//! backend. Rows are laid out prefill-first:
//!
//! ```text
//!   input_ids: [ p0 p0 p0 p0 p0 | p1 p1 p1 | d0 | d1 | d2 ]
//!   indptr:    [ 0,             5,         8 ]
//!   doff:      8
//!   outputs:   [ last(p0), last(p1), d0, d1, d2 ]
//! ```
//!
//! A backend may return either one row per output (the final position of each
//! prefill segment followed by the decode rows) or one row per input token;
//! [`select_output_rows`] reduces the latter to the former.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::adapter::LoraWeight;
use crate::core::cache::SlotId;
use crate::error::{Error, Result};

/// Row-length metadata of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLenInfo {
    prefill_lens: Vec<usize>,
    decode_count: usize,
    indptr: Vec<usize>,
}

impl BatchLenInfo {
    /// Build from per-session prefill lengths and the number of decode rows.
    pub fn new(prefill_lens: Vec<usize>, decode_count: usize) -> Self {
        let mut indptr = Vec::with_capacity(prefill_lens.len() + 1);
        indptr.push(0);
        for len in &prefill_lens {
            let last = indptr[indptr.len() - 1];
            indptr.push(last + len);
        }
        Self {
            prefill_lens,
            decode_count,
            indptr,
        }
    }

    /// Prompt length of each prefill segment.
    pub fn prefill_lens(&self) -> &[usize] {
        &self.prefill_lens
    }

    /// Number of decode rows.
    pub fn decode_count(&self) -> usize {
        self.decode_count
    }

    /// Segment start offsets, with a trailing end offset.
    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    /// Offset of the first decode row.
    pub fn doff(&self) -> usize {
        self.indptr[self.indptr.len() - 1]
    }

    /// Total input rows.
    pub fn total_rows(&self) -> usize {
        self.doff() + self.decode_count
    }

    /// Output rows expected: one per prefill segment plus one per decode row.
    pub fn num_outputs(&self) -> usize {
        self.prefill_lens.len() + self.decode_count
    }

    /// Input row indices whose logits are kept.
    pub fn output_positions(&self) -> Vec<u32> {
        let prefill_last = self.indptr[1..].iter().map(|&end| (end - 1) as u32);
        let decode = (self.doff()..self.total_rows()).map(|row| row as u32);
        prefill_last.chain(decode).collect()
    }
}

/// Adapter weights grouped by contiguous run.
#[derive(Debug, Clone, Default)]
pub struct BatchedAdapterWeights {
    /// One weight handle per run.
    pub weights: Vec<Arc<LoraWeight>>,
    /// Sessions covered by each run.
    pub run_lens: Vec<usize>,
}

/// Everything a backend needs for one step.
#[derive(Debug)]
pub struct ForwardBatch<'a> {
    /// Concatenated input token ids.
    pub input_ids: &'a [u32],
    /// Prefill/decode row layout.
    pub lens: &'a BatchLenInfo,
    /// Cache slots of prefill sessions, `None` when there are none.
    pub prefill_cache: Option<&'a [SlotId]>,
    /// Cache slots of decode sessions, `None` when there are none.
    pub decode_cache: Option<&'a [SlotId]>,
    /// Adapter weights per run.
    pub adapters: &'a BatchedAdapterWeights,
}

impl ForwardBatch<'_> {
    /// Input ids as a `[total_rows]` tensor.
    pub fn input_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(self.input_ids, self.input_ids.len(), device)?)
    }
}

/// A model backend. Invoked synchronously once per step.
pub trait ModelForward {
    /// Run the batched forward pass and return logits `[rows, vocab]`.
    fn forward(&mut self, batch: &ForwardBatch<'_>) -> Result<Tensor>;
}

/// Reduce backend logits to one row per output position.
///
/// # Errors
///
/// Returns [`Error::Backend`] if the row count matches neither layout.
pub fn select_output_rows(logits: &Tensor, lens: &BatchLenInfo) -> Result<Tensor> {
    let (rows, _vocab) = logits.dims2()?;
    if rows == lens.num_outputs() {
        return Ok(logits.clone());
    }
    if rows == lens.total_rows() {
        let positions = lens.output_positions();
        let index = Tensor::from_vec(positions, lens.num_outputs(), logits.device())?;
        return Ok(logits.index_select(&index, 0)?);
    }
    Err(Error::Backend(format!(
        "backend returned {rows} logits rows, expected {} or {}",
        lens.num_outputs(),
        lens.total_rows()
    )))
}

/// Backend producing random logits, for exercising the scheduler without a model.
#[derive(Debug)]
pub struct DryRunForward {
    vocab_size: usize,
    device: Device,
    rng: StdRng,
}

impl DryRunForward {
    /// Create a dry-run backend over `vocab_size` tokens.
    pub fn new(vocab_size: usize, seed: u64) -> Self {
        Self {
            vocab_size,
            device: Device::Cpu,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ModelForward for DryRunForward {
    fn forward(&mut self, batch: &ForwardBatch<'_>) -> Result<Tensor> {
        let rows = batch.lens.num_outputs();
        let values: Vec<f32> = (0..rows * self.vocab_size)
            .map(|_| self.rng.gen_range(-4.0f32..4.0))
            .collect();
        Ok(Tensor::from_vec(values, (rows, self.vocab_size), &self.device)?)
    }
}
