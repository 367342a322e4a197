//! Batch formation.
//!
//! Pure functions over lightweight session descriptors: nothing here touches
//! live sessions, so forming a batch has no side effects.
//!
//! Sessions are stably sorted by `(phase, adapter_id)`: prefill before decode,
//! and within each phase one contiguous run per adapter. Adapter runs are then
//! built over the combined order, so an adapter present in both phases forms
//! one run per phase, or a single run when it is the last prefill adapter and
//! the first decode adapter.

use crate::core::session::{AdapterId, Phase};
use crate::engine::forward::BatchLenInfo;

/// What the planner needs to know about one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor<K> {
    pub key: K,
    pub phase: Phase,
    pub adapter_id: AdapterId,
    /// Prompt length in prefill, 1 in decode.
    pub num_rows: usize,
}

/// A maximal run of consecutive sessions sharing an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterRun {
    pub adapter_id: AdapterId,
    /// Number of sessions in the run.
    pub len: usize,
}

impl AdapterRun {
    pub fn new(adapter_id: impl Into<AdapterId>, len: usize) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            len,
        }
    }
}

/// Ordered batch layout for one step.
#[derive(Debug, Clone)]
pub struct BatchPlan<K> {
    /// Sessions in batch row order.
    pub entries: Vec<SessionDescriptor<K>>,
    /// Adapter runs over `entries`.
    pub adapter_runs: Vec<AdapterRun>,
    /// Row layout handed to the backend.
    pub lens: BatchLenInfo,
}

impl<K> BatchPlan<K> {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_sessions(&self) -> usize {
        self.entries.len()
    }

    pub fn num_prefill(&self) -> usize {
        self.lens.prefill_lens().len()
    }

    pub fn num_decode(&self) -> usize {
        self.lens.decode_count()
    }

    /// Keys in batch order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|entry| &entry.key)
    }
}

/// Order sessions and derive adapter runs and row layout.
pub fn form_batch<K>(mut descriptors: Vec<SessionDescriptor<K>>) -> BatchPlan<K> {
    descriptors.sort_by(|a, b| (a.phase, &a.adapter_id).cmp(&(b.phase, &b.adapter_id)));

    let mut adapter_runs: Vec<AdapterRun> = Vec::new();
    let mut prefill_lens = Vec::new();
    let mut decode_count = 0;

    for desc in &descriptors {
        match desc.phase {
            Phase::Prefill => prefill_lens.push(desc.num_rows),
            Phase::Decode => decode_count += 1,
        }

        match adapter_runs.last_mut() {
            Some(run) if run.adapter_id == desc.adapter_id => run.len += 1,
            _ => adapter_runs.push(AdapterRun::new(desc.adapter_id.clone(), 1)),
        }
    }

    BatchPlan {
        entries: descriptors,
        adapter_runs,
        lens: BatchLenInfo::new(prefill_lens, decode_count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(key: u32, phase: Phase, adapter: &str, rows: usize) -> SessionDescriptor<u32> {
        SessionDescriptor {
            key,
            phase,
            adapter_id: adapter.to_string(),
            num_rows: rows,
        }
    }

    #[test]
    fn test_prefill_first_then_adapter() {
        let plan = form_batch(vec![
            desc(0, Phase::Decode, "b", 1),
            desc(1, Phase::Prefill, "b", 4),
            desc(2, Phase::Decode, "a", 1),
            desc(3, Phase::Prefill, "a", 2),
        ]);

        let keys: Vec<u32> = plan.keys().copied().collect();
        assert_eq!(keys, vec![3, 1, 2, 0]);
        assert_eq!(plan.lens.prefill_lens(), &[2, 4]);
        assert_eq!(plan.lens.decode_count(), 2);
        assert_eq!(
            plan.adapter_runs,
            vec![
                AdapterRun::new("a", 1),
                AdapterRun::new("b", 1),
                AdapterRun::new("a", 1),
                AdapterRun::new("b", 1),
            ]
        );
    }

    #[test]
    fn test_sort_is_stable_within_run() {
        let plan = form_batch(vec![
            desc(7, Phase::Decode, "a", 1),
            desc(3, Phase::Decode, "a", 1),
            desc(5, Phase::Decode, "a", 1),
        ]);

        let keys: Vec<u32> = plan.keys().copied().collect();
        assert_eq!(keys, vec![7, 3, 5]);
        assert_eq!(plan.adapter_runs, vec![AdapterRun::new("a", 3)]);
    }

    #[test]
    fn test_empty_batch() {
        let plan = form_batch::<u32>(vec![]);
        assert!(plan.is_empty());
        assert!(plan.adapter_runs.is_empty());
        assert_eq!(plan.lens.total_rows(), 0);
    }
}
