//! Token sampling.
//!
//! Turns one row of logits into the next token id. The processing order is
//! fixed:
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Repetition penalty (over the full history)
//!     │
//!     ▼ Temperature scaling
//!     │
//!     ▼ Top-p filtering
//!     │
//!     ▼ Top-k filtering
//!     │
//!     ▼ Softmax + sample   (arg-max when greedy or degenerate)
//! Selected token
//! ```
//!
//! Filtered entries are set to `-inf`, so every stage keeps working in
//! vocabulary coordinates and the selected index is the token id.

use std::collections::HashSet;

use candle_core::{DType, Device, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Token sampler configured from a [`SamplingConfig`].
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for scaling logits (<= 0 means greedy).
    temperature: f32,
    /// Repetition penalty (1.0 = disabled).
    repetition_penalty: f32,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    /// Top-k value.
    top_k: Option<usize>,
    /// Random number generator.
    rng: StdRng,
}

impl Sampler {
    /// Creates a new sampler seeded from the OS.
    pub fn new(config: &SamplingConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &SamplingConfig, rng: StdRng) -> Self {
        Self {
            temperature: config.temperature,
            repetition_penalty: config.repetition_penalty,
            top_p: config.top_p,
            top_k: config.top_k(),
            rng,
        }
    }

    /// Whether this sampler always takes the arg-max.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Select the next token from one logits row.
    ///
    /// `logits` may be `[vocab]` or `[1, vocab]`, in any float dtype.
    /// `history` is the session's full token history (prompt included).
    pub fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<u32> {
        let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
        let mut logits: Vec<f32> = logits.to_vec1()?;
        if logits.is_empty() {
            return Err(Error::Backend("empty logits row".into()));
        }

        self.process(&mut logits, history)?;

        if self.is_greedy() {
            return Ok(argmax(&logits));
        }

        let probs = softmax(&logits)?;
        self.sample_from_probs(&probs, &logits)
    }

    /// Apply penalty, temperature, top-p and top-k in place.
    fn process(&self, logits: &mut [f32], history: &[u32]) -> Result<()> {
        if self.repetition_penalty != 1.0 {
            apply_repetition_penalty(logits, history, self.repetition_penalty);
        }

        if self.temperature > 0.0 && self.temperature != 1.0 {
            for logit in logits.iter_mut() {
                *logit /= self.temperature;
            }
        }

        if self.top_p < 1.0 {
            apply_top_p(logits, self.top_p)?;
        }

        if let Some(k) = self.top_k {
            apply_top_k(logits, k);
        }

        Ok(())
    }

    /// Draw from the distribution, falling back to arg-max when it is degenerate.
    fn sample_from_probs(&mut self, probs: &[f32], logits: &[f32]) -> Result<u32> {
        let degenerate = probs.iter().any(|p| !p.is_finite()) || probs.iter().sum::<f32>() <= 0.0;
        if degenerate {
            return Ok(argmax(logits));
        }

        match WeightedIndex::new(probs.iter().map(|&p| p as f64)) {
            Ok(dist) => Ok(dist.sample(&mut self.rng) as u32),
            Err(_) => Ok(argmax(logits)),
        }
    }
}

/// Penalize every token that appears in `history`, once per distinct token.
///
/// Positive logits are divided by the penalty, negative ones multiplied, so a
/// penalty above 1 always makes a repeated token less likely.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    let seen: HashSet<u32> = history.iter().copied().collect();
    for token in seen {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit < 0.0 {
                *logit *= penalty;
            } else {
                *logit /= penalty;
            }
        }
    }
}

/// Keep the smallest set of highest-probability tokens whose mass reaches `p`.
///
/// The most likely token always survives.
pub fn apply_top_p(logits: &mut [f32], p: f32) -> Result<()> {
    let probs = softmax(logits)?;
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    for (rank, &idx) in order.iter().enumerate() {
        if rank > 0 && cumulative >= p {
            logits[idx] = f32::NEG_INFINITY;
        }
        cumulative += probs[idx];
    }
    Ok(())
}

/// Keep the `k` highest logits (ties at the threshold survive).
pub fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }

    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];

    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (idx, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = idx;
        }
    }
    best as u32
}

fn softmax(logits: &[f32]) -> Result<Vec<f32>> {
    let tensor = Tensor::from_slice(logits, logits.len(), &Device::Cpu)?;
    let probs = candle_nn::ops::softmax_last_dim(&tensor)?;
    Ok(probs.to_vec1()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SamplingConfig {
        SamplingConfig {
            temperature: 1.0,
            repetition_penalty: 1.0,
            top_p: 1.0,
            top_k: -1,
            max_length: 100,
            stop_token_id: 0,
        }
    }

    fn row(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_greedy_sampling() {
        let config = SamplingConfig {
            temperature: 0.0,
            ..config()
        };
        let mut sampler = Sampler::with_seed(&config, 42);

        let logits = row(&[0.1, 0.2, 0.3, 10.0, 0.4]);
        assert_eq!(sampler.sample(&logits, &[]).unwrap(), 3);
    }

    #[test]
    fn test_top_k_sampling() {
        let config = SamplingConfig {
            top_k: 2,
            ..config()
        };
        let mut sampler = Sampler::with_seed(&config, 42);
        let logits = row(&[0.1, 0.2, 0.3, 10.0, 9.0]);

        for _ in 0..50 {
            let token = sampler.sample(&logits, &[]).unwrap();
            assert!(token == 3 || token == 4);
        }
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        let config = SamplingConfig {
            top_p: 0.5,
            ..config()
        };
        let mut sampler = Sampler::with_seed(&config, 42);
        let logits = row(&[0.0, 0.0, 0.0, 10.0, 0.0]);

        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits, &[]).unwrap(), 3);
        }
    }

    #[test]
    fn test_repetition_penalty_applied_once_per_token() {
        let mut logits = vec![2.0, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 0, 1], 2.0);

        assert_eq!(logits, vec![1.0, -4.0, 1.0]);
    }

    #[test]
    fn test_repetition_penalty_changes_greedy_choice() {
        let config = SamplingConfig {
            temperature: 0.0,
            repetition_penalty: 4.0,
            ..config()
        };
        let mut sampler = Sampler::with_seed(&config, 0);
        let logits = row(&[3.0, 2.0]);

        assert_eq!(sampler.sample(&logits, &[]).unwrap(), 0);
        assert_eq!(sampler.sample(&logits, &[0]).unwrap(), 1);
    }

    #[test]
    fn test_degenerate_distribution_falls_back_to_argmax() {
        let mut sampler = Sampler::with_seed(&config(), 7);
        let logits = row(&[f32::NEG_INFINITY, f32::NEG_INFINITY]);

        assert_eq!(sampler.sample(&logits, &[]).unwrap(), 0);
    }

    #[test]
    fn test_argmax_ties_pick_lowest_id() {
        assert_eq!(argmax(&[1.0, 5.0, 5.0]), 1);
    }

    #[test]
    fn test_reproducibility_with_seed() {
        let logits = row(&[1.0, 1.0, 1.0, 1.0, 1.0]);
        let mut sampler1 = Sampler::with_seed(&config(), 12345);
        let mut sampler2 = Sampler::with_seed(&config(), 12345);

        let tokens1: Vec<u32> = (0..10).map(|_| sampler1.sample(&logits, &[]).unwrap()).collect();
        let tokens2: Vec<u32> = (0..10).map(|_| sampler2.sample(&logits, &[]).unwrap()).collect();

        assert_eq!(tokens1, tokens2, "Same seed should produce same sequence");
    }
}
