use std::cmp::Ordering;

use crate::error::ServiceError;

/// Temperature-scaled top-k sampler.
///
/// Only the `top_k` highest logits take part in normalization and the draw;
/// every other token has exactly zero probability. Ties are broken by the
/// lower vocabulary index and NaN logits rank below every number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopKSampler {
    temperature: f32,
    top_k: usize,
}

impl TopKSampler {
    pub fn new(temperature: f32, top_k: usize, vocab_size: usize) -> Result<Self, ServiceError> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(ServiceError::InvalidArgument(format!(
                "temperature must be a positive number, got {temperature}"
            )));
        }
        if top_k == 0 || top_k > vocab_size {
            return Err(ServiceError::InvalidArgument(format!(
                "top_k must be between 1 and {vocab_size}, got {top_k}"
            )));
        }
        Ok(Self { temperature, top_k })
    }

    /// The retained token ids with their probabilities, highest logit first.
    pub fn candidates(&self, logits: &[f32]) -> Vec<(u32, f64)> {
        if logits.is_empty() {
            return Vec::new();
        }
        let rank = |i: usize| {
            let l = logits[i];
            if l.is_nan() { f32::NEG_INFINITY } else { l }
        };
        let by_rank = |a: &usize, b: &usize| {
            rank(*b)
                .partial_cmp(&rank(*a))
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(b))
        };

        let k = self.top_k.min(logits.len());
        let mut order: Vec<usize> = (0..logits.len()).collect();
        if k < order.len() {
            order.select_nth_unstable_by(k - 1, by_rank);
            order.truncate(k);
        }
        order.sort_unstable_by(by_rank);

        let inv_temperature = 1.0 / self.temperature as f64;
        let scaled: Vec<f64> = order
            .iter()
            .map(|&i| rank(i) as f64 * inv_temperature)
            .collect();
        let max = scaled[0];

        let weights: Vec<f64> = if max.is_infinite() {
            // Either every retained logit is -inf or some are +inf: spread the
            // mass evenly over the ones equal to the maximum.
            scaled.iter().map(|&s| if s == max { 1.0 } else { 0.0 }).collect()
        } else {
            scaled.iter().map(|&s| (s - max).exp()).collect()
        };
        let total: f64 = weights.iter().sum();

        order
            .into_iter()
            .zip(weights)
            .map(|(i, w)| (i as u32, w / total))
            .collect()
    }

    /// Full-vocabulary probabilities; zero outside the retained set.
    pub fn distribution(&self, logits: &[f32]) -> Vec<f64> {
        let mut probs = vec![0.0; logits.len()];
        for (id, p) in self.candidates(logits) {
            probs[id as usize] = p;
        }
        probs
    }

    /// Draws one token. `uniform` is called at most once, and not at all when
    /// a single candidate remains.
    pub fn sample(&self, logits: &[f32], uniform: impl FnOnce() -> f64) -> Option<u32> {
        let candidates = self.candidates(logits);
        match candidates.as_slice() {
            [] => None,
            [(only, _)] => Some(*only),
            _ => Some(pick(&candidates, uniform())),
        }
    }
}

/// Inverse-CDF selection over `candidates` for `u` in `[0, 1)`.
pub fn pick(candidates: &[(u32, f64)], u: f64) -> u32 {
    let mut cumulative = 0.0;
    for &(id, p) in candidates {
        cumulative += p;
        if u < cumulative {
            return id;
        }
    }
    // Rounding left `u` past the final bucket.
    candidates
        .iter()
        .rev()
        .find(|(_, p)| *p > 0.0)
        .or(candidates.last())
        .map(|(id, _)| *id)
        .unwrap_or_default()
}
