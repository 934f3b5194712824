//! Autoregressive decoding loop.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    error::ServiceError,
    model::{LanguageModel, StopReason},
    sampling::TopKSampler,
};

/// Cooperative cancellation, checked once per decoding step.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Cancels the flag when the returned guard is dropped, unless disarmed.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop(Some(self.clone()))
    }
}

pub struct CancelOnDrop(Option<CancelFlag>);

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.cancel();
        }
    }
}

/// Where sampling draws come from.
pub enum RandomSource<'a> {
    /// The process-wide generator; locked for each draw.
    Shared(&'a Mutex<StdRng>),
    /// A generator private to one request.
    Local(StdRng),
}

impl RandomSource<'_> {
    pub fn seeded(seed: u64) -> Self {
        RandomSource::Local(StdRng::seed_from_u64(seed))
    }

    fn uniform(&mut self) -> f64 {
        match self {
            RandomSource::Shared(rng) => rng.lock().r#gen(),
            RandomSource::Local(rng) => rng.r#gen(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// Prompt ids followed by the generated ids.
    pub tokens: Vec<u32>,
    pub prompt_len: usize,
    pub stop_reason: StopReason,
}

impl Generation {
    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }
}

pub struct GenerationEngine<'a> {
    model: &'a dyn LanguageModel,
    compute_lock: Option<&'a Mutex<()>>,
    eos_token_id: Option<u32>,
}

impl<'a> GenerationEngine<'a> {
    pub fn new(model: &'a dyn LanguageModel) -> Self {
        Self {
            model,
            compute_lock: None,
            eos_token_id: None,
        }
    }

    pub fn with_compute_lock(mut self, lock: Option<&'a Mutex<()>>) -> Self {
        self.compute_lock = lock;
        self
    }

    pub fn with_eos(mut self, eos_token_id: Option<u32>) -> Self {
        self.eos_token_id = eos_token_id;
        self
    }

    pub fn generate(
        &self,
        prompt_ids: &[u32],
        temperature: f32,
        max_new_tokens: usize,
        top_k: usize,
        rng: &mut RandomSource<'_>,
        cancel: &CancelFlag,
    ) -> Result<Generation, ServiceError> {
        let config = self.model.config();
        let max_seq_len = config.max_seq_len;
        let vocab_size = config.vocab_size;

        if prompt_ids.len() >= max_seq_len {
            return Err(ServiceError::PromptTooLong {
                sequence_tokens: prompt_ids.len(),
                max_seq_len,
            });
        }
        let sampler = TopKSampler::new(temperature, top_k, vocab_size)?;

        let mut tokens = prompt_ids.to_vec();
        let prompt_len = tokens.len();

        let stop_reason = loop {
            if tokens.len() - prompt_len >= max_new_tokens {
                break StopReason::MaxNewTokens;
            }
            if tokens.len() >= max_seq_len {
                break StopReason::ContextFull;
            }
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }

            let logits = self.forward(&tokens)?;
            if logits.len() != vocab_size {
                return Err(ServiceError::Inference(format!(
                    "model returned {} logits for a vocabulary of {vocab_size}",
                    logits.len()
                )));
            }

            let next = sampler
                .sample(&logits, || rng.uniform())
                .ok_or_else(|| ServiceError::Inference("no sampling candidates".into()))?;
            tokens.push(next);

            if Some(next) == self.eos_token_id {
                break StopReason::EndOfSequence;
            }
        };

        Ok(Generation {
            tokens,
            prompt_len,
            stop_reason,
        })
    }

    fn forward(&self, tokens: &[u32]) -> Result<Vec<f32>, ServiceError> {
        match self.compute_lock {
            Some(lock) => {
                let _guard = lock.lock();
                self.model.next_token_logits(tokens)
            }
            None => self.model.next_token_logits(tokens),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::model::ModelConfig;

    /// Favors `(last + 1) % vocab`, with a flat tail so sampling has choices.
    struct Counting {
        config: ModelConfig,
        calls: AtomicUsize,
        longest_input: AtomicUsize,
    }

    impl Counting {
        fn new(vocab_size: usize, max_seq_len: usize) -> Self {
            Self {
                config: ModelConfig {
                    vocab_size,
                    max_seq_len,
                    ..ModelConfig::default()
                },
                calls: AtomicUsize::new(0),
                longest_input: AtomicUsize::new(0),
            }
        }
    }

    impl LanguageModel for Counting {
        fn config(&self) -> &ModelConfig {
            &self.config
        }

        fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>, ServiceError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.longest_input
                .fetch_max(tokens.len(), std::sync::atomic::Ordering::SeqCst);
            let vocab = self.config.vocab_size;
            let favored = (*tokens.last().unwrap() as usize + 1) % vocab;
            Ok((0..vocab)
                .map(|i| if i == favored { 5.0 } else { (i % 3) as f32 })
                .collect())
        }
    }

    fn shared_rng(seed: u64) -> Mutex<StdRng> {
        Mutex::new(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn zero_new_tokens_skips_the_model() {
        let model = Counting::new(16, 32);
        let rng = shared_rng(1);
        let out = GenerationEngine::new(&model)
            .generate(&[3, 4], 1.0, 0, 4, &mut RandomSource::Shared(&rng), &CancelFlag::new())
            .unwrap();
        assert!(out.generated().is_empty());
        assert_eq!(out.stop_reason, StopReason::MaxNewTokens);
        assert_eq!(model.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn never_exceeds_max_new_tokens() {
        let model = Counting::new(16, 64);
        let rng = shared_rng(2);
        for max_new in [1, 5, 17] {
            let out = GenerationEngine::new(&model)
                .generate(&[0], 1.3, max_new, 8, &mut RandomSource::Shared(&rng), &CancelFlag::new())
                .unwrap();
            assert_eq!(out.generated().len(), max_new);
            assert_eq!(out.tokens[..1], [0]);
        }
    }

    #[test]
    fn stops_at_context_length() {
        let model = Counting::new(16, 6);
        let out = GenerationEngine::new(&model)
            .generate(&[1, 2], 1.0, 100, 1, &mut RandomSource::seeded(0), &CancelFlag::new())
            .unwrap();
        assert_eq!(out.tokens, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(out.stop_reason, StopReason::ContextFull);
        // The last forward pass sees the whole sequence, one short of the limit.
        assert_eq!(
            model.longest_input.load(std::sync::atomic::Ordering::SeqCst),
            5
        );
    }

    #[test]
    fn stops_on_end_of_sequence() {
        let model = Counting::new(16, 64);
        let out = GenerationEngine::new(&model)
            .with_eos(Some(9))
            .generate(&[6], 1.0, 50, 1, &mut RandomSource::seeded(0), &CancelFlag::new())
            .unwrap();
        assert_eq!(out.generated(), &[7, 8, 9]);
        assert_eq!(out.stop_reason, StopReason::EndOfSequence);
    }

    #[test]
    fn prompt_at_context_limit_is_rejected() {
        let model = Counting::new(16, 4);
        let err = GenerationEngine::new(&model)
            .generate(&[1, 2, 3, 4], 1.0, 10, 4, &mut RandomSource::seeded(0), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::PromptTooLong {
                sequence_tokens: 4,
                max_seq_len: 4
            }
        ));
    }

    #[test]
    fn invalid_sampling_parameters_are_rejected() {
        let model = Counting::new(16, 64);
        let engine = GenerationEngine::new(&model);
        let cancel = CancelFlag::new();
        for (temperature, top_k) in [(0.0, 4), (-1.0, 4), (1.0, 0), (1.0, 17)] {
            let err = engine
                .generate(&[1], temperature, 3, top_k, &mut RandomSource::seeded(0), &cancel)
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidArgument(_)));
        }
    }

    #[test]
    fn greedy_ignores_random_state() {
        let model = Counting::new(16, 64);
        let engine = GenerationEngine::new(&model);
        let cancel = CancelFlag::new();
        let a = engine
            .generate(&[2], 0.8, 10, 1, &mut RandomSource::seeded(1), &cancel)
            .unwrap();
        let rng = shared_rng(99);
        rng.lock().r#gen::<u64>();
        let b = engine
            .generate(&[2], 0.8, 10, 1, &mut RandomSource::Shared(&rng), &cancel)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.generated()[..3], [3, 4, 5]);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let model = Counting::new(16, 64);
        let engine = GenerationEngine::new(&model);
        let cancel = CancelFlag::new();
        let run = |seed| {
            engine
                .generate(&[0], 2.0, 20, 16, &mut RandomSource::seeded(seed), &cancel)
                .unwrap()
                .tokens
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn cancellation_stops_before_next_step() {
        let model = Counting::new(16, 64);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = GenerationEngine::new(&model)
            .generate(&[0], 1.0, 10, 4, &mut RandomSource::seeded(0), &cancel)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
        assert_eq!(model.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_guard_cancels_unless_disarmed() {
        let flag = CancelFlag::new();
        flag.drop_guard().disarm();
        assert!(!flag.is_cancelled());
        drop(flag.drop_guard());
        assert!(flag.is_cancelled());
    }

    #[test]
    fn compute_lock_is_released_between_steps() {
        let model = Counting::new(16, 64);
        let lock = Mutex::new(());
        GenerationEngine::new(&model)
            .with_compute_lock(Some(&lock))
            .generate(&[0], 1.0, 3, 2, &mut RandomSource::seeded(3), &CancelFlag::new())
            .unwrap();
        assert!(lock.try_lock().is_some());
    }
}
