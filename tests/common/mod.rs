#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use baby_llama_service::{
    CompletionService, LanguageModel, ModelConfig, ServiceError, ServingState, StateOptions,
    TokenizerAdapter, model::GenerationDefaults,
};

pub const VOCAB: usize = 40;
/// Ids `0..FIRST_WORD` are `<unk>`, `<s>`, `</s>` and `你好`.
pub const FIRST_WORD: usize = 4;

pub fn fixture_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/tokenizer.json"))
}

pub fn tokenizer() -> TokenizerAdapter {
    TokenizerAdapter::from_file(fixture_path()).unwrap()
}

/// Deterministic stand-in for the transformer.
///
/// Strongly prefers a word picked from the last id, keeps a flat tail of
/// plain words, and pushes the special tokens and `你好` out of reach.
pub struct Scripted {
    config: ModelConfig,
    step_delay: Option<Duration>,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    /// Most forward passes ever observed running at once.
    pub peak_in_flight: AtomicUsize,
}

impl Scripted {
    pub fn new(max_seq_len: usize) -> Self {
        Self {
            config: ModelConfig {
                vocab_size: VOCAB,
                max_seq_len,
                dim: 8,
                n_layers: 1,
                n_heads: 2,
                n_kv_heads: 2,
                ..ModelConfig::default()
            },
            step_delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }
}

impl LanguageModel for Scripted {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.step_delay {
            thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let last = tokens.last().copied().unwrap_or(0) as usize;
        let favored = FIRST_WORD + (last * 7 + 3) % (VOCAB - FIRST_WORD);
        Ok((0..VOCAB)
            .map(|id| {
                if id < FIRST_WORD {
                    -1e4
                } else if id == favored {
                    4.0
                } else {
                    0.0
                }
            })
            .collect())
    }
}

pub fn state_with(model: Scripted) -> Arc<ServingState> {
    shared_state(Arc::new(model), StateOptions::default())
}

/// Builds a state around a model the caller keeps a handle to.
pub fn shared_state(model: Arc<Scripted>, options: StateOptions) -> Arc<ServingState> {
    Arc::new(ServingState::from_parts(model, tokenizer(), options).unwrap())
}

pub fn service_with(model: Scripted, workers: usize) -> CompletionService {
    CompletionService::new(state_with(model), GenerationDefaults::default(), workers)
}

pub fn service() -> CompletionService {
    service_with(Scripted::new(512), 1)
}
