use std::sync::Arc;

use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, info, warn};

use crate::{
    engine::{CancelFlag, GenerationEngine, RandomSource},
    error::ServiceError,
    model::{GenerationParams, GenerationResult, LanguageModel, LoadReport, ModelConfig},
    tokenizer::TokenizerAdapter,
};

#[cfg(feature = "tch-backend")]
use crate::{config::AppConfig, model::checkpoint};

/// Options that shape a [`ServingState`] independent of how the model was
/// obtained.
#[derive(Debug, Clone)]
pub struct StateOptions {
    pub seed: u64,
    pub bos_token: String,
    pub eos_token: String,
    pub serialize_compute: bool,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            seed: 1337,
            bos_token: "<s>".to_string(),
            eos_token: "</s>".to_string(),
            serialize_compute: false,
        }
    }
}

/// The loaded model and everything a request needs to run against it.
///
/// Built once at startup and shared behind an `Arc`. Only the random
/// generator changes after construction.
pub struct ServingState {
    model: Arc<dyn LanguageModel>,
    tokenizer: TokenizerAdapter,
    bos_token_id: u32,
    eos_token_id: Option<u32>,
    rng: Mutex<StdRng>,
    compute_lock: Option<Mutex<()>>,
    load_report: LoadReport,
}

impl ServingState {
    #[cfg(feature = "tch-backend")]
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let tokenizer = TokenizerAdapter::from_file(&config.tokenizer_path)?;
        info!(path = %config.tokenizer_path.display(), vocab = tokenizer.vocab_size(), "tokenizer loaded");

        let (model, report) =
            checkpoint::load(&config.checkpoint_path, &config.model, config.device)?;
        info!(path = %config.checkpoint_path.display(), device = %model.device(), "checkpoint loaded");

        let options = StateOptions {
            seed: config.seed,
            bos_token: config.bos_token.clone(),
            eos_token: config.eos_token.clone(),
            serialize_compute: config.serialize_compute,
        };
        Ok(Self::from_parts(Arc::new(model), tokenizer, options)?.with_load_report(report))
    }

    pub fn from_parts(
        model: Arc<dyn LanguageModel>,
        tokenizer: TokenizerAdapter,
        options: StateOptions,
    ) -> Result<Self, ServiceError> {
        let bos_token_id = tokenizer.special_token(&options.bos_token)?;
        let eos_token_id = tokenizer.special_token(&options.eos_token).ok();
        if eos_token_id.is_none() {
            warn!(token = %options.eos_token, "no end-of-sequence token; generation stops on length only");
        }

        let model_vocab = model.config().vocab_size;
        if tokenizer.vocab_size() > model_vocab {
            warn!(
                tokenizer = tokenizer.vocab_size(),
                model = model_vocab,
                "tokenizer vocabulary is larger than the model's"
            );
        }

        Ok(Self {
            model,
            tokenizer,
            bos_token_id,
            eos_token_id,
            rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
            compute_lock: options.serialize_compute.then(|| Mutex::new(())),
            load_report: LoadReport::default(),
        })
    }

    pub fn with_load_report(mut self, report: LoadReport) -> Self {
        self.load_report = report;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        self.model.config()
    }

    pub fn tokenizer(&self) -> &TokenizerAdapter {
        &self.tokenizer
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    pub fn device(&self) -> String {
        self.model.device()
    }

    pub fn vocab_size(&self) -> usize {
        self.model.config().vocab_size
    }

    /// Runs `f` with exclusive access to the shared generator.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        f(&mut self.rng.lock())
    }

    /// Prompt ids followed by the beginning-of-sequence id.
    pub fn entry_sequence(&self, prompt: &str) -> Result<Vec<u32>, ServiceError> {
        let mut ids = self.tokenizer.encode(prompt)?;
        ids.push(self.bos_token_id);
        Ok(ids)
    }

    /// Runs one generation to completion on the calling thread.
    ///
    /// Only the generated ids are decoded, so the prompt never appears in
    /// the returned text.
    pub fn run(
        &self,
        params: &GenerationParams,
        cancel: &CancelFlag,
    ) -> Result<GenerationResult, ServiceError> {
        let entry = self.entry_sequence(&params.prompt)?;

        let mut rng = match params.seed {
            Some(seed) => RandomSource::seeded(seed),
            None => RandomSource::Shared(&self.rng),
        };

        let generation = GenerationEngine::new(self.model.as_ref())
            .with_compute_lock(self.compute_lock.as_ref())
            .with_eos(self.eos_token_id)
            .generate(
                &entry,
                params.temperature,
                params.max_new_tokens,
                params.top_k,
                &mut rng,
                cancel,
            )?;

        let text = self.tokenizer.decode(generation.generated())?;
        debug!(
            prompt_tokens = generation.prompt_len,
            generated_tokens = generation.generated().len(),
            stop = ?generation.stop_reason,
            "generation finished"
        );

        Ok(GenerationResult {
            text,
            prompt_tokens: generation.prompt_len,
            generated_tokens: generation.generated().len(),
            stop_reason: generation.stop_reason,
        })
    }
}
