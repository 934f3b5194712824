pub mod checkpoint;
mod config;
mod types;

#[cfg(feature = "tch-backend")]
pub mod transformer;

pub use checkpoint::{LEGACY_PREFIX, LoadReport, strip_legacy_prefix};
pub use config::ModelConfig;
pub use types::{
    GenerationDefaults, GenerationParams, GenerationRequest, GenerationResponse,
    GenerationResult, StopReason,
};

use crate::error::ServiceError;

/// Next-token scoring over a token sequence.
///
/// Implementations are shared by every in-flight request and must be safe to
/// call concurrently; the serving state adds a compute lock on top when the
/// device cannot run kernels concurrently.
pub trait LanguageModel: Send + Sync {
    fn config(&self) -> &ModelConfig;

    /// Returns one logit per vocabulary entry for the position after `tokens`.
    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>, ServiceError>;

    fn device(&self) -> String {
        "cpu".to_string()
    }
}
