use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// A completion request as decoded by either transport. Absent fields take
/// the server defaults in [`GenerationRequest::resolve`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_new_tokens: Option<i64>,
    pub top_k: Option<i64>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub response: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub temperature: f64,
    pub max_new_tokens: usize,
    pub top_k: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_new_tokens: 100,
            top_k: 30,
        }
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub temperature: f32,
    pub max_new_tokens: usize,
    pub top_k: usize,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn resolve(
        self,
        defaults: &GenerationDefaults,
        vocab_size: usize,
    ) -> Result<GenerationParams, ServiceError> {
        let temperature = self.temperature.unwrap_or(defaults.temperature);
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(ServiceError::InvalidArgument(format!(
                "temperature must be a positive number, got {temperature}"
            )));
        }

        let max_new_tokens = match self.max_new_tokens {
            None => defaults.max_new_tokens,
            Some(n) => usize::try_from(n).map_err(|_| {
                ServiceError::InvalidArgument(format!(
                    "max_new_tokens must not be negative, got {n}"
                ))
            })?,
        };

        let top_k = self.top_k.unwrap_or(defaults.top_k as i64);
        if top_k < 1 || top_k as u64 > vocab_size as u64 {
            return Err(ServiceError::InvalidArgument(format!(
                "top_k must be between 1 and {vocab_size}, got {top_k}"
            )));
        }

        Ok(GenerationParams {
            prompt: self.prompt,
            temperature: temperature as f32,
            max_new_tokens,
            top_k: top_k as usize,
            seed: self.seed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxNewTokens,
    ContextFull,
    EndOfSequence,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub stop_reason: StopReason,
}
