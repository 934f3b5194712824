use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Architecture hyperparameters of the Llama-2 style transformer.
///
/// Must agree with the shapes stored in the checkpoint. A mismatch does not
/// fail the load; the affected parameters are reported and left at their
/// initial values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub multiple_of: usize,
    pub max_seq_len: usize,
    pub dropout: f64,
    pub norm_eps: f64,
    pub rope_theta: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 1024,
            n_layers: 12,
            n_heads: 8,
            n_kv_heads: 8,
            vocab_size: 64793,
            multiple_of: 32,
            max_seq_len: 512,
            dropout: 0.0,
            norm_eps: 1e-5,
            rope_theta: 10000.0,
        }
    }
}

impl ModelConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ServiceError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: ModelConfig = serde_json::from_str(&raw).map_err(|e| {
            ServiceError::Config(format!("invalid model config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Feed-forward width: two thirds of `4 * dim`, rounded up to `multiple_of`.
    pub fn hidden_dim(&self) -> usize {
        let hidden = 2 * (4 * self.dim) / 3;
        self.multiple_of * hidden.div_ceil(self.multiple_of)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        let sizes = [
            ("dim", self.dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("multiple_of", self.multiple_of),
            ("max_seq_len", self.max_seq_len),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ServiceError::Config(format!("{name} must be positive")));
        }
        if self.dim % self.n_heads != 0 {
            return Err(ServiceError::Config(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ServiceError::Config(format!(
                "n_heads {} is not divisible by n_kv_heads {}",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(ServiceError::Config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_shipped_checkpoint() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 128);
        // 2 * 4096 / 3 = 2730, rounded up to a multiple of 32
        assert_eq!(config.hidden_dim(), 2752);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ModelConfig =
            serde_json::from_str(r#"{"dim": 64, "n_layers": 2, "n_heads": 4}"#).unwrap();
        assert_eq!(config.dim, 64);
        assert_eq!(config.n_kv_heads, 8);
        assert_eq!(config.max_seq_len, 512);
    }

    #[test]
    fn rejects_inconsistent_heads() {
        let config = ModelConfig {
            dim: 64,
            n_heads: 4,
            n_kv_heads: 3,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServiceError::Config(_))));

        let config = ModelConfig {
            max_seq_len: 0,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
