use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::{
    error::ServiceError,
    model::{GenerationDefaults, ModelConfig},
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_addr: SocketAddr,
    pub grpc_addr: SocketAddr,
    pub checkpoint_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub model: ModelConfig,
    pub defaults: GenerationDefaults,
    pub seed: u64,
    pub bos_token: String,
    pub eos_token: String,
    pub http_workers: usize,
    pub rpc_workers: usize,
    pub serialize_compute: bool,
    pub generation_timeout: Option<Duration>,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unparsable values fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_addr = lookup("HTTP_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000));
        let grpc_addr = lookup("GRPC_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 50051));

        let checkpoint_path = PathBuf::from(
            lookup("CHECKPOINT_PATH").unwrap_or_else(|| "model_para/baby_llama.pth".to_string()),
        );
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "tokenizer/tokenizer.json".to_string()),
        );

        let model = match lookup("MODEL_CONFIG_PATH") {
            Some(path) => ModelConfig::from_json_file(&PathBuf::from(path))?,
            None => ModelConfig::default(),
        };

        let fallback = GenerationDefaults::default();
        let defaults = GenerationDefaults {
            temperature: parse_or(&lookup, "DEFAULT_TEMPERATURE", fallback.temperature),
            max_new_tokens: parse_or(&lookup, "DEFAULT_MAX_NEW_TOKENS", fallback.max_new_tokens),
            top_k: parse_or(&lookup, "DEFAULT_TOP_K", fallback.top_k),
        };
        if !defaults.temperature.is_finite() || defaults.temperature <= 0.0 {
            return Err(ServiceError::Config(format!(
                "DEFAULT_TEMPERATURE must be positive, got {}",
                defaults.temperature
            )));
        }

        let seed = parse_or(&lookup, "SEED", 1337);
        let bos_token = lookup("BOS_TOKEN").unwrap_or_else(|| "<s>".to_string());
        let eos_token = lookup("EOS_TOKEN").unwrap_or_else(|| "</s>".to_string());

        let http_workers = parse_or(&lookup, "HTTP_WORKERS", 1usize).max(1);
        let rpc_workers = parse_or(&lookup, "RPC_WORKERS", 10usize).max(1);
        let serialize_compute = lookup("SERIALIZE_COMPUTE")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let generation_timeout = parse_var::<u64, _>(&lookup, "GENERATION_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "auto".into());
            parse_device(&raw)
        };

        Ok(Self {
            http_addr,
            grpc_addr,
            checkpoint_path,
            tokenizer_path,
            model,
            defaults,
            seed,
            bos_token,
            eos_token,
            http_workers,
            rpc_workers,
            serialize_compute,
            generation_timeout,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, key).unwrap_or(default)
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower == "auto" {
        Device::cuda_if_available()
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA unavailable, falling back to CPU");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
