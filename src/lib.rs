pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod rpc;
pub mod sampling;
pub mod server;
pub mod service;
pub mod state;
pub mod tokenizer;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{GenerationRequest, GenerationResponse, LanguageModel, ModelConfig};
pub use rpc::RpcService;
pub use server::build_router;
pub use service::CompletionService;
pub use state::{ServingState, StateOptions};
pub use tokenizer::TokenizerAdapter;
