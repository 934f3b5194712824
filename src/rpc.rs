//! gRPC surface (`llm.LLMService`).

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::{model::GenerationRequest, service::CompletionService};

pub mod proto {
    tonic::include_proto!("llm");
}

pub use proto::llm_service_server::LlmServiceServer;
use proto::{GenerateRequest, GenerateResponse, HealthRequest, HealthResponse};

pub struct RpcService {
    service: CompletionService,
}

impl RpcService {
    pub fn new(service: CompletionService) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> LlmServiceServer<Self> {
        LlmServiceServer::new(self)
    }
}

impl From<GenerateRequest> for GenerationRequest {
    fn from(req: GenerateRequest) -> Self {
        GenerationRequest {
            prompt: req.prompt,
            temperature: req.temperature.map(f64::from),
            max_new_tokens: req.max_new_tokens.map(i64::from),
            top_k: req.top_k.map(i64::from),
            seed: req.seed,
        }
    }
}

#[async_trait::async_trait]
impl proto::llm_service_server::LlmService for RpcService {
    async fn generate(
        &self,
        request: Request<GenerateRequest>,
    ) -> Result<Response<GenerateResponse>, Status> {
        let result = self.service.complete(request.into_inner().into()).await?;
        debug!(
            generated = result.generated_tokens,
            stop = ?result.stop_reason,
            "rpc generate"
        );
        Ok(Response::new(GenerateResponse {
            response: result.text,
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse {
            status: "healthy".to_string(),
        }))
    }
}
