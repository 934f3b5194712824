use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("checkpoint not found or unreadable: {}", .0.display())]
    CheckpointNotFound(PathBuf),
    #[error("vocabulary not found or unreadable: {}", .0.display())]
    VocabularyNotFound(PathBuf),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("prompt too long: input of {sequence_tokens} tokens including the start marker, model context is {max_seq_len}")]
    PromptTooLong {
        sequence_tokens: usize,
        max_seq_len: usize,
    },
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation timed out")]
    TimedOut,
    #[error("server is shutting down")]
    Unavailable,
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Stable machine-readable code shared by both transports.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidArgument(_) => "invalid_argument",
            ServiceError::PromptTooLong { .. } => "prompt_too_long",
            ServiceError::Cancelled => "cancelled",
            ServiceError::TimedOut => "timed_out",
            ServiceError::Unavailable => "busy",
            _ => "internal",
        }
    }

    pub fn is_internal(&self) -> bool {
        self.code() == "internal"
    }

    /// Message safe to show a client. Internal failures are never described.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "internal error".to_string()
        } else {
            self.to_string()
        }
    }
}

#[cfg(feature = "tch-backend")]
impl From<tch::TchError> for ServiceError {
    fn from(err: tch::TchError) -> Self {
        ServiceError::Inference(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::InvalidArgument(_) | ServiceError::PromptTooLong { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Cancelled | ServiceError::TimedOut => StatusCode::REQUEST_TIMEOUT,
            ServiceError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.is_internal() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.public_message(),
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        if err.is_internal() {
            tracing::error!(error = %err, "rpc failed");
        }
        let message = err.public_message();
        match err {
            ServiceError::InvalidArgument(_) | ServiceError::PromptTooLong { .. } => {
                tonic::Status::invalid_argument(message)
            }
            ServiceError::Cancelled => tonic::Status::cancelled(message),
            ServiceError::TimedOut => tonic::Status::deadline_exceeded(message),
            ServiceError::Unavailable => tonic::Status::unavailable(message),
            _ => tonic::Status::internal(message),
        }
    }
}
