pub mod deepseek;
pub mod grok;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::proxy::mappers::middle::MiddleRequest;

pub type SseByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// What the ingress layer learned about the caller before dispatch.
#[derive(Debug, Clone)]
pub struct CallerAuth {
    pub bearer: Option<String>,
    /// True when the bearer matched a key in `config.keys`; false means the
    /// bearer may still be usable as a raw upstream token (DeepSeek).
    pub is_config_key: bool,
}

/// A provider-produced response: an OpenAI-SSE byte stream plus metadata.
/// Credential leases are owned by the stream itself (RAII), so dropping the
/// stream on client disconnect releases them.
pub struct ProviderStream {
    pub stream: SseByteStream,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Unauthorized(String),
    /// Selector came up empty. DeepSeek surfaces this as 429, Grok as 503.
    #[error("no account available")]
    NoAccount { status: u16 },
    #[error("{0}")]
    BadRequest(String),
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("proof-of-work failed: {0}")]
    Pow(String),
    #[error("{0}")]
    Internal(String),
}

impl ProviderError {
    pub fn status(&self) -> u16 {
        match self {
            ProviderError::Unauthorized(_) => 401,
            ProviderError::NoAccount { status } => *status,
            ProviderError::BadRequest(_) => 400,
            ProviderError::Upstream { status, .. } => {
                // Retryable statuses pass through; anything else becomes a
                // plain server error with the upstream message preserved.
                match *status {
                    401 | 403 | 429 | 503 => *status,
                    _ => 500,
                }
            }
            ProviderError::Pow(_) | ProviderError::Internal(_) => 500,
        }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Owner tag recorded in the model registry.
    fn name(&self) -> &'static str;

    fn models(&self) -> Vec<String>;

    /// Fulfills one normalized request, returning an OpenAI-SSE stream.
    async fn handle(
        &self,
        auth: &CallerAuth,
        request: MiddleRequest,
    ) -> Result<ProviderStream, ProviderError>;
}
