use async_trait::async_trait;

use super::errors::ModelGatewayError;

/// A single synchronous generation call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_output_tokens: u32,
}

/// Binary document handed to the extraction service.
#[derive(Debug, Clone)]
pub struct DocumentInput<'a> {
    pub file_name: &'a str,
    pub content_type: &'a str,
    pub content: &'a [u8],
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelGatewayError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelGatewayError>;
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract_text(&self, document: DocumentInput<'_>) -> Result<String, ModelGatewayError>;
}
