//! Clients for the external model services used by the mail pipeline:
//! text generation, text embeddings and document text extraction.

mod azure_openai;
mod config;
mod document;
mod errors;
mod types;

pub use azure_openai::AzureOpenAiClient;
pub use config::{AzureOpenAiConfig, DocumentServiceConfig};
pub use document::DocumentServiceClient;
pub use errors::ModelGatewayError;
pub use types::{
    CompletionRequest, DocumentExtractor, DocumentInput, Embedder, Generator,
};
