use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::config::DocumentServiceConfig;
use super::errors::ModelGatewayError;
use super::types::{DocumentExtractor, DocumentInput};

/// Document-understanding service: accepts a base64 document, returns its text.
#[derive(Clone)]
pub struct DocumentServiceClient {
    client: Client,
    config: DocumentServiceConfig,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl DocumentServiceClient {
    pub fn from_env() -> Result<Self, ModelGatewayError> {
        Self::new(DocumentServiceConfig::from_env()?)
    }

    pub fn new(config: DocumentServiceConfig) -> Result<Self, ModelGatewayError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DocumentExtractor for DocumentServiceClient {
    async fn extract_text(&self, document: DocumentInput<'_>) -> Result<String, ModelGatewayError> {
        let url = format!("{}/extract", self.config.base_url);
        let mut request = self.client.post(url).json(&json!({
            "file_name": document.file_name,
            "content_type": document.content_type,
            "content": BASE64_STANDARD.encode(document.content),
        }));
        if let Some(key) = self.config.api_key.as_deref() {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                "document service failed for {} (status {}): {}",
                document.file_name, status, body
            );
            return Err(ModelGatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ExtractResponse = response.json().await?;
        if let Some(err) = parsed.error.filter(|err| !err.trim().is_empty()) {
            return Err(ModelGatewayError::InvalidResponse(err));
        }
        let text = parsed.text.unwrap_or_default();
        info!(
            "extracted {} chars from {} ({})",
            text.len(),
            document.file_name,
            document.content_type
        );
        Ok(text)
    }
}
