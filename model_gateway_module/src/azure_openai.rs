use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use super::config::AzureOpenAiConfig;
use super::errors::ModelGatewayError;
use super::types::{CompletionRequest, Embedder, Generator};

/// Azure OpenAI deployments for chat completions and embeddings.
#[derive(Clone)]
pub struct AzureOpenAiClient {
    client: Client,
    config: AzureOpenAiConfig,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl AzureOpenAiClient {
    pub fn from_env() -> Result<Self, ModelGatewayError> {
        Self::new(AzureOpenAiConfig::from_env()?)
    }

    pub fn new(config: AzureOpenAiConfig) -> Result<Self, ModelGatewayError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn deployment_url(&self, deployment: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.config.endpoint, deployment, operation, self.config.api_version
        )
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<T, ModelGatewayError> {
        let response = self
            .client
            .post(url)
            .header("api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("azure openai request failed (status {}): {}", status, body);
            return Err(ModelGatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl Generator for AzureOpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelGatewayError> {
        let mut messages = Vec::new();
        if let Some(system) = request.system.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let url = self.deployment_url(&self.config.chat_deployment, "chat/completions");
        let response: ChatCompletionResponse = self
            .post_json(
                url,
                json!({
                    "messages": messages,
                    "max_tokens": request.max_output_tokens,
                }),
            )
            .await?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                ModelGatewayError::InvalidResponse("completion has no choices".to_string())
            })?;
        debug!("azure openai completion returned {} chars", content.len());
        Ok(content)
    }
}

#[async_trait]
impl Embedder for AzureOpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelGatewayError> {
        let url = self.deployment_url(&self.config.embedding_deployment, "embeddings");
        let response: EmbeddingResponse = self.post_json(url, json!({ "input": text })).await?;
        let vector = response
            .data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .filter(|vector| !vector.is_empty())
            .ok_or_else(|| {
                ModelGatewayError::InvalidResponse("embedding response has no vectors".to_string())
            })?;
        Ok(vector)
    }
}
