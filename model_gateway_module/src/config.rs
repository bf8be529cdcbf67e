use std::env;
use std::time::Duration;

use super::errors::ModelGatewayError;

const DEFAULT_API_VERSION: &str = "2024-06-01";
const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 300;
const DEFAULT_DOCUMENT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct AzureOpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub chat_deployment: String,
    pub embedding_deployment: String,
    /// Applies to every request; generation calls are the slow ones.
    pub timeout: Duration,
}

impl AzureOpenAiConfig {
    pub fn from_env() -> Result<Self, ModelGatewayError> {
        dotenvy::dotenv().ok();
        Ok(Self {
            endpoint: required_env("AZURE_OPENAI_ENDPOINT")?
                .trim_end_matches('/')
                .to_string(),
            api_key: required_env("AZURE_OPENAI_API_KEY")?,
            api_version: optional_env("AZURE_OPENAI_API_VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            chat_deployment: required_env("AZURE_OPENAI_CHAT_DEPLOYMENT")?,
            embedding_deployment: required_env("AZURE_OPENAI_EMBEDDING_DEPLOYMENT")?,
            timeout: Duration::from_secs(resolve_u64_env(
                "GENERATION_TIMEOUT_SECS",
                DEFAULT_GENERATION_TIMEOUT_SECS,
            )),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DocumentServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl DocumentServiceConfig {
    pub fn from_env() -> Result<Self, ModelGatewayError> {
        dotenvy::dotenv().ok();
        Ok(Self {
            base_url: required_env("DOCUMENT_SERVICE_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_key: optional_env("DOCUMENT_SERVICE_KEY"),
            timeout: Duration::from_secs(resolve_u64_env(
                "DOCUMENT_SERVICE_TIMEOUT_SECS",
                DEFAULT_DOCUMENT_TIMEOUT_SECS,
            )),
        })
    }
}

fn required_env(key: &'static str) -> Result<String, ModelGatewayError> {
    optional_env(key).ok_or(ModelGatewayError::MissingEnv(key))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_u64_env(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}
