use std::env;
use std::time::Duration;

use model_gateway_module::ModelGatewayError;

use crate::blob_store::BlobStoreError;
use crate::notify::NotifyError;
use crate::warehouse::WarehouseError;

pub const DEFAULT_ATTACHMENT_MAX_BYTES: u64 = 4 * 1024 * 1024;
pub const DEFAULT_INDEX_MIN_ROWS: i64 = 1000;
const DEFAULT_PERSONA: &str =
    "You are a helpful, professional assistant who answers email on behalf of the team.";
const DEFAULT_URGENT_KEYWORDS: &str = "urgent,asap,important,emergency,immediately";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error(transparent)]
    ModelGateway(#[from] ModelGatewayError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// The character the agent answers as.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterProfile {
    pub id: String,
    pub name: String,
    pub persona: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentLimits {
    pub max_bytes: u64,
    pub concurrency: usize,
    pub durability_timeout: Duration,
    pub durability_poll: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    /// Embedded rows required before the approximate index is built.
    pub min_rows: i64,
    pub max_embedding_chars: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub max_query_chars: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationLimits {
    pub context_tokens: u32,
    pub max_output_tokens: u32,
    pub safety_margin_tokens: u32,
    pub min_output_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportanceRules {
    /// Lower-cased tokens matched against the sender address.
    pub important_senders: Vec<String>,
    /// Lower-cased keywords matched against subject and body.
    pub urgent_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub character: CharacterProfile,
    pub attachments: AttachmentLimits,
    pub index: IndexSettings,
    pub retrieval: RetrievalSettings,
    pub generation: GenerationLimits,
    pub cache_ttl: Duration,
    pub importance: ImportanceRules,
    pub digest_interval: Duration,
    pub notify_webhook_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            character: CharacterProfile {
                id: "default".to_string(),
                name: "Assistant".to_string(),
                persona: DEFAULT_PERSONA.to_string(),
            },
            attachments: AttachmentLimits {
                max_bytes: DEFAULT_ATTACHMENT_MAX_BYTES,
                concurrency: 4,
                durability_timeout: Duration::from_secs(120),
                durability_poll: Duration::from_millis(2000),
            },
            index: IndexSettings {
                min_rows: DEFAULT_INDEX_MIN_ROWS,
                max_embedding_chars: 8000,
            },
            retrieval: RetrievalSettings {
                top_k: 5,
                max_query_chars: 1000,
            },
            generation: GenerationLimits {
                context_tokens: 128_000,
                max_output_tokens: 4096,
                safety_margin_tokens: 1024,
                min_output_tokens: 256,
            },
            cache_ttl: Duration::from_secs(300),
            importance: ImportanceRules {
                important_senders: Vec::new(),
                urgent_keywords: split_list(DEFAULT_URGENT_KEYWORDS),
            },
            digest_interval: Duration::from_secs(3600),
            notify_webhook_url: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let character = CharacterProfile {
            id: env_var_non_empty("CHARACTER_ID").unwrap_or(defaults.character.id),
            name: env_var_non_empty("CHARACTER_NAME").unwrap_or(defaults.character.name),
            persona: env_var_non_empty("CHARACTER_PERSONA").unwrap_or(defaults.character.persona),
        };

        let attachments = AttachmentLimits {
            max_bytes: env_number("ATTACHMENT_MAX_BYTES").unwrap_or(defaults.attachments.max_bytes),
            concurrency: env_number("ATTACHMENT_CONCURRENCY")
                .unwrap_or(defaults.attachments.concurrency),
            durability_timeout: env_number("ATTACHMENT_DURABILITY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.attachments.durability_timeout),
            durability_poll: env_number("ATTACHMENT_DURABILITY_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.attachments.durability_poll),
        };

        let index = IndexSettings {
            min_rows: env_number("INDEX_MIN_ROWS").unwrap_or(defaults.index.min_rows),
            max_embedding_chars: env_number("EMBEDDING_MAX_CHARS")
                .unwrap_or(defaults.index.max_embedding_chars),
        };

        let retrieval = RetrievalSettings {
            top_k: env_number("RETRIEVAL_TOP_K").unwrap_or(defaults.retrieval.top_k),
            max_query_chars: defaults.retrieval.max_query_chars,
        };

        let generation = GenerationLimits {
            context_tokens: env_number("GENERATION_CONTEXT_TOKENS")
                .unwrap_or(defaults.generation.context_tokens),
            max_output_tokens: env_number("GENERATION_MAX_OUTPUT_TOKENS")
                .unwrap_or(defaults.generation.max_output_tokens),
            ..defaults.generation
        };

        let importance = ImportanceRules {
            important_senders: env_var_non_empty("IMPORTANT_SENDERS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            urgent_keywords: env_var_non_empty("URGENT_KEYWORDS")
                .map(|value| split_list(&value))
                .unwrap_or(defaults.importance.urgent_keywords),
        };

        let notify_webhook_url = match env_var_non_empty("NOTIFY_WEBHOOK_URL") {
            Some(url) => {
                reqwest::Url::parse(&url).map_err(|err| ConfigError::Invalid {
                    key: "NOTIFY_WEBHOOK_URL",
                    message: err.to_string(),
                })?;
                Some(url)
            }
            None => None,
        };

        Ok(Self {
            character,
            attachments,
            index,
            retrieval,
            generation,
            cache_ttl: env_number("CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            importance,
            digest_interval: env_number("DIGEST_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.digest_interval),
            notify_webhook_url,
        })
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_number<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
