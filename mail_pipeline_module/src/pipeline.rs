//! The consumer-facing surface: every query returns a usable (possibly
//! fallback) result instead of an error.

use std::sync::Arc;

use chrono::Utc;
use model_gateway_module::{
    AzureOpenAiClient, DocumentExtractor, DocumentServiceClient, Embedder, Generator,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::attachments::AttachmentExtractor;
use crate::blob_store::{AzureBlobStore, BlobStore};
use crate::cache::{cache_key, ResponseCache, TtlCache};
use crate::config::{ConfigError, PipelineConfig};
use crate::dual_store::{DualStore, DualStoreError};
use crate::embedding_index::EmbeddingIndexer;
use crate::ingestor::{EmailIngestor, IngestError, IngestReport};
use crate::notify::{DigestTimer, Notifier, TracingNotifier, WebhookNotifier};
use crate::record::{is_sentinel, InboundEmail, ReplyRecord};
use crate::reply::{GeneratedReply, KnowledgeSnippet, ReplyGenerator, ReplyRequest};
use crate::retrieval::{RetrievalEngine, RetrievedEmail};
use crate::warehouse::{run_blocking, PostgresWarehouse, Warehouse, WarehouseError};

/// External capabilities the pipeline is assembled from.
#[derive(Clone)]
pub struct PipelineDeps {
    pub blobs: Arc<dyn BlobStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub generator: Arc<dyn Generator>,
    pub embedder: Arc<dyn Embedder>,
    pub documents: Arc<dyn DocumentExtractor>,
    pub notifier: Arc<dyn Notifier>,
    pub cache: Arc<dyn ResponseCache>,
}

/// Caller-supplied context for a reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub user_id: String,
    /// Overrides the stored email body as the question to answer.
    #[serde(default)]
    pub question: Option<String>,
    /// Extra facts, placed before the retrieved emails.
    #[serde(default)]
    pub knowledge: Vec<KnowledgeSnippet>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Clone)]
pub struct EmailPipeline {
    config: PipelineConfig,
    store: DualStore,
    ingestor: EmailIngestor,
    retrieval: RetrievalEngine,
    replies: ReplyGenerator,
    notifier: Arc<dyn Notifier>,
    cache: Arc<dyn ResponseCache>,
}

impl EmailPipeline {
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        let store = DualStore::new(deps.blobs, deps.warehouse);
        let extractor =
            AttachmentExtractor::new(store.clone(), deps.documents, config.attachments.clone());
        let indexer = EmbeddingIndexer::new(store.clone(), deps.embedder.clone(), config.index.clone());
        let ingestor = EmailIngestor::new(
            store.clone(),
            extractor,
            indexer,
            deps.notifier.clone(),
            config.importance.clone(),
            config.attachments.concurrency,
        );
        let retrieval = RetrievalEngine::new(store.clone(), deps.embedder, config.retrieval.clone());
        let replies = ReplyGenerator::new(
            store.clone(),
            deps.generator,
            config.character.clone(),
            config.generation.clone(),
        );
        Self {
            config,
            store,
            ingestor,
            retrieval,
            replies,
            notifier: deps.notifier,
            cache: deps.cache,
        }
    }

    /// Azure blob storage, the Postgres warehouse (schema ensured), Azure
    /// OpenAI and the document service, all configured from the environment.
    pub async fn from_env() -> Result<Self, ConfigError> {
        let config = PipelineConfig::from_env()?;

        let blobs: Arc<dyn BlobStore> = Arc::new(AzureBlobStore::from_env()?);
        let warehouse = tokio::task::spawn_blocking(|| -> Result<PostgresWarehouse, WarehouseError> {
            let warehouse = PostgresWarehouse::from_env()?;
            warehouse.ensure_schema()?;
            Ok(warehouse)
        })
        .await
        .map_err(|err| WarehouseError::Join(err.to_string()))??;

        let openai = Arc::new(AzureOpenAiClient::from_env()?);
        let documents = Arc::new(DocumentServiceClient::from_env()?);
        let notifier: Arc<dyn Notifier> = match config.notify_webhook_url.as_deref() {
            Some(url) => Arc::new(WebhookNotifier::new(url)?),
            None => Arc::new(TracingNotifier),
        };

        let deps = PipelineDeps {
            blobs,
            warehouse: Arc::new(warehouse),
            generator: openai.clone(),
            embedder: openai,
            documents,
            notifier,
            cache: Arc::new(TtlCache::new()),
        };
        Ok(Self::new(deps, config))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn ensure_schema(&self) -> Result<(), DualStoreError> {
        self.store.ensure_schema().await
    }

    pub async fn ingest(&self, user_id: &str, inbound: InboundEmail) -> Result<IngestReport, IngestError> {
        self.ingestor.ingest(user_id, inbound).await
    }

    pub async fn list_recent(&self, user_id: &str, limit: usize) -> Vec<RetrievedEmail> {
        self.retrieval.list_recent(user_id, limit).await
    }

    pub async fn find_by_address(&self, address: &str, user_id: &str, limit: usize) -> Vec<RetrievedEmail> {
        self.retrieval.find_by_address(address, user_id, limit).await
    }

    pub async fn find_similar_by_id(&self, email_id: Uuid, user_id: &str, top_k: usize) -> Vec<RetrievedEmail> {
        self.retrieval.find_similar_by_id(email_id, user_id, top_k).await
    }

    pub async fn find_similar_by_text(&self, text: &str, user_id: &str, top_k: usize) -> Vec<RetrievedEmail> {
        let top_k_part = top_k.to_string();
        let key = cache_key(&["similar_by_text", user_id, text, &top_k_part]);
        if let Some(results) = self.cached::<Vec<RetrievedEmail>>(&key) {
            return results;
        }

        let results = self.retrieval.find_similar_by_text(text, user_id, top_k).await;
        if !results.is_empty() {
            self.store_cached(&key, &results);
        }
        results
    }

    /// Replies to an email owned by `context.user_id`. Unknown or foreign
    /// email ids get the uncached safe default without calling the model.
    pub async fn generate_reply(&self, email_id: Uuid, context: &ReplyContext) -> GeneratedReply {
        let context_json = serde_json::to_string(context).unwrap_or_default();
        let email_part = email_id.to_string();
        let key = cache_key(&["reply", &self.config.character.id, &email_part, &context_json]);
        if let Some(reply) = self.cached::<GeneratedReply>(&key) {
            return reply;
        }

        let request = match self.reply_request(email_id, context).await {
            Some(request) => request,
            None => {
                debug!("email {} not found for user {}", email_id, context.user_id);
                let request = ReplyRequest {
                    email_id,
                    user_id: context.user_id.clone(),
                    sender: String::new(),
                    subject: String::new(),
                    question: String::new(),
                    knowledge: Vec::new(),
                };
                return self.replies.safe_default(&request).await;
            }
        };
        let reply = self.replies.generate(&request).await;
        if !reply.fallback {
            self.store_cached(&key, &reply);
        }
        reply
    }

    /// Stores the outcome of sending a reply to an email owned by `user_id`.
    pub async fn record_reply(
        &self,
        user_id: &str,
        original_email_id: Uuid,
        reply_subject: &str,
        reply_body: &str,
        sent_success: bool,
    ) -> Result<ReplyRecord, DualStoreError> {
        let record = ReplyRecord {
            id: Uuid::new_v4(),
            original_email_id,
            reply_subject: reply_subject.to_string(),
            reply_body: reply_body.to_string(),
            timestamp: Utc::now(),
            sent_success,
        };
        self.store.record_reply(user_id, record.clone()).await?;
        Ok(record)
    }

    /// Starts the periodic digest for the life of the process.
    pub fn spawn_digest(&self) -> JoinHandle<()> {
        let timer = Arc::new(DigestTimer::new(
            self.store.warehouse().clone(),
            self.notifier.clone(),
        ));
        timer.spawn(self.config.digest_interval)
    }

    /// `None` when the email does not belong to the caller or cannot be loaded.
    async fn reply_request(&self, email_id: Uuid, context: &ReplyContext) -> Option<ReplyRequest> {
        let owner = context.user_id.clone();
        let email = match run_blocking(self.store.warehouse(), move |w| w.get_email(&owner, &email_id)).await {
            Ok(email) => email?,
            Err(err) => {
                warn!("failed to load email {} for reply: {}", email_id, err);
                return None;
            }
        };

        let top_k = context.top_k.unwrap_or(self.config.retrieval.top_k);
        let mut knowledge = context.knowledge.clone();
        knowledge.extend(
            self.retrieval
                .find_similar_by_id(email_id, &context.user_id, top_k)
                .await
                .into_iter()
                .map(|retrieved| KnowledgeSnippet {
                    source: format!(
                        "email from {} on {} ({})",
                        retrieved.email.from_address,
                        retrieved.email.timestamp.format("%Y-%m-%d"),
                        retrieved.email.subject
                    ),
                    text: retrieved.email.body_text,
                }),
        );

        let body = self.store.get_body(&email.body_blob_uri).await;
        let body = if is_sentinel(&body) { email.body_text } else { body };
        let question = context
            .question
            .clone()
            .filter(|question| !question.trim().is_empty())
            .unwrap_or(body);

        Some(ReplyRequest {
            email_id,
            user_id: context.user_id.clone(),
            sender: email.from_address,
            subject: email.subject,
            question,
            knowledge,
        })
    }

    fn cached<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let raw = self.cache.get(key)?;
        serde_json::from_str(&raw).ok()
    }

    fn store_cached<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.cache.set(key, raw, self.config.cache_ttl),
            Err(err) => warn!("failed to cache response: {}", err),
        }
    }
}
