#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model_gateway_module::{
    CompletionRequest, DocumentExtractor, DocumentInput, Embedder, Generator, ModelGatewayError,
};

use mail_pipeline_module::blob_store::MemoryBlobStore;
use mail_pipeline_module::cache::TtlCache;
use mail_pipeline_module::notify::{NotificationEvent, Notifier, NotifyError};
use mail_pipeline_module::record::InboundAttachment;
use mail_pipeline_module::warehouse::MemoryWarehouse;
use mail_pipeline_module::{EmailPipeline, InboundEmail, PipelineConfig, PipelineDeps};

pub fn require_warehouse_db_url(test_name: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    match std::env::var("WAREHOUSE_DB_URL") {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            eprintln!("Skipping {test_name}; WAREHOUSE_DB_URL not set.");
            None
        }
    }
}

/// Hashed bag of words: emails sharing vocabulary land near each other.
#[derive(Debug, Default)]
pub struct WordEmbedder {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

pub const WORD_DIMENSIONS: usize = 64;

pub fn word_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; WORD_DIMENSIONS];
    vector[0] = 0.01;
    for word in text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in word.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        vector[(hash % WORD_DIMENSIONS as u64) as usize] += 1.0;
    }
    vector
}

#[async_trait]
impl Embedder for WordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelGatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ModelGatewayError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(word_embedding(text))
    }
}

#[derive(Debug)]
pub struct ScriptedGenerator {
    pub calls: AtomicUsize,
    response: Option<String>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: Some(text.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn last_prompt(&self) -> String {
        self.prompts
            .lock()
            .expect("lock")
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelGatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().expect("lock").push(request.prompt.clone());
        self.response
            .clone()
            .ok_or_else(|| ModelGatewayError::InvalidResponse("no completion".to_string()))
    }
}

#[derive(Debug, Default)]
pub struct EchoDocuments {
    pub calls: AtomicUsize,
}

#[async_trait]
impl DocumentExtractor for EchoDocuments {
    async fn extract_text(&self, document: DocumentInput<'_>) -> Result<String, ModelGatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "extracted {}: {}",
            document.file_name,
            String::from_utf8_lossy(document.content)
        ))
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.events.lock().expect("lock").push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub pipeline: EmailPipeline,
    pub blobs: Arc<MemoryBlobStore>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub embedder: Arc<WordEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub documents: Arc<EchoDocuments>,
    pub notifier: Arc<RecordingNotifier>,
    pub cache: Arc<TtlCache>,
}

pub fn harness(config: PipelineConfig, generator: ScriptedGenerator) -> Harness {
    let blobs = Arc::new(MemoryBlobStore::new());
    let warehouse = Arc::new(MemoryWarehouse::new());
    let embedder = Arc::new(WordEmbedder::default());
    let generator = Arc::new(generator);
    let documents = Arc::new(EchoDocuments::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let cache = Arc::new(TtlCache::new());

    let deps = PipelineDeps {
        blobs: blobs.clone(),
        warehouse: warehouse.clone(),
        generator: generator.clone(),
        embedder: embedder.clone(),
        documents: documents.clone(),
        notifier: notifier.clone(),
        cache: cache.clone(),
    };

    Harness {
        pipeline: EmailPipeline::new(deps, config),
        blobs,
        warehouse,
        embedder,
        generator,
        documents,
        notifier,
        cache,
    }
}

/// Config with the vector index threshold lowered to `min_rows`.
pub fn config_with_index_threshold(min_rows: i64) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.index.min_rows = min_rows;
    config
}

pub fn inbound(message_id: &str, from: &str, subject: &str, text: &str) -> InboundEmail {
    InboundEmail {
        from_addresses: vec![from.to_string()],
        subject: Some(subject.to_string()),
        text: Some(text.to_string()),
        provider_message_id: Some(message_id.to_string()),
        ..Default::default()
    }
}

pub fn inbound_at(
    message_id: &str,
    from: &str,
    subject: &str,
    text: &str,
    date: DateTime<Utc>,
) -> InboundEmail {
    InboundEmail {
        date: Some(date),
        ..inbound(message_id, from, subject, text)
    }
}

pub fn attachment(filename: &str, content: &[u8], content_type: &str) -> InboundAttachment {
    InboundAttachment {
        filename: filename.to_string(),
        content: content.to_vec(),
        content_type: content_type.to_string(),
        size: None,
    }
}
