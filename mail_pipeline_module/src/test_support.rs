//! Fakes for the model services, shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use model_gateway_module::{
    CompletionRequest, DocumentExtractor, DocumentInput, Embedder, Generator, ModelGatewayError,
};

pub const FAKE_DIMENSIONS: usize = 64;

/// Bag-of-words hashing embedder: texts sharing words land close together.
#[derive(Debug, Default)]
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

pub fn fake_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; FAKE_DIMENSIONS];
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
        vector[(hash % FAKE_DIMENSIONS as u64) as usize] += 1.0;
    }
    vector
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelGatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ModelGatewayError::Status {
                status: 503,
                body: "embedding service down".to_string(),
            });
        }
        Ok(fake_embedding(text))
    }
}

#[derive(Debug)]
pub struct FakeGenerator {
    pub calls: AtomicUsize,
    response: Mutex<Option<String>>,
    pub last_request: Mutex<Option<CompletionRequest>>,
}

impl FakeGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: Mutex::new(Some(text.to_string())),
            last_request: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: Mutex::new(None),
            last_request: Mutex::new(None),
        }
    }

    pub fn last_prompt(&self) -> String {
        self.last_request
            .lock()
            .expect("lock")
            .as_ref()
            .map(|request| request.prompt.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelGatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().expect("lock") = Some(request.clone());
        self.response
            .lock()
            .expect("lock")
            .clone()
            .ok_or_else(|| ModelGatewayError::InvalidResponse("generation timed out".to_string()))
    }
}

#[derive(Debug, Default)]
pub struct FakeDocumentExtractor {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

#[async_trait]
impl DocumentExtractor for FakeDocumentExtractor {
    async fn extract_text(&self, document: DocumentInput<'_>) -> Result<String, ModelGatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ModelGatewayError::Status {
                status: 500,
                body: "cannot parse document".to_string(),
            });
        }
        Ok(format!(
            "{}: {}",
            document.file_name,
            String::from_utf8_lossy(document.content)
        ))
    }
}
