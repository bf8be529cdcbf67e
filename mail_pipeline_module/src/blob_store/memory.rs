use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{parse_blob_uri, BlobProperties, BlobStore, BlobStoreError};

const URI_SCHEME: &str = "memory";

#[derive(Debug, Clone)]
struct StoredBlob {
    content: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// Process-local blob store, used for tests and local runs without Azure.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, StoredBlob>>,
    offline: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Stores a blob with an explicit commit time (a future time models an
    /// upload that has not been finalized yet).
    pub fn insert_at(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: &str,
        last_modified: DateTime<Utc>,
    ) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(
                path.to_string(),
                StoredBlob {
                    content,
                    content_type: content_type.to_string(),
                    last_modified,
                },
            );
        }
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .blobs
            .lock()
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    fn check_online(&self) -> Result<(), BlobStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredBlob>>, BlobStoreError> {
        self.blobs
            .lock()
            .map_err(|_| BlobStoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn uri_for(&self, path: &str) -> String {
        format!("{}://{}", URI_SCHEME, path)
    }

    fn path_from_uri(&self, uri: &str) -> Result<String, BlobStoreError> {
        parse_blob_uri(uri, URI_SCHEME, "")
    }

    async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobStoreError> {
        self.check_online()?;
        self.lock()?.insert(
            path.to_string(),
            StoredBlob {
                content,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(self.uri_for(path))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.check_online()?;
        self.lock()?
            .get(path)
            .map(|blob| blob.content.clone())
            .ok_or_else(|| BlobStoreError::NotFound(path.to_string()))
    }

    async fn properties(&self, path: &str) -> Result<Option<BlobProperties>, BlobStoreError> {
        self.check_online()?;
        Ok(self.lock()?.get(path).map(|blob| BlobProperties {
            size: blob.content.len() as u64,
            content_type: blob.content_type.clone(),
            last_modified: blob.last_modified,
        }))
    }
}
