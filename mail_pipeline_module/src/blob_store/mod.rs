//! Path-addressable storage for email bodies and attachment binaries.

mod azure;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use azure::AzureBlobStore;
pub use memory::MemoryBlobStore;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("missing AZURE_STORAGE_CONNECTION_STRING")]
    MissingConnectionString,
    #[error("missing AZURE_STORAGE_CONTAINER")]
    MissingContainer,
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("invalid blob reference: {0}")]
    InvalidReference(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
    #[error("azure error: {0}")]
    Azure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobProperties {
    pub size: u64,
    pub content_type: String,
    /// When the last write to the blob was committed.
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn uri_for(&self, path: &str) -> String;

    fn path_from_uri(&self, uri: &str) -> Result<String, BlobStoreError>;

    /// Writes (or overwrites) a blob and returns its URI.
    async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobStoreError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobStoreError>;

    /// `None` when no blob exists at `path`.
    async fn properties(&self, path: &str) -> Result<Option<BlobProperties>, BlobStoreError>;
}

pub(crate) fn parse_blob_uri(
    uri: &str,
    scheme: &str,
    container: &str,
) -> Result<String, BlobStoreError> {
    let prefix = format!("{}://", scheme);
    let rest = uri
        .strip_prefix(&prefix)
        .ok_or_else(|| BlobStoreError::InvalidReference(uri.to_string()))?;
    let path = if container.is_empty() {
        rest
    } else {
        let mut parts = rest.splitn(2, '/');
        let found = parts.next().unwrap_or("");
        if found != container {
            return Err(BlobStoreError::InvalidReference(uri.to_string()));
        }
        parts.next().unwrap_or("")
    };
    let path = path.trim();
    if path.is_empty() {
        return Err(BlobStoreError::InvalidReference(uri.to_string()));
    }
    Ok(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blob_uri_checks_scheme_and_container() {
        assert_eq!(
            parse_blob_uri("azblob://mail/body/x_body.txt", "azblob", "mail").unwrap(),
            "body/x_body.txt"
        );
        assert!(parse_blob_uri("azblob://other/body/x", "azblob", "mail").is_err());
        assert!(parse_blob_uri("s3://mail/body/x", "azblob", "mail").is_err());
        assert!(parse_blob_uri("azblob://mail/", "azblob", "mail").is_err());
        assert_eq!(
            parse_blob_uri("memory://attachments/a.pdf", "memory", "").unwrap(),
            "attachments/a.pdf"
        );
    }
}
