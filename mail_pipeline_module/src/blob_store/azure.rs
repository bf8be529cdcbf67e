use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::{parse_blob_uri, BlobProperties, BlobStore, BlobStoreError};

const URI_SCHEME: &str = "azblob";

/// Azure Blob Storage container holding bodies and attachments.
#[derive(Clone)]
pub struct AzureBlobStore {
    container_client: Arc<ContainerClient>,
    container_name: String,
}

/// Parse a connection string into (account_name, account_key)
fn parse_connection_string(connection_string: &str) -> Result<(String, String), BlobStoreError> {
    let mut account_name = None;
    let mut account_key = None;

    for part in connection_string.split(';') {
        if let Some(val) = part.strip_prefix("AccountName=") {
            account_name = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("AccountKey=") {
            account_key = Some(val.to_string());
        }
    }

    match (account_name, account_key) {
        (Some(name), Some(key)) => Ok((name, key)),
        _ => Err(BlobStoreError::InvalidConnectionString(
            "missing AccountName or AccountKey".to_string(),
        )),
    }
}

fn is_not_found(message: &str) -> bool {
    message.contains("BlobNotFound") || message.contains("404")
}

impl AzureBlobStore {
    pub fn from_env() -> Result<Self, BlobStoreError> {
        let connection_string = env::var("AZURE_STORAGE_CONNECTION_STRING")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(BlobStoreError::MissingConnectionString)?;

        let container_name = env::var("AZURE_STORAGE_CONTAINER")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(BlobStoreError::MissingContainer)?;

        Self::new(&connection_string, &container_name)
    }

    pub fn new(connection_string: &str, container_name: &str) -> Result<Self, BlobStoreError> {
        let (account_name, account_key) = parse_connection_string(connection_string)?;

        let storage_credentials = StorageCredentials::access_key(&account_name, account_key);

        let container_client = Arc::new(
            BlobServiceClient::new(&account_name, storage_credentials)
                .container_client(container_name),
        );

        Ok(Self {
            container_client,
            container_name: container_name.to_string(),
        })
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    fn uri_for(&self, path: &str) -> String {
        format!("{}://{}/{}", URI_SCHEME, self.container_name, path)
    }

    fn path_from_uri(&self, uri: &str) -> Result<String, BlobStoreError> {
        parse_blob_uri(uri, URI_SCHEME, &self.container_name)
    }

    async fn put(
        &self,
        path: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BlobStoreError> {
        let size = content.len();
        self.container_client
            .blob_client(path)
            .put_block_blob(content)
            .content_type(content_type.to_string())
            .await
            .map_err(|e| {
                error!("Failed to write blob {}: {}", path, e);
                BlobStoreError::Azure(e.to_string())
            })?;

        info!("Wrote blob {} ({} bytes)", path, size);
        Ok(self.uri_for(path))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobStoreError> {
        match self.container_client.blob_client(path).get_content().await {
            Ok(data) => Ok(data),
            Err(e) => {
                let error_str = e.to_string();
                if is_not_found(&error_str) {
                    Err(BlobStoreError::NotFound(path.to_string()))
                } else {
                    error!("Failed to read blob {}: {}", path, e);
                    Err(BlobStoreError::Azure(error_str))
                }
            }
        }
    }

    async fn properties(&self, path: &str) -> Result<Option<BlobProperties>, BlobStoreError> {
        match self.container_client.blob_client(path).get_properties().await {
            Ok(response) => {
                let properties = response.blob.properties;
                let last_modified = DateTime::<Utc>::from_timestamp(
                    properties.last_modified.unix_timestamp(),
                    properties.last_modified.nanosecond(),
                )
                .unwrap_or_else(Utc::now);
                Ok(Some(BlobProperties {
                    size: properties.content_length,
                    content_type: properties.content_type,
                    last_modified,
                }))
            }
            Err(e) => {
                let error_str = e.to_string();
                if is_not_found(&error_str) {
                    Ok(None)
                } else {
                    Err(BlobStoreError::Azure(error_str))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connection_string_extracts_account() {
        let (name, key) = parse_connection_string(
            "DefaultEndpointsProtocol=https;AccountName=mailstore;AccountKey=abc==;EndpointSuffix=core.windows.net",
        )
        .expect("parse");
        assert_eq!(name, "mailstore");
        assert_eq!(key, "abc==");
        assert!(parse_connection_string("AccountName=only").is_err());
    }

    #[test]
    fn uri_round_trips_through_container() {
        let store = AzureBlobStore::new("AccountName=acct;AccountKey=a2V5", "mail").expect("store");
        let uri = store.uri_for("attachments/abc_report.pdf");
        assert_eq!(uri, "azblob://mail/attachments/abc_report.pdf");
        assert_eq!(
            store.path_from_uri(&uri).expect("path"),
            "attachments/abc_report.pdf"
        );
    }

    #[tokio::test]
    #[ignore] // Requires Azure credentials
    async fn test_blob_store_roundtrip() {
        dotenvy::dotenv().ok();
        let store = AzureBlobStore::from_env().expect("AzureBlobStore::from_env");

        let path = format!("test/{}_body.txt", uuid::Uuid::new_v4());
        let uri = store
            .put(&path, b"hello blob".to_vec(), "text/plain; charset=utf-8")
            .await
            .expect("put");
        let read_back = store
            .get(&store.path_from_uri(&uri).expect("path"))
            .await
            .expect("get");
        assert_eq!(read_back, b"hello blob");

        let properties = store.properties(&path).await.expect("properties");
        assert_eq!(properties.map(|p| p.size), Some(10));
    }
}
