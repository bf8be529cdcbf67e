use std::sync::Arc;

use chrono::Utc;
use model_gateway_module::{DocumentExtractor, DocumentInput};
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_store::BlobProperties;
use crate::config::AttachmentLimits;
use crate::dual_store::{AttachmentRef, DualStore};
use crate::record::{AttachmentRecord, ATTACHMENT_NOT_FOUND, ATTACHMENT_TOO_LARGE, EXTRACTION_FAILED};
use crate::warehouse::{await_durable, run_blocking, DurableHandle};

/// Turns stored attachment binaries into text, at most once per
/// `(email_id, attachment_ref)`.
#[derive(Clone)]
pub struct AttachmentExtractor {
    store: DualStore,
    documents: Arc<dyn DocumentExtractor>,
    limits: AttachmentLimits,
}

impl AttachmentExtractor {
    pub fn new(store: DualStore, documents: Arc<dyn DocumentExtractor>, limits: AttachmentLimits) -> Self {
        Self {
            store,
            documents,
            limits,
        }
    }

    /// Extracted text, or one of the attachment sentinels. Never fails.
    pub async fn extract(&self, email_id: Uuid, attachment: &AttachmentRef) -> String {
        let Some(properties) = self.finalized_properties(attachment).await else {
            return ATTACHMENT_NOT_FOUND.to_string();
        };

        if properties.size > self.limits.max_bytes {
            warn!(
                "attachment {} of email {} is {} bytes (cap {}); skipping extraction",
                attachment.key, email_id, properties.size, self.limits.max_bytes
            );
            let record = self.record(email_id, attachment, &properties, ATTACHMENT_TOO_LARGE);
            self.insert(record).await;
            return ATTACHMENT_TOO_LARGE.to_string();
        }

        let lookup_email = email_id;
        let lookup_ref = attachment.key.clone();
        match run_blocking(self.store.warehouse(), move |w| {
            w.find_attachment(&lookup_email, &lookup_ref)
        })
        .await
        {
            Ok(Some(existing)) => return existing.extracted_text,
            Ok(None) => {}
            Err(err) => {
                // Without the lookup we cannot rule out a previous extraction.
                warn!(
                    "attachment lookup failed for {} of email {}: {}",
                    attachment.key, email_id, err
                );
                return EXTRACTION_FAILED.to_string();
            }
        }

        let content = match self.store.blobs().get(&attachment.key).await {
            Ok(content) => content,
            Err(err) => {
                warn!("failed to download attachment {}: {}", attachment.key, err);
                return ATTACHMENT_NOT_FOUND.to_string();
            }
        };

        let content_type = if attachment.content_type.trim().is_empty() {
            properties.content_type.clone()
        } else {
            attachment.content_type.clone()
        };
        let extracted = match self
            .documents
            .extract_text(DocumentInput {
                file_name: &attachment.file_name,
                content_type: &content_type,
                content: &content,
            })
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("document service returned no text for {}", attachment.key);
                EXTRACTION_FAILED.to_string()
            }
            Err(err) => {
                warn!("document service failed for {}: {}", attachment.key, err);
                EXTRACTION_FAILED.to_string()
            }
        };

        let mut record = self.record(email_id, attachment, &properties, &extracted);
        record.content_type = content_type;
        if !self.insert(record).await {
            // Lost a race with a concurrent extraction; the stored row wins.
            let key = attachment.key.clone();
            if let Ok(Some(existing)) =
                run_blocking(self.store.warehouse(), move |w| w.find_attachment(&email_id, &key)).await
            {
                return existing.extracted_text;
            }
        }

        let handle = DurableHandle::Attachment {
            email_id,
            attachment_ref: attachment.key.clone(),
        };
        await_durable(
            self.store.warehouse(),
            &handle,
            self.limits.durability_timeout,
            self.limits.durability_poll,
        )
        .await;

        info!(
            "extracted {} chars from {} for email {}",
            extracted.len(),
            attachment.key,
            email_id
        );
        extracted
    }

    async fn finalized_properties(&self, attachment: &AttachmentRef) -> Option<BlobProperties> {
        match self.store.blobs().properties(&attachment.key).await {
            Ok(Some(properties)) if properties.last_modified <= Utc::now() => Some(properties),
            Ok(Some(_)) => {
                warn!("attachment {} is still being uploaded", attachment.key);
                None
            }
            Ok(None) => {
                warn!("attachment {} not found in storage", attachment.key);
                None
            }
            Err(err) => {
                warn!("failed to stat attachment {}: {}", attachment.key, err);
                None
            }
        }
    }

    fn record(
        &self,
        email_id: Uuid,
        attachment: &AttachmentRef,
        properties: &BlobProperties,
        extracted_text: &str,
    ) -> AttachmentRecord {
        AttachmentRecord {
            email_id,
            file_name: attachment.file_name.clone(),
            blob_uri: attachment.blob_uri.clone(),
            content_type: attachment.content_type.clone(),
            size: i64::try_from(properties.size).unwrap_or(i64::MAX),
            uploaded_at: properties.last_modified,
            attachment_ref: attachment.key.clone(),
            extracted_text: extracted_text.to_string(),
        }
    }

    /// `false` when the row already existed or could not be written.
    async fn insert(&self, record: AttachmentRecord) -> bool {
        let key = record.attachment_ref.clone();
        match run_blocking(self.store.warehouse(), move |w| w.insert_attachment(&record)).await {
            Ok(inserted) => inserted,
            Err(err) => {
                warn!("failed to record extraction for {}: {}", key, err);
                false
            }
        }
    }
}
