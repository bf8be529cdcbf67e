//! Email persistence across the blob store (bodies, attachment binaries) and
//! the warehouse (queryable metadata).
//!
//! Writes are ordered but not atomic: a crash between the blob writes and the
//! row insert leaves orphaned blobs, which readers never see because every
//! read starts from the warehouse row.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob_store::{BlobStore, BlobStoreError};
use crate::record::{
    is_sentinel, normalize_message_id, EmailRecord, InboundAttachment, ReplyRecord, ReplyTemplate,
    NO_CONTENT_AVAILABLE,
};
use crate::warehouse::{run_blocking, Warehouse, WarehouseError};

const BODY_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, thiserror::Error)]
pub enum DualStoreError {
    #[error("blob store error: {0}")]
    Blob(#[from] BlobStoreError),
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
    #[error("email {email_id} not found for user {user_id}")]
    EmailNotFound { user_id: String, email_id: Uuid },
}

/// Normalized email ready to be stored; blob URIs are filled in by `persist`.
#[derive(Debug, Clone)]
pub struct EmailDraft {
    pub id: Uuid,
    pub user_id: String,
    pub from_address: String,
    pub subject: String,
    pub body_text: String,
    pub timestamp: DateTime<Utc>,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub references: Vec<String>,
}

/// A stored attachment binary awaiting text extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRef {
    /// Blob path; unique per email.
    pub key: String,
    pub file_name: String,
    pub content_type: String,
    pub blob_uri: String,
}

#[derive(Debug, Clone)]
pub enum PersistOutcome {
    Stored {
        record: EmailRecord,
        attachments: Vec<AttachmentRef>,
    },
    /// A row with this id already exists; neither store was touched.
    Duplicate { id: Uuid },
}

#[derive(Clone)]
pub struct DualStore {
    blobs: Arc<dyn BlobStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl DualStore {
    pub fn new(blobs: Arc<dyn BlobStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { blobs, warehouse }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub async fn ensure_schema(&self) -> Result<(), DualStoreError> {
        run_blocking(&self.warehouse, |w| w.ensure_schema()).await?;
        Ok(())
    }

    pub async fn persist(
        &self,
        draft: EmailDraft,
        attachments: &[InboundAttachment],
    ) -> Result<PersistOutcome, DualStoreError> {
        let id = draft.id;
        if run_blocking(&self.warehouse, move |w| w.email_exists(&id)).await? {
            info!("email {} already stored; skipping redelivery", id);
            return Ok(PersistOutcome::Duplicate { id });
        }

        let base_id = blob_base_id(&draft);
        let body_path = body_blob_path(&base_id);
        let body_blob_uri = self
            .blobs
            .put(&body_path, draft.body_text.as_bytes().to_vec(), BODY_CONTENT_TYPE)
            .await
            .map_err(|err| {
                error!("failed to store body for email {}: {}", id, err);
                err
            })?;

        let mut stored_attachments = Vec::with_capacity(attachments.len());
        let mut used_names = HashSet::new();
        for attachment in attachments {
            let file_name = unique_file_name(&sanitize_file_name(&attachment.filename), &mut used_names);
            let path = attachment_blob_path(&base_id, &file_name);
            match self
                .blobs
                .put(&path, attachment.content.clone(), &attachment.content_type)
                .await
            {
                Ok(blob_uri) => stored_attachments.push(AttachmentRef {
                    key: path,
                    file_name: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    blob_uri,
                }),
                Err(err) => {
                    warn!(
                        "failed to store attachment {} for email {}: {}",
                        attachment.filename, id, err
                    );
                }
            }
        }

        let record = EmailRecord {
            id,
            user_id: draft.user_id,
            from_address: draft.from_address,
            subject: draft.subject,
            body_text: draft.body_text,
            timestamp: draft.timestamp,
            provider_message_id: draft.provider_message_id,
            thread_id: draft.thread_id,
            references: draft.references,
            body_blob_uri,
            attachment_blob_uris: stored_attachments
                .iter()
                .map(|attachment| attachment.blob_uri.clone())
                .collect(),
        };

        let row = record.clone();
        let inserted = run_blocking(&self.warehouse, move |w| w.insert_email(&row))
            .await
            .map_err(|err| {
                error!("failed to insert email {}: {}", id, err);
                err
            })?;
        if !inserted {
            info!("email {} was stored concurrently; treating as redelivery", id);
            return Ok(PersistOutcome::Duplicate { id });
        }

        info!(
            "stored email {} for user {} with {} attachment(s)",
            id,
            record.user_id,
            stored_attachments.len()
        );
        Ok(PersistOutcome::Stored {
            record,
            attachments: stored_attachments,
        })
    }

    /// Body text behind a blob URI, or the "No content available" sentinel.
    pub async fn get_body(&self, uri: &str) -> String {
        let path = match self.blobs.path_from_uri(uri) {
            Ok(path) => path,
            Err(err) => {
                warn!("unreadable body reference {}: {}", uri, err);
                return NO_CONTENT_AVAILABLE.to_string();
            }
        };
        match self.blobs.get(&path).await {
            Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|err| {
                warn!("body {} is not valid UTF-8: {}", uri, err);
                NO_CONTENT_AVAILABLE.to_string()
            }),
            Err(err) => {
                warn!("failed to read body {}: {}", uri, err);
                NO_CONTENT_AVAILABLE.to_string()
            }
        }
    }

    /// Stores a reply outcome; the original email must belong to `user_id`.
    pub async fn record_reply(&self, user_id: &str, reply: ReplyRecord) -> Result<(), DualStoreError> {
        let owner = user_id.to_string();
        let email_id = reply.original_email_id;
        let owned = run_blocking(&self.warehouse, move |w| w.get_email(&owner, &email_id))
            .await?
            .is_some();
        if !owned {
            warn!("refusing reply record for email {} not owned by user {}", email_id, user_id);
            return Err(DualStoreError::EmailNotFound {
                user_id: user_id.to_string(),
                email_id,
            });
        }
        run_blocking(&self.warehouse, move |w| w.insert_reply(&reply)).await?;
        Ok(())
    }

    pub async fn reply_template(&self, character_id: &str) -> Option<ReplyTemplate> {
        let character_id = character_id.to_string();
        match run_blocking(&self.warehouse, move |w| w.reply_template(&character_id)).await {
            Ok(template) => template,
            Err(err) => {
                warn!("failed to load reply template: {}", err);
                None
            }
        }
    }

    /// Extracted attachment texts for an email owned by `user_id`, sentinels
    /// excluded.
    pub async fn attachment_texts(&self, user_id: &str, email_id: Uuid) -> Vec<(String, String)> {
        let owner = user_id.to_string();
        match run_blocking(&self.warehouse, move |w| w.attachment_records(&owner, &email_id)).await {
            Ok(rows) => rows
                .into_iter()
                .filter(|row| !row.extracted_text.trim().is_empty() && !is_sentinel(&row.extracted_text))
                .map(|row| (row.file_name, row.extracted_text))
                .collect(),
            Err(err) => {
                warn!("failed to load attachments for email {}: {}", email_id, err);
                Vec::new()
            }
        }
    }
}

/// `<user>/<message id>`, both url-encoded, so two users receiving the same
/// message never share blobs.
fn blob_base_id(draft: &EmailDraft) -> String {
    let raw = draft
        .provider_message_id
        .as_deref()
        .and_then(normalize_message_id)
        .unwrap_or_else(|| draft.id.to_string());
    format!(
        "{}/{}",
        urlencoding::encode(&draft.user_id),
        urlencoding::encode(&raw)
    )
}

pub fn body_blob_path(base_id: &str) -> String {
    format!("body/{}_body.txt", base_id)
}

pub fn attachment_blob_path(base_id: &str, file_name: &str) -> String {
    format!("attachments/{}_{}", base_id, file_name)
}

pub fn sanitize_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

fn unique_file_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    let mut counter = 1;
    loop {
        let candidate = format!("{}-{}{}", stem, counter, extension);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::warehouse::MemoryWarehouse;

    fn draft(message_id: Option<&str>, body: &str) -> EmailDraft {
        draft_for("user-1", message_id, body)
    }

    fn draft_for(user_id: &str, message_id: Option<&str>, body: &str) -> EmailDraft {
        EmailDraft {
            id: crate::record::derive_email_id(user_id, message_id),
            user_id: user_id.to_string(),
            from_address: "alice@example.com".to_string(),
            subject: "Quarterly numbers".to_string(),
            body_text: body.to_string(),
            timestamp: Utc::now(),
            provider_message_id: message_id.map(str::to_string),
            thread_id: None,
            references: Vec::new(),
        }
    }

    fn attachment(name: &str, content: &[u8]) -> InboundAttachment {
        InboundAttachment {
            filename: name.to_string(),
            content: content.to_vec(),
            content_type: "text/plain".to_string(),
            size: None,
        }
    }

    fn stores() -> (Arc<MemoryBlobStore>, Arc<MemoryWarehouse>, DualStore) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let store = DualStore::new(blobs.clone(), warehouse.clone());
        (blobs, warehouse, store)
    }

    #[test]
    fn sanitize_file_name_replaces_unsafe_characters() {
        assert_eq!(sanitize_file_name("Q3 report (final).pdf"), "Q3_report__final_.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("  "), "attachment");
    }

    #[test]
    fn unique_file_name_suffixes_collisions() {
        let mut used = HashSet::new();
        assert_eq!(unique_file_name("a.pdf", &mut used), "a.pdf");
        assert_eq!(unique_file_name("a.pdf", &mut used), "a-1.pdf");
        assert_eq!(unique_file_name("a.pdf", &mut used), "a-2.pdf");
        assert_eq!(unique_file_name("notes", &mut used), "notes");
        assert_eq!(unique_file_name("notes", &mut used), "notes-1");
    }

    #[tokio::test]
    async fn persist_then_get_body_round_trips() {
        let (blobs, _warehouse, store) = stores();
        let body = "Grüße, the numbers are attached.";
        let outcome = store
            .persist(
                draft(Some("<m1@example.com>"), body),
                &[attachment("a b.txt", b"one"), attachment("a b.txt", b"two")],
            )
            .await
            .expect("persist");

        let PersistOutcome::Stored { record, attachments } = outcome else {
            panic!("expected stored outcome");
        };
        assert_eq!(record.body_blob_uri, "memory://body/user-1/m1%40example.com_body.txt");
        assert_eq!(store.get_body(&record.body_blob_uri).await, body);
        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[1].key, "attachments/user-1/m1%40example.com_a_b-1.txt");
        assert_eq!(record.attachment_blob_uris.len(), 2);
        assert_eq!(blobs.paths().len(), 3);
    }

    #[tokio::test]
    async fn persist_skips_redelivered_message() {
        let (blobs, warehouse, store) = stores();
        store
            .persist(draft(Some("m2@example.com"), "first"), &[])
            .await
            .expect("first persist");
        let outcome = store
            .persist(
                draft(Some("<M2@example.com>"), "second"),
                &[attachment("x.txt", b"x")],
            )
            .await
            .expect("second persist");

        assert!(matches!(outcome, PersistOutcome::Duplicate { .. }));
        assert_eq!(warehouse.email_rows(), 1);
        assert_eq!(blobs.paths().len(), 1);
    }

    #[tokio::test]
    async fn same_message_is_stored_separately_per_user() {
        let (blobs, warehouse, store) = stores();
        let first = store
            .persist(draft_for("user-a", Some("<shared-1@x.com>"), "for a"), &[])
            .await
            .expect("persist for a");
        let second = store
            .persist(draft_for("user-b", Some("<shared-1@x.com>"), "for b"), &[])
            .await
            .expect("persist for b");

        let (PersistOutcome::Stored { record: a, .. }, PersistOutcome::Stored { record: b, .. }) =
            (first, second)
        else {
            panic!("expected both deliveries to be stored");
        };
        assert_ne!(a.id, b.id);
        assert_ne!(a.body_blob_uri, b.body_blob_uri);
        assert_eq!(store.get_body(&a.body_blob_uri).await, "for a");
        assert_eq!(store.get_body(&b.body_blob_uri).await, "for b");
        assert_eq!(warehouse.email_rows(), 2);
        assert_eq!(blobs.paths().len(), 2);
    }

    #[tokio::test]
    async fn record_reply_requires_the_email_owner() {
        let (_blobs, warehouse, store) = stores();
        let PersistOutcome::Stored { record, .. } = store
            .persist(draft(Some("m3@example.com"), "question"), &[])
            .await
            .expect("persist")
        else {
            panic!("expected stored outcome");
        };
        let reply = ReplyRecord {
            id: Uuid::new_v4(),
            original_email_id: record.id,
            reply_subject: "Re: Quarterly numbers".to_string(),
            reply_body: "Thanks".to_string(),
            timestamp: Utc::now(),
            sent_success: true,
        };

        let refused = store.record_reply("intruder", reply.clone()).await;
        assert!(matches!(refused, Err(DualStoreError::EmailNotFound { .. })));
        assert!(warehouse.replies().is_empty());

        store.record_reply("user-1", reply).await.expect("owner records");
        assert_eq!(warehouse.replies().len(), 1);
    }

    #[tokio::test]
    async fn persist_fails_when_body_cannot_be_stored() {
        let (blobs, warehouse, store) = stores();
        blobs.set_offline(true);
        let result = store.persist(draft(None, "body"), &[]).await;
        assert!(matches!(result, Err(DualStoreError::Blob(_))));
        assert_eq!(warehouse.email_rows(), 0);
    }

    #[tokio::test]
    async fn get_body_returns_sentinel_on_failure() {
        let (_blobs, _warehouse, store) = stores();
        assert_eq!(store.get_body("memory://body/missing").await, NO_CONTENT_AVAILABLE);
        assert_eq!(store.get_body("ftp://elsewhere").await, NO_CONTENT_AVAILABLE);
    }
}
