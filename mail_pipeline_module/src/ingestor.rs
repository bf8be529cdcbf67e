//! Per-email orchestration: normalize, persist, extract attachments, embed,
//! maintain the index, check importance.
//!
//! Only persistence can fail an ingestion. Every later stage is fenced on its
//! own and never rolls back or blocks the stages before it.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::attachments::AttachmentExtractor;
use crate::config::ImportanceRules;
use crate::dual_store::{DualStore, DualStoreError, EmailDraft, PersistOutcome};
use crate::embedding_index::EmbeddingIndexer;
use crate::normalize::normalize_body;
use crate::notify::{NotificationEvent, Notifier};
use crate::record::{derive_email_id, normalize_address, normalize_message_id, InboundEmail};

const UNKNOWN_SENDER: &str = "unknown@unknown.invalid";
const NO_SUBJECT: &str = "(no subject)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Received,
    Normalized,
    Persisted,
    AttachmentsProcessed,
    Embedded,
    IndexMaintained,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentText {
    pub file_name: String,
    pub attachment_ref: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub email_id: Uuid,
    pub user_id: String,
    pub stages: Vec<IngestStage>,
    /// The message was already stored; nothing after persistence ran.
    pub duplicate: bool,
    pub attachments: Vec<AttachmentText>,
    pub index_ready: bool,
    pub important: bool,
}

impl IngestReport {
    pub fn reached(&self, stage: IngestStage) -> bool {
        self.stages.contains(&stage)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to persist email {email_id}: {source}")]
    Persist {
        email_id: Uuid,
        #[source]
        source: DualStoreError,
    },
}

#[derive(Clone)]
pub struct EmailIngestor {
    store: DualStore,
    extractor: AttachmentExtractor,
    indexer: EmbeddingIndexer,
    notifier: Arc<dyn Notifier>,
    importance: ImportanceRules,
    concurrency: usize,
}

impl EmailIngestor {
    pub fn new(
        store: DualStore,
        extractor: AttachmentExtractor,
        indexer: EmbeddingIndexer,
        notifier: Arc<dyn Notifier>,
        importance: ImportanceRules,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            extractor,
            indexer,
            notifier,
            importance,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn ingest(&self, user_id: &str, inbound: InboundEmail) -> Result<IngestReport, IngestError> {
        let mut stages = vec![IngestStage::Received];

        let draft = build_draft(user_id, &inbound);
        let email_id = draft.id;
        stages.push(IngestStage::Normalized);

        let mut report = IngestReport {
            email_id,
            user_id: user_id.to_string(),
            stages: Vec::new(),
            duplicate: false,
            attachments: Vec::new(),
            index_ready: false,
            important: false,
        };

        let (record, stored_attachments) = match self.store.persist(draft, &inbound.attachments).await {
            Ok(PersistOutcome::Stored {
                record,
                attachments,
            }) => (record, attachments),
            Ok(PersistOutcome::Duplicate { id }) => {
                stages.push(IngestStage::Persisted);
                report.email_id = id;
                report.duplicate = true;
                report.stages = stages;
                return Ok(report);
            }
            Err(source) => {
                error!("aborting ingestion of email {} for user {}: {}", email_id, user_id, source);
                return Err(IngestError::Persist { email_id, source });
            }
        };
        stages.push(IngestStage::Persisted);

        let mut extracted: Vec<(usize, AttachmentText)> = stream::iter(stored_attachments.into_iter().enumerate())
            .map(|(position, attachment)| {
                let extractor = &self.extractor;
                async move {
                    let text = extractor.extract(email_id, &attachment).await;
                    (
                        position,
                        AttachmentText {
                            file_name: attachment.file_name,
                            attachment_ref: attachment.key,
                            text,
                        },
                    )
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        extracted.sort_by_key(|(position, _)| *position);
        report.attachments = extracted.into_iter().map(|(_, text)| text).collect();
        stages.push(IngestStage::AttachmentsProcessed);

        match self.indexer.generate_embedding(user_id, email_id).await {
            Ok(()) => stages.push(IngestStage::Embedded),
            Err(err) => warn!("embedding failed for email {}: {}", email_id, err),
        }

        report.index_ready = self.indexer.maintain_index().await;
        stages.push(IngestStage::IndexMaintained);

        if let Some(reason) = importance_reason(
            &self.importance,
            &record.from_address,
            &record.subject,
            &record.body_text,
        ) {
            report.important = true;
            let event = NotificationEvent::ImportantEmail {
                user_id: user_id.to_string(),
                email_id,
                from_address: record.from_address.clone(),
                subject: record.subject.clone(),
                reason,
            };
            if let Err(err) = self.notifier.notify(&event).await {
                warn!("failed to send importance notification for {}: {}", email_id, err);
            }
        }

        info!(
            "ingested email {} for user {} ({} attachment(s), stages {:?})",
            email_id,
            user_id,
            report.attachments.len(),
            stages
        );
        report.stages = stages;
        Ok(report)
    }
}

fn build_draft(user_id: &str, inbound: &InboundEmail) -> EmailDraft {
    let from_address = inbound
        .from_addresses
        .iter()
        .find_map(|raw| normalize_address(raw))
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string());
    let subject = inbound
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|subject| !subject.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string();
    let body_text = normalize_body(
        inbound.text.as_deref(),
        inbound.html.as_deref(),
        inbound.subject.as_deref(),
    );
    let provider_message_id = inbound
        .provider_message_id
        .as_deref()
        .and_then(normalize_message_id);

    EmailDraft {
        id: derive_email_id(user_id, provider_message_id.as_deref()),
        user_id: user_id.to_string(),
        from_address,
        subject,
        body_text,
        timestamp: inbound.date.unwrap_or_else(Utc::now),
        provider_message_id,
        thread_id: inbound.thread_id.clone(),
        references: inbound.references.clone(),
    }
}

/// Why an email deserves an immediate alert, if it does.
pub fn importance_reason(
    rules: &ImportanceRules,
    from_address: &str,
    subject: &str,
    body: &str,
) -> Option<String> {
    let from = from_address.to_lowercase();
    if let Some(token) = rules
        .important_senders
        .iter()
        .find(|token| !token.is_empty() && from.contains(token.as_str()))
    {
        return Some(format!("sender matches \"{}\"", token));
    }

    let haystack = format!("{}\n{}", subject, body).to_lowercase();
    rules
        .urgent_keywords
        .iter()
        .find(|keyword| !keyword.is_empty() && contains_word(&haystack, keyword))
        .map(|keyword| format!("urgent keyword \"{}\"", keyword))
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
