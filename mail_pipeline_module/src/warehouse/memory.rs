use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{cosine_distance, Consistency, Neighbor, Warehouse, WarehouseError};
use crate::record::{AttachmentRecord, EmailRecord, EmbeddingRecord, ReplyRecord, ReplyTemplate};

#[derive(Debug, Default)]
struct Tables {
    emails: Vec<(EmailRecord, DateTime<Utc>)>,
    attachments: Vec<(AttachmentRecord, Instant)>,
    embeddings: Vec<EmbeddingRecord>,
    replies: Vec<ReplyRecord>,
    templates: Vec<(String, ReplyTemplate)>,
    index_created: bool,
}

/// In-process warehouse used by tests and local runs.
///
/// A visibility lag makes attachment rows readable only some time after they
/// were written, the way an eventually consistent warehouse behaves.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<Tables>,
    offline: AtomicBool,
    visibility_lag: Option<Duration>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_lag(lag: Duration) -> Self {
        Self {
            visibility_lag: Some(lag),
            ..Self::default()
        }
    }

    /// Inserts an email row with an explicit storage time.
    pub fn insert_email_created_at(
        &self,
        record: &EmailRecord,
        created_at: DateTime<Utc>,
    ) -> Result<bool, WarehouseError> {
        let mut tables = self.tables()?;
        if tables.emails.iter().any(|(email, _)| email.id == record.id) {
            return Ok(false);
        }
        tables.emails.push((record.clone(), created_at));
        Ok(true)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn put_reply_template(&self, character_id: &str, template: ReplyTemplate) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.templates.retain(|(id, _)| id != character_id);
            tables.templates.push((character_id.to_string(), template));
        }
    }

    pub fn embedding_rows(&self) -> usize {
        self.tables.lock().map(|t| t.embeddings.len()).unwrap_or(0)
    }

    pub fn email_rows(&self) -> usize {
        self.tables.lock().map(|t| t.emails.len()).unwrap_or(0)
    }

    pub fn replies(&self) -> Vec<ReplyRecord> {
        self.tables
            .lock()
            .map(|t| t.replies.clone())
            .unwrap_or_default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, WarehouseError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(WarehouseError::Unavailable("memory warehouse offline".to_string()));
        }
        self.tables
            .lock()
            .map_err(|_| WarehouseError::Unavailable("memory warehouse lock poisoned".to_string()))
    }
}

fn newest_first(mut rows: Vec<EmailRecord>, limit: usize) -> Vec<EmailRecord> {
    rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    rows.truncate(limit);
    rows
}

impl Warehouse for MemoryWarehouse {
    fn consistency(&self) -> Consistency {
        match self.visibility_lag {
            Some(_) => Consistency::Eventual,
            None => Consistency::Synchronous,
        }
    }

    fn ensure_schema(&self) -> Result<(), WarehouseError> {
        self.tables().map(|_| ())
    }

    fn email_exists(&self, id: &Uuid) -> Result<bool, WarehouseError> {
        Ok(self.tables()?.emails.iter().any(|(email, _)| &email.id == id))
    }

    fn insert_email(&self, record: &EmailRecord) -> Result<bool, WarehouseError> {
        self.insert_email_created_at(record, Utc::now())
    }

    fn get_email(&self, user_id: &str, id: &Uuid) -> Result<Option<EmailRecord>, WarehouseError> {
        Ok(self
            .tables()?
            .emails
            .iter()
            .find(|(email, _)| email.user_id == user_id && &email.id == id)
            .map(|(email, _)| email.clone()))
    }

    fn list_recent(
        &self,
        user_id: &str,
        limit: usize,
        exclude: Option<&Uuid>,
    ) -> Result<Vec<EmailRecord>, WarehouseError> {
        let rows = self
            .tables()?
            .emails
            .iter()
            .filter(|(email, _)| email.user_id == user_id && Some(&email.id) != exclude)
            .map(|(email, _)| email.clone())
            .collect();
        Ok(newest_first(rows, limit))
    }

    fn find_by_address(
        &self,
        user_id: &str,
        address: &str,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, WarehouseError> {
        let rows = self
            .tables()?
            .emails
            .iter()
            .filter(|(email, _)| {
                email.user_id == user_id && email.from_address.eq_ignore_ascii_case(address)
            })
            .map(|(email, _)| email.clone())
            .collect();
        Ok(newest_first(rows, limit))
    }

    fn search_body(
        &self,
        user_id: &str,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, WarehouseError> {
        let needle = needle.to_lowercase();
        let rows = self
            .tables()?
            .emails
            .iter()
            .filter(|(email, _)| {
                email.user_id == user_id && email.body_text.to_lowercase().contains(&needle)
            })
            .map(|(email, _)| email.clone())
            .collect();
        Ok(newest_first(rows, limit))
    }

    fn new_email_counts_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>, WarehouseError> {
        let mut counts: Vec<(String, i64)> = Vec::new();
        for (email, created_at) in self.tables()?.emails.iter() {
            if *created_at <= since || *created_at > until {
                continue;
            }
            match counts.iter_mut().find(|(user, _)| user == &email.user_id) {
                Some((_, count)) => *count += 1,
                None => counts.push((email.user_id.clone(), 1)),
            }
        }
        counts.sort();
        Ok(counts)
    }

    fn find_attachment(
        &self,
        email_id: &Uuid,
        attachment_ref: &str,
    ) -> Result<Option<AttachmentRecord>, WarehouseError> {
        let now = Instant::now();
        Ok(self
            .tables()?
            .attachments
            .iter()
            .find(|(row, visible_at)| {
                &row.email_id == email_id && row.attachment_ref == attachment_ref && *visible_at <= now
            })
            .map(|(row, _)| row.clone()))
    }

    fn insert_attachment(&self, record: &AttachmentRecord) -> Result<bool, WarehouseError> {
        let lag = self.visibility_lag.unwrap_or_default();
        let mut tables = self.tables()?;
        let exists = tables.attachments.iter().any(|(row, _)| {
            row.email_id == record.email_id && row.attachment_ref == record.attachment_ref
        });
        if exists {
            return Ok(false);
        }
        tables
            .attachments
            .push((record.clone(), Instant::now() + lag));
        Ok(true)
    }

    fn attachment_records(
        &self,
        user_id: &str,
        email_id: &Uuid,
    ) -> Result<Vec<AttachmentRecord>, WarehouseError> {
        let now = Instant::now();
        let tables = self.tables()?;
        let owned = tables
            .emails
            .iter()
            .any(|(email, _)| &email.id == email_id && email.user_id == user_id);
        if !owned {
            return Ok(Vec::new());
        }
        let rows = tables
            .attachments
            .iter()
            .filter(|(row, visible_at)| &row.email_id == email_id && *visible_at <= now)
            .map(|(row, _)| row.clone())
            .collect();
        Ok(rows)
    }

    fn insert_embedding(&self, record: &EmbeddingRecord) -> Result<(), WarehouseError> {
        self.tables()?.embeddings.push(record.clone());
        Ok(())
    }

    fn embedding_for(
        &self,
        user_id: &str,
        email_id: &Uuid,
    ) -> Result<Option<Vec<f32>>, WarehouseError> {
        let tables = self.tables()?;
        let owned = tables
            .emails
            .iter()
            .any(|(email, _)| email.user_id == user_id && &email.id == email_id);
        if !owned {
            return Ok(None);
        }
        Ok(tables
            .embeddings
            .iter()
            .filter(|row| &row.email_id == email_id)
            .max_by_key(|row| row.created_at)
            .map(|row| row.vector.clone()))
    }

    fn count_embeddings(&self) -> Result<i64, WarehouseError> {
        Ok(self
            .tables()?
            .embeddings
            .iter()
            .filter(|row| !row.vector.is_empty())
            .count() as i64)
    }

    fn vector_index_exists(&self) -> Result<bool, WarehouseError> {
        Ok(self.tables()?.index_created)
    }

    fn create_vector_index(&self, _lists: u32) -> Result<(), WarehouseError> {
        self.tables()?.index_created = true;
        Ok(())
    }

    fn nearest_neighbors(
        &self,
        user_id: &str,
        query: &[f32],
        exclude: Option<&Uuid>,
        limit: usize,
    ) -> Result<Vec<Neighbor>, WarehouseError> {
        let tables = self.tables()?;
        let mut neighbors: Vec<Neighbor> = tables
            .embeddings
            .iter()
            .filter(|row| Some(&row.email_id) != exclude)
            .filter_map(|row| {
                let (email, _) = tables
                    .emails
                    .iter()
                    .find(|(email, _)| email.id == row.email_id && email.user_id == user_id)?;
                let distance = cosine_distance(query, &row.vector)?;
                Some(Neighbor {
                    email: email.clone(),
                    distance,
                })
            })
            .collect();
        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    fn insert_reply(&self, record: &ReplyRecord) -> Result<(), WarehouseError> {
        self.tables()?.replies.push(record.clone());
        Ok(())
    }

    fn reply_template(&self, character_id: &str) -> Result<Option<ReplyTemplate>, WarehouseError> {
        Ok(self
            .tables()?
            .templates
            .iter()
            .find(|(id, _)| id == character_id)
            .map(|(_, template)| template.clone()))
    }
}
