//! Structured store for email metadata, attachment extractions, embeddings
//! and replies.
//!
//! The trait is synchronous (the Postgres client is blocking); async callers
//! go through [`run_blocking`].

mod memory;
mod postgres;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::record::{AttachmentRecord, EmailRecord, EmbeddingRecord, ReplyRecord, ReplyTemplate};

pub use self::memory::MemoryWarehouse;
pub use self::postgres::{PostgresWarehouse, WarehouseSettings};

pub const VECTOR_INDEX_NAME: &str = "email_embeddings_ivfflat_idx";

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("postgres error: {0}")]
    Postgres(#[from] ::postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("missing WAREHOUSE_DB_URL/DATABASE_URL")]
    MissingDbUrl,
    #[error("invalid warehouse schema name: {0}")]
    InvalidSchemaName(String),
    #[error("warehouse config error: {0}")]
    Config(String),
    #[error("invalid vector literal: {0}")]
    InvalidVector(String),
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
    #[error("blocking task failed: {0}")]
    Join(String),
}

/// How soon a committed write becomes visible to other readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Synchronous,
    Eventual,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub email: EmailRecord,
    pub distance: f64,
}

pub trait Warehouse: Send + Sync {
    fn consistency(&self) -> Consistency {
        Consistency::Synchronous
    }

    /// Creates whichever tables, extension and constraints are missing.
    fn ensure_schema(&self) -> Result<(), WarehouseError>;

    fn email_exists(&self, id: &Uuid) -> Result<bool, WarehouseError>;
    /// Returns `false` when a row with the same id already exists.
    fn insert_email(&self, record: &EmailRecord) -> Result<bool, WarehouseError>;
    fn get_email(&self, user_id: &str, id: &Uuid) -> Result<Option<EmailRecord>, WarehouseError>;
    fn list_recent(
        &self,
        user_id: &str,
        limit: usize,
        exclude: Option<&Uuid>,
    ) -> Result<Vec<EmailRecord>, WarehouseError>;
    fn find_by_address(
        &self,
        user_id: &str,
        address: &str,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, WarehouseError>;
    /// Case-insensitive substring match on the inline body, newest first.
    fn search_body(
        &self,
        user_id: &str,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<EmailRecord>, WarehouseError>;
    /// Per-user count of emails stored in `(since, until]`.
    fn new_email_counts_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(String, i64)>, WarehouseError>;

    fn find_attachment(
        &self,
        email_id: &Uuid,
        attachment_ref: &str,
    ) -> Result<Option<AttachmentRecord>, WarehouseError>;
    /// Returns `false` when the `(email_id, attachment_ref)` pair already exists.
    fn insert_attachment(&self, record: &AttachmentRecord) -> Result<bool, WarehouseError>;
    /// Attachment rows of an email, empty unless the email belongs to `user_id`.
    fn attachment_records(
        &self,
        user_id: &str,
        email_id: &Uuid,
    ) -> Result<Vec<AttachmentRecord>, WarehouseError>;

    fn insert_embedding(&self, record: &EmbeddingRecord) -> Result<(), WarehouseError>;
    fn embedding_for(
        &self,
        user_id: &str,
        email_id: &Uuid,
    ) -> Result<Option<Vec<f32>>, WarehouseError>;
    fn count_embeddings(&self) -> Result<i64, WarehouseError>;
    fn vector_index_exists(&self) -> Result<bool, WarehouseError>;
    fn create_vector_index(&self, lists: u32) -> Result<(), WarehouseError>;
    /// Cosine nearest neighbours among the user's emails, ascending distance.
    fn nearest_neighbors(
        &self,
        user_id: &str,
        query: &[f32],
        exclude: Option<&Uuid>,
        limit: usize,
    ) -> Result<Vec<Neighbor>, WarehouseError>;

    fn insert_reply(&self, record: &ReplyRecord) -> Result<(), WarehouseError>;
    fn reply_template(&self, character_id: &str) -> Result<Option<ReplyTemplate>, WarehouseError>;
}

/// Runs a warehouse call on the blocking pool.
pub async fn run_blocking<T, F>(warehouse: &Arc<dyn Warehouse>, op: F) -> Result<T, WarehouseError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Warehouse) -> Result<T, WarehouseError> + Send + 'static,
{
    let warehouse = Arc::clone(warehouse);
    task::spawn_blocking(move || op(warehouse.as_ref()))
        .await
        .map_err(|e| {
            error!("spawn_blocking panicked: {}", e);
            WarehouseError::Join(e.to_string())
        })?
}

/// A write whose visibility can be awaited.
#[derive(Debug, Clone, PartialEq)]
pub enum DurableHandle {
    Attachment { email_id: Uuid, attachment_ref: String },
}

/// Waits until `handle` is readable, polling every `poll` up to `timeout`.
///
/// Returns immediately on synchronously consistent warehouses. A timeout or a
/// failing poll is logged and reported as `false`; callers carry on either way.
pub async fn await_durable(
    warehouse: &Arc<dyn Warehouse>,
    handle: &DurableHandle,
    timeout: Duration,
    poll: Duration,
) -> bool {
    if warehouse.consistency() == Consistency::Synchronous {
        return true;
    }

    let deadline = Instant::now() + timeout;
    loop {
        let pending = handle.clone();
        let visible = run_blocking(warehouse, move |w| match &pending {
            DurableHandle::Attachment {
                email_id,
                attachment_ref,
            } => w
                .find_attachment(email_id, attachment_ref)
                .map(|row| row.is_some()),
        })
        .await;

        match visible {
            Ok(true) => return true,
            Ok(false) => debug!("waiting for {:?} to become visible", handle),
            Err(err) => warn!("durability poll for {:?} failed: {}", handle, err),
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(
                "{:?} not visible after {}s; continuing without it",
                handle,
                timeout.as_secs()
            );
            return false;
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

pub(crate) fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0f64;
    let mut norm_a = 0f64;
    let mut norm_b = 0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(1.0 - dot / (norm_a.sqrt() * norm_b.sqrt()))
}
