use std::sync::Arc;

use chrono::Utc;
use model_gateway_module::{Embedder, ModelGatewayError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::IndexSettings;
use crate::dual_store::DualStore;
use crate::record::EmbeddingRecord;
use crate::warehouse::{run_blocking, WarehouseError};

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("email {0} not found")]
    EmailNotFound(Uuid),
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
    #[error("embedding service error: {0}")]
    Embedding(#[from] ModelGatewayError),
}

/// Writes one embedding per email and builds the approximate index once
/// enough rows exist.
#[derive(Clone)]
pub struct EmbeddingIndexer {
    store: DualStore,
    embedder: Arc<dyn Embedder>,
    settings: IndexSettings,
}

impl EmbeddingIndexer {
    pub fn new(store: DualStore, embedder: Arc<dyn Embedder>, settings: IndexSettings) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    /// Embeds the stored body of an email. Each call appends a row, so callers
    /// invoke this once per email.
    pub async fn generate_embedding(&self, user_id: &str, email_id: Uuid) -> Result<(), IndexerError> {
        let owner = user_id.to_string();
        let email = run_blocking(self.store.warehouse(), move |w| w.get_email(&owner, &email_id))
            .await?
            .ok_or(IndexerError::EmailNotFound(email_id))?;

        let body = truncate_chars(&email.body_text, self.settings.max_embedding_chars);
        let vector = self.embedder.embed(&body).await?;

        let record = EmbeddingRecord {
            email_id,
            body_text: body,
            vector,
            created_at: Utc::now(),
        };
        run_blocking(self.store.warehouse(), move |w| w.insert_embedding(&record)).await?;
        info!("stored embedding for email {}", email_id);
        Ok(())
    }

    /// Builds the approximate index if the corpus is large enough. `false`
    /// means no index was (re)built; queries keep using the fallback path.
    pub async fn maintain_index(&self) -> bool {
        let rows = match run_blocking(self.store.warehouse(), |w| w.count_embeddings()).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!("failed to count embeddings: {}", err);
                return false;
            }
        };

        if rows < self.settings.min_rows {
            info!(
                "{} embedded rows, need at least {} before building the vector index",
                rows, self.settings.min_rows
            );
            return false;
        }

        let lists = ivf_list_count(rows);
        match run_blocking(self.store.warehouse(), move |w| w.create_vector_index(lists)).await {
            Ok(()) => {
                info!("vector index ready ({} rows, {} lists)", rows, lists);
                true
            }
            Err(err) => {
                warn!("vector index creation failed: {}", err);
                false
            }
        }
    }
}

/// IVF list count for a corpus size: rows/1000 up to a million rows, then
/// sqrt(rows).
pub fn ivf_list_count(rows: i64) -> u32 {
    let rows = rows.max(0) as f64;
    let lists = if rows <= 1_000_000.0 {
        rows / 1000.0
    } else {
        rows.sqrt()
    };
    (lists.round() as u32).max(1)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
