//! Two-mode email retrieval: cosine nearest neighbours once the vector index
//! exists, recency/substring search before that. Callers cannot tell the
//! modes apart except through `distance`.

use std::sync::Arc;

use futures::future::join_all;
use model_gateway_module::Embedder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetrievalSettings;
use crate::dual_store::DualStore;
use crate::record::{normalize_address, EmailRecord, NO_CONTENT_AVAILABLE};
use crate::warehouse::{run_blocking, Neighbor, WarehouseError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedEmail {
    pub email: EmailRecord,
    /// Cosine distance to the query; `None` for recency/substring results.
    pub distance: Option<f64>,
}

#[derive(Clone)]
pub struct RetrievalEngine {
    store: DualStore,
    embedder: Arc<dyn Embedder>,
    settings: RetrievalSettings,
}

impl RetrievalEngine {
    pub fn new(store: DualStore, embedder: Arc<dyn Embedder>, settings: RetrievalSettings) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    pub fn default_top_k(&self) -> usize {
        self.settings.top_k
    }

    pub async fn list_recent(&self, user_id: &str, limit: usize) -> Vec<RetrievedEmail> {
        let owner = user_id.to_string();
        let limit = self.limit_or_default(limit);
        let rows = run_blocking(self.store.warehouse(), move |w| w.list_recent(&owner, limit, None)).await;
        self.rehydrate_records(rows, "list_recent").await
    }

    /// Emails whose sender equals `address` (case-insensitive), newest first.
    pub async fn find_by_address(&self, address: &str, user_id: &str, limit: usize) -> Vec<RetrievedEmail> {
        let address = normalize_address(address).unwrap_or_else(|| address.trim().to_lowercase());
        let owner = user_id.to_string();
        let limit = self.limit_or_default(limit);
        let rows = run_blocking(self.store.warehouse(), move |w| {
            w.find_by_address(&owner, &address, limit)
        })
        .await;
        self.rehydrate_records(rows, "find_by_address").await
    }

    pub async fn find_similar_by_id(&self, email_id: Uuid, user_id: &str, top_k: usize) -> Vec<RetrievedEmail> {
        let top_k = self.limit_or_default(top_k);
        if self.index_ready().await {
            let owner = user_id.to_string();
            match run_blocking(self.store.warehouse(), move |w| w.embedding_for(&owner, &email_id)).await {
                Ok(Some(seed)) => {
                    if let Some(results) = self.nearest(user_id, seed, Some(email_id), top_k).await {
                        return results;
                    }
                }
                Ok(None) => debug!("email {} has no embedding; using recency", email_id),
                Err(err) => warn!("failed to load embedding for {}: {}", email_id, err),
            }
        }

        let owner = user_id.to_string();
        let rows = run_blocking(self.store.warehouse(), move |w| {
            w.list_recent(&owner, top_k, Some(&email_id))
        })
        .await;
        self.rehydrate_records(rows, "find_similar_by_id").await
    }

    pub async fn find_similar_by_text(&self, text: &str, user_id: &str, top_k: usize) -> Vec<RetrievedEmail> {
        let top_k = self.limit_or_default(top_k);
        let query = sanitize_query(text, self.settings.max_query_chars);

        if !query.is_empty() && self.index_ready().await {
            match self.embedder.embed(&query).await {
                Ok(vector) => {
                    if let Some(results) = self.nearest(user_id, vector, None, top_k).await {
                        return results;
                    }
                }
                Err(err) => warn!("query embedding failed; using substring search: {}", err),
            }
        }

        let owner = user_id.to_string();
        let rows = run_blocking(self.store.warehouse(), move |w| w.search_body(&owner, &query, top_k)).await;
        self.rehydrate_records(rows, "find_similar_by_text").await
    }

    async fn index_ready(&self) -> bool {
        match run_blocking(self.store.warehouse(), |w| w.vector_index_exists()).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!("failed to check vector index: {}", err);
                false
            }
        }
    }

    /// `None` when the neighbour query itself failed.
    async fn nearest(
        &self,
        user_id: &str,
        query: Vec<f32>,
        exclude: Option<Uuid>,
        top_k: usize,
    ) -> Option<Vec<RetrievedEmail>> {
        let owner = user_id.to_string();
        let neighbors = run_blocking(self.store.warehouse(), move |w| {
            w.nearest_neighbors(&owner, &query, exclude.as_ref(), top_k)
        })
        .await;
        match neighbors {
            Ok(neighbors) => Some(
                join_all(neighbors.into_iter().map(|Neighbor { email, distance }| async move {
                    RetrievedEmail {
                        email: self.rehydrate(email).await,
                        distance: Some(distance),
                    }
                }))
                .await,
            ),
            Err(err) => {
                warn!("nearest neighbour query failed: {}", err);
                None
            }
        }
    }

    async fn rehydrate_records(
        &self,
        rows: Result<Vec<EmailRecord>, WarehouseError>,
        operation: &str,
    ) -> Vec<RetrievedEmail> {
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                warn!("{} failed: {}", operation, err);
                return Vec::new();
            }
        };
        join_all(rows.into_iter().map(|email| async move {
            RetrievedEmail {
                email: self.rehydrate(email).await,
                distance: None,
            }
        }))
        .await
    }

    /// Replaces the inline body with the blob copy; the inline copy is kept
    /// when the blob cannot be read.
    async fn rehydrate(&self, mut email: EmailRecord) -> EmailRecord {
        let body = self.store.get_body(&email.body_blob_uri).await;
        if body != NO_CONTENT_AVAILABLE || email.body_text.trim().is_empty() {
            email.body_text = body;
        }
        email
    }

    fn limit_or_default(&self, limit: usize) -> usize {
        if limit == 0 {
            self.settings.top_k
        } else {
            limit
        }
    }
}

/// Keeps letters, digits, whitespace and `.,?!'-@_`; collapses whitespace and
/// caps the length.
pub fn sanitize_query(raw: &str, max_chars: usize) -> String {
    let kept: String = raw
        .chars()
        .filter(|ch| {
            ch.is_alphanumeric()
                || ch.is_whitespace()
                || matches!(ch, '.' | ',' | '?' | '!' | '\'' | '-' | '@' | '_')
        })
        .collect();
    kept.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect::<String>()
        .trim()
        .to_string()
}
