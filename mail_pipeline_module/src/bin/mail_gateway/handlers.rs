use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use mail_pipeline_module::adapters::PostmarkInbound;
use mail_pipeline_module::dual_store::DualStoreError;
use mail_pipeline_module::{InboundEmail, KnowledgeSnippet, ReplyContext};

use super::state::GatewayState;

const DEFAULT_LIST_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AddressQuery {
    address: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SimilarQuery {
    top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SearchBody {
    text: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ReplyBody {
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    knowledge: Vec<KnowledgeSnippet>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RecordReplyBody {
    subject: String,
    body: String,
    sent_success: bool,
}

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub(super) async fn ingest_email(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let inbound: InboundEmail = match serde_json::from_slice(&body) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!("gateway rejected inbound email for user {}: {}", user_id, err);
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "bad_json"})));
        }
    };
    run_ingest(&state, &user_id, inbound).await
}

pub(super) async fn ingest_postmark(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let payload = match PostmarkInbound::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!("gateway failed to parse postmark payload: {}", err);
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "bad_json"})));
        }
    };
    run_ingest(&state, &user_id, payload.into_inbound()).await
}

async fn run_ingest(
    state: &GatewayState,
    user_id: &str,
    inbound: InboundEmail,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.pipeline.ingest(user_id, inbound).await {
        Ok(report) => {
            let status = if report.duplicate { "duplicate" } else { "ingested" };
            info!(
                "gateway ingested email {} for user {} ({})",
                report.email_id, report.user_id, status
            );
            (StatusCode::OK, Json(json!({"status": status, "report": report})))
        }
        Err(err) => {
            error!("gateway ingest failed for user {}: {}", user_id, err);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"status": "persist_failed"})),
            )
        }
    }
}

pub(super) async fn list_recent(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let limit = query.limit.filter(|v| *v > 0).unwrap_or(DEFAULT_LIST_LIMIT);
    let emails = state.pipeline.list_recent(&user_id, limit).await;
    (StatusCode::OK, Json(json!({"emails": emails})))
}

pub(super) async fn find_by_address(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<String>,
    Query(query): Query<AddressQuery>,
) -> impl IntoResponse {
    let limit = query.limit.filter(|v| *v > 0).unwrap_or(DEFAULT_LIST_LIMIT);
    let emails = state
        .pipeline
        .find_by_address(&query.address, &user_id, limit)
        .await;
    (StatusCode::OK, Json(json!({"emails": emails})))
}

pub(super) async fn find_similar(
    State(state): State<Arc<GatewayState>>,
    Path((user_id, email_id)): Path<(String, Uuid)>,
    Query(query): Query<SimilarQuery>,
) -> impl IntoResponse {
    let top_k = query.top_k.unwrap_or(0);
    let emails = state
        .pipeline
        .find_similar_by_id(email_id, &user_id, top_k)
        .await;
    (StatusCode::OK, Json(json!({"emails": emails})))
}

pub(super) async fn search(
    State(state): State<Arc<GatewayState>>,
    Path(user_id): Path<String>,
    Json(body): Json<SearchBody>,
) -> impl IntoResponse {
    let emails = state
        .pipeline
        .find_similar_by_text(&body.text, &user_id, body.top_k.unwrap_or(0))
        .await;
    (StatusCode::OK, Json(json!({"emails": emails})))
}

pub(super) async fn generate_reply(
    State(state): State<Arc<GatewayState>>,
    Path((user_id, email_id)): Path<(String, Uuid)>,
    body: Bytes,
) -> impl IntoResponse {
    let reply_body: ReplyBody = if body.is_empty() {
        ReplyBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, Json(json!({"status": "bad_json"})));
            }
        }
    };
    let context = ReplyContext {
        user_id,
        question: reply_body.question,
        knowledge: reply_body.knowledge,
        top_k: reply_body.top_k,
    };
    let reply = state.pipeline.generate_reply(email_id, &context).await;
    (StatusCode::OK, Json(json!({"reply": reply})))
}

pub(super) async fn record_reply(
    State(state): State<Arc<GatewayState>>,
    Path((user_id, email_id)): Path<(String, Uuid)>,
    Json(body): Json<RecordReplyBody>,
) -> impl IntoResponse {
    match state
        .pipeline
        .record_reply(&user_id, email_id, &body.subject, &body.body, body.sent_success)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(json!({"status": "recorded", "reply": record}))),
        Err(DualStoreError::EmailNotFound { .. }) => {
            warn!("gateway rejected reply record for email {} and user {}", email_id, user_id);
            (StatusCode::NOT_FOUND, Json(json!({"status": "not_found"})))
        }
        Err(err) => {
            error!(
                "gateway failed to record reply to {} for user {}: {}",
                email_id, user_id, err
            );
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"status": "record_failed"})),
            )
        }
    }
}
