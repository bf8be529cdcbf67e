#[path = "mail_gateway/handlers.rs"]
mod handlers;
#[path = "mail_gateway/state.rs"]
mod state;

use std::env;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use mail_pipeline_module::EmailPipeline;

use handlers::{
    find_by_address, find_similar, generate_reply, health, ingest_email, ingest_postmark,
    list_recent, record_reply, search,
};
use state::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let host = env::var("GATEWAY_HOST")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = env::var("GATEWAY_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(9200);
    let max_body_bytes = env::var("GATEWAY_MAX_BODY_BYTES")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(25 * 1024 * 1024);

    let pipeline = EmailPipeline::from_env().await?;
    info!(
        "mail gateway character={}, index_min_rows={}, digest_interval={:?}",
        pipeline.config().character.id,
        pipeline.config().index.min_rows,
        pipeline.config().digest_interval
    );
    let _digest = pipeline.spawn_digest();

    let state = Arc::new(GatewayState { pipeline });
    let app = router(state).layer(DefaultBodyLimit::max(max_body_bytes));

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("mail gateway listening on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    Ok(())
}

fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/users/:user_id/emails", post(ingest_email).get(list_recent))
        .route("/users/:user_id/postmark/inbound", post(ingest_postmark))
        .route("/users/:user_id/emails/by-address", get(find_by_address))
        .route("/users/:user_id/emails/:email_id/similar", get(find_similar))
        .route("/users/:user_id/search", post(search))
        .route("/users/:user_id/emails/:email_id/reply", post(generate_reply))
        .route("/users/:user_id/emails/:email_id/replies", post(record_reply))
        .with_state(state)
        .layer(CorsLayer::permissive())
}
