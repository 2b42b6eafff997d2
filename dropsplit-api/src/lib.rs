use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod carrier_service;
pub mod clients;
pub mod error;
pub mod metrics;
pub mod platform_webhooks;
pub mod signing;
pub mod state;
pub mod webhooks;
pub mod worker;

pub use state::{AppState, WebhookSecrets};

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::USER_AGENT]);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/carrier-service/rates", post(carrier_service::handle_rate_request))
        .route("/webhooks/platform/{*topic}", post(platform_webhooks::handle_platform_webhook))
        .route("/webhooks/processor", post(webhooks::handle_processor_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(db) = &state.db {
        if let Err(e) = db.ping().await {
            tracing::error!("Health check failed: {}", e);
            return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unavailable" })));
        }
    }
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, error::AppError> {
    state
        .metrics
        .render()
        .map_err(|e| error::AppError::InternalServerError(e.to_string()))
}
