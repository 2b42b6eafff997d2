use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use dropsplit_shared::models::{Job, PlatformEvent, PlatformTopic};

use crate::error::AppError;
use crate::signing;
use crate::state::AppState;

pub const PLATFORM_HMAC_HEADER: &str = "X-Platform-Hmac-Sha256";
pub const PLATFORM_SHOP_HEADER: &str = "X-Platform-Shop-Domain";

pub(crate) fn shop_domain(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(PLATFORM_SHOP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// POST /webhooks/platform/{*topic}
pub async fn handle_platform_webhook(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let signature = headers.get(PLATFORM_HMAC_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = signing::verify_platform_hmac(&body, state.secrets.platform_secret.expose(), signature) {
        state.metrics.webhook("platform", "rejected");
        return Err(AppError::AuthenticationError(e.to_string()));
    }

    let shop = shop_domain(&headers)
        .ok_or_else(|| AppError::ValidationError(format!("{} header missing", PLATFORM_SHOP_HEADER)))?;

    let parsed = topic
        .trim_matches('/')
        .parse::<PlatformTopic>()
        .and_then(|topic| PlatformEvent::parse(topic, shop, &body));
    let event = match parsed {
        Ok(event) => event,
        Err(e) => {
            state.metrics.webhook("platform", "malformed");
            return Err(AppError::ValidationError(e.to_string()));
        }
    };

    let job = Job::from(event);
    state.queue.enqueue(&job).await?;

    tracing::info!(shop, topic = %topic, job = job.kind(), "Platform event queued");
    state.metrics.webhook("platform", "accepted");
    Ok(StatusCode::OK)
}
