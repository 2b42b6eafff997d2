use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use dropsplit_shared::models::{Job, ParsedProcessorEvent, ProcessorEnvelope};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::signing;
use crate::state::AppState;

pub const PROCESSOR_SIGNATURE_HEADER: &str = "Processor-Signature";

/// POST /webhooks/processor
///
/// Verify, dedupe on the event id, record the id, then hand the typed event to
/// the job queue. The processor retries anything that is not a 2xx.
pub async fn handle_processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let signature = headers
        .get(PROCESSOR_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    if let Err(e) = signing::verify_processor_signature(
        &body,
        state.secrets.processor_secret.expose(),
        signature,
        state.secrets.processor_tolerance_seconds,
        Utc::now().timestamp(),
    ) {
        state.metrics.webhook("processor", "rejected");
        return Err(AppError::VerificationError(e.to_string()));
    }

    let envelope = ProcessorEnvelope::from_slice(&body).map_err(|e| {
        state.metrics.webhook("processor", "malformed");
        AppError::ValidationError(e.to_string())
    })?;
    let parsed = envelope.parse_event().map_err(|e| {
        state.metrics.webhook("processor", "malformed");
        AppError::ValidationError(e.to_string())
    })?;

    if state.ledger.is_webhook_processed(&envelope.id).await? {
        tracing::info!(event_id = %envelope.id, kind = %envelope.type_, "Duplicate processor event ignored");
        state.metrics.webhook("processor", "duplicate");
        return Ok((StatusCode::OK, Json(json!({ "received": true, "duplicate": true }))));
    }

    // Recorded before dispatch; a concurrent delivery that loses the insert stops here.
    if !state
        .ledger
        .record_processed_webhook(&envelope.id, &envelope.type_)
        .await?
    {
        state.metrics.webhook("processor", "duplicate");
        return Ok((StatusCode::OK, Json(json!({ "received": true, "duplicate": true }))));
    }

    match parsed {
        ParsedProcessorEvent::Known(event) => {
            let job = Job::ProcessorEvent {
                event_id: envelope.id.clone(),
                event,
            };
            state.queue.enqueue(&job).await?;
            tracing::info!(event_id = %envelope.id, kind = %envelope.type_, "Processor event queued");
            state.metrics.webhook("processor", "accepted");
            Ok((StatusCode::OK, Json(json!({ "received": true, "handled": true }))))
        }
        ParsedProcessorEvent::Unhandled(kind) => {
            tracing::debug!(event_id = %envelope.id, kind = %kind, "Processor event type not handled");
            state.metrics.webhook("processor", "unhandled");
            Ok((StatusCode::OK, Json(json!({ "received": true, "handled": false }))))
        }
    }
}
