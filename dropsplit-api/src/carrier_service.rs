use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use dropsplit_shared::models::rates::{RateRequestEnvelope, RateResponse};

use crate::platform_webhooks::{shop_domain, PLATFORM_HMAC_HEADER};
use crate::signing;
use crate::state::AppState;

/// POST /carrier-service/rates
///
/// Always 200. Anything unusable gets the empty rate list, which tells checkout
/// to fall back to the retailer's own shipping rates.
pub async fn handle_rate_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<RateResponse> {
    let signature = headers.get(PLATFORM_HMAC_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = signing::verify_platform_hmac(&body, state.secrets.platform_secret.expose(), signature) {
        tracing::warn!(error = %e, "Rate request failed verification");
        state.metrics.quotes.with_label_values(&["rejected"]).inc();
        return Json(RateResponse::empty());
    }

    let Some(shop) = shop_domain(&headers) else {
        tracing::warn!("Rate request without shop domain");
        state.metrics.quotes.with_label_values(&["empty"]).inc();
        return Json(RateResponse::empty());
    };

    let envelope: RateRequestEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(shop, error = %e, "Unreadable rate request");
            state.metrics.quotes.with_label_values(&["empty"]).inc();
            return Json(RateResponse::empty());
        }
    };

    let response = state.quoter.quote(shop, &envelope.rate).await;
    let outcome = if response.rates.is_empty() { "empty" } else { "rates" };
    state.metrics.quotes.with_label_values(&[outcome]).inc();

    Json(response)
}
