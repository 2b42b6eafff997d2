use async_trait::async_trait;
use dropsplit_core::payment::{ChargeRequest, PaymentError, PaymentProcessor, PaymentReceipt, TransferRequest};
use dropsplit_shared::Masked;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::breaker::CircuitBreaker;

#[derive(Debug, Deserialize)]
struct ObjectResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Form-encoded REST client for the payment processor. Every mutation carries
/// the caller's idempotency key so a retried settlement never moves money twice.
pub struct ProcessorClient {
    client: reqwest::Client,
    api_base: String,
    secret_key: Masked<String>,
    breaker: CircuitBreaker,
}

impl ProcessorClient {
    pub fn new(api_base: &str, secret_key: Masked<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("dropsplit/0.1")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key,
            breaker: CircuitBreaker::new("processor", 5, Duration::from_secs(30)),
        })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/v1/{}", self.api_base, endpoint)
    }

    async fn post_form(
        &self,
        endpoint: &str,
        idempotency_key: &str,
        form: &[(String, String)],
    ) -> Result<ObjectResponse, PaymentError> {
        if !self.breaker.check().await {
            return Err(PaymentError::Transport(format!("circuit {} is open", self.breaker.name)));
        }

        let result = self.send_form(endpoint, idempotency_key, form).await;
        match &result {
            Err(PaymentError::Transport(_)) => self.breaker.record_failure().await,
            Err(PaymentError::Api { status, .. }) if *status >= 500 => self.breaker.record_failure().await,
            _ => self.breaker.record_success().await,
        }
        result
    }

    async fn send_form(
        &self,
        endpoint: &str,
        idempotency_key: &str,
        form: &[(String, String)],
    ) -> Result<ObjectResponse, PaymentError> {
        let response = self
            .client
            .post(self.api_url(endpoint))
            .bearer_auth(self.secret_key.expose())
            .header("Idempotency-Key", idempotency_key)
            .form(form)
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &body));
        }

        response
            .json::<ObjectResponse>()
            .await
            .map_err(|e| PaymentError::Api {
                status: status.as_u16(),
                message: format!("unreadable response: {}", e),
            })
    }
}

fn classify_error(status: u16, body: &str) -> PaymentError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let message = parsed
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());

    match (status, parsed.as_ref().and_then(|e| e.kind.as_deref())) {
        (402, _) | (_, Some("card_error")) => {
            let reason = parsed
                .as_ref()
                .and_then(|e| e.decline_code.clone().or_else(|| e.code.clone()))
                .unwrap_or(message);
            PaymentError::Declined(reason)
        }
        (400, Some("invalid_request_error")) => PaymentError::Misconfigured(message),
        _ => PaymentError::Api { status, message },
    }
}

fn push_metadata(form: &mut Vec<(String, String)>, metadata: &BTreeMap<String, String>) {
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
}

#[async_trait]
impl PaymentProcessor for ProcessorClient {
    async fn charge_saved_payment_method(&self, charge: &ChargeRequest) -> Result<PaymentReceipt, PaymentError> {
        let mut form = vec![
            ("amount".to_string(), charge.amount.to_string()),
            ("currency".to_string(), charge.currency.to_lowercase()),
            ("customer".to_string(), charge.customer_id.clone()),
            ("payment_method".to_string(), charge.payment_method_id.clone()),
            ("off_session".to_string(), "true".to_string()),
            ("confirm".to_string(), "true".to_string()),
            ("description".to_string(), charge.description.clone()),
        ];
        if let Some(group) = &charge.transfer_group {
            form.push(("transfer_group".to_string(), group.clone()));
        }
        push_metadata(&mut form, &charge.metadata);

        let intent = self.post_form("payment_intents", &charge.idempotency_key, &form).await?;
        match intent.status.as_deref() {
            Some("succeeded") | Some("processing") | None => Ok(PaymentReceipt { id: intent.id }),
            Some(other) => Err(PaymentError::Declined(format!("payment intent {} is {}", intent.id, other))),
        }
    }

    async fn transfer_to_connected_account(&self, transfer: &TransferRequest) -> Result<PaymentReceipt, PaymentError> {
        let mut form = vec![
            ("amount".to_string(), transfer.amount.to_string()),
            ("currency".to_string(), transfer.currency.to_lowercase()),
            ("destination".to_string(), transfer.destination_account.clone()),
        ];
        if let Some(group) = &transfer.transfer_group {
            form.push(("transfer_group".to_string(), group.clone()));
        }
        push_metadata(&mut form, &transfer.metadata);

        let created = self.post_form("transfers", &transfer.idempotency_key, &form).await?;
        Ok(PaymentReceipt { id: created.id })
    }
}
