use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Charge a retailer's saved payment method off-session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub transfer_group: Option<String>,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

/// Move funds from the platform balance to a supplier's connected account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub destination_account: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub transfer_group: Option<String>,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment declined: {0}")]
    Declined(String),

    #[error("Processor unreachable: {0}")]
    Transport(String),

    #[error("Processor returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Payment setup incomplete: {0}")]
    Misconfigured(String),
}

impl PaymentError {
    pub fn is_transient(&self) -> bool {
        match self {
            PaymentError::Transport(_) => true,
            PaymentError::Api { status, .. } => *status == 429 || *status >= 500,
            // A declined card or missing account may be fixed by the party; keep redriving.
            PaymentError::Declined(_) | PaymentError::Misconfigured(_) => true,
        }
    }

    /// The processor answered and turned the request down, so nothing moved.
    /// Transport failures and 5xx/429 answers leave the outcome unknown.
    pub fn is_refusal(&self) -> bool {
        match self {
            PaymentError::Declined(_) | PaymentError::Misconfigured(_) => true,
            PaymentError::Api { status, .. } => *status != 429 && *status < 500,
            PaymentError::Transport(_) => false,
        }
    }
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn charge_saved_payment_method(&self, charge: &ChargeRequest) -> Result<PaymentReceipt, PaymentError>;

    async fn transfer_to_connected_account(&self, transfer: &TransferRequest) -> Result<PaymentReceipt, PaymentError>;
}
