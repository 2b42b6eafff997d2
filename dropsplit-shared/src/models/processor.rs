use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::events::EventSchemaError;

/// The signed envelope the payment processor posts to us.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: i64,
    /// Connected account the event originated from, if any.
    #[serde(default)]
    pub account: Option<String>,
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeData {
    pub object: serde_json::Value,
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(rename = "type", default)]
    pub method_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Processor events the engine acts on, one variant per event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorEvent {
    AccountUpdated { account: ConnectedAccount },
    AccountDeauthorized { account_id: String },
    PaymentMethodAttached { payment_method: PaymentMethodObject },
    PaymentMethodDetached {
        payment_method: PaymentMethodObject,
        /// The customer the method was detached from, recovered from `previous_attributes`.
        previous_customer: Option<String>,
    },
    ChargeCaptured { charge: ChargeObject },
    ChargeFailed { charge: ChargeObject },
}

impl ProcessorEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            ProcessorEvent::AccountUpdated { .. } => "account.updated",
            ProcessorEvent::AccountDeauthorized { .. } => "account.application.deauthorized",
            ProcessorEvent::PaymentMethodAttached { .. } => "payment_method.attached",
            ProcessorEvent::PaymentMethodDetached { .. } => "payment_method.detached",
            ProcessorEvent::ChargeCaptured { .. } => "charge.captured",
            ProcessorEvent::ChargeFailed { .. } => "charge.failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedProcessorEvent {
    Known(ProcessorEvent),
    /// A type we do not subscribe to; acknowledged but not dispatched.
    Unhandled(String),
}

impl ProcessorEnvelope {
    pub fn from_slice(body: &[u8]) -> Result<Self, EventSchemaError> {
        serde_json::from_slice(body).map_err(|source| EventSchemaError::Malformed {
            topic: "processor envelope".to_string(),
            source,
        })
    }

    /// Validate `data.object` against the schema for this event type.
    pub fn parse_event(&self) -> Result<ParsedProcessorEvent, EventSchemaError> {
        let object = self.data.object.clone();
        let malformed = |source| EventSchemaError::Malformed {
            topic: self.type_.clone(),
            source,
        };

        let event = match self.type_.as_str() {
            "account.updated" => ProcessorEvent::AccountUpdated {
                account: serde_json::from_value(object).map_err(malformed)?,
            },
            "account.application.deauthorized" => {
                // The object is the application; the account comes from the envelope.
                let account_id = match &self.account {
                    Some(id) => id.clone(),
                    None => return Ok(ParsedProcessorEvent::Unhandled(self.type_.clone())),
                };
                ProcessorEvent::AccountDeauthorized { account_id }
            }
            "payment_method.attached" => ProcessorEvent::PaymentMethodAttached {
                payment_method: serde_json::from_value(object).map_err(malformed)?,
            },
            "payment_method.detached" => {
                let payment_method = serde_json::from_value(object).map_err(malformed)?;
                let previous_customer = self
                    .data
                    .previous_attributes
                    .as_ref()
                    .and_then(|p| p.get("customer"))
                    .and_then(|c| c.as_str())
                    .map(str::to_string);
                ProcessorEvent::PaymentMethodDetached {
                    payment_method,
                    previous_customer,
                }
            }
            "charge.captured" => ProcessorEvent::ChargeCaptured {
                charge: serde_json::from_value(object).map_err(malformed)?,
            },
            "charge.failed" => ProcessorEvent::ChargeFailed {
                charge: serde_json::from_value(object).map_err(malformed)?,
            },
            other => return Ok(ParsedProcessorEvent::Unhandled(other.to_string())),
        };

        Ok(ParsedProcessorEvent::Known(event))
    }
}
