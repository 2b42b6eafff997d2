use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::common::{id_string, TrackingInfo};

// ============================================================================
// Ingress schema for commerce-platform webhooks
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EventSchemaError {
    #[error("Unsupported topic: {0}")]
    UnsupportedTopic(String),

    #[error("Malformed {topic} payload: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformTopic {
    FulfillmentOrderRoutingComplete,
    FulfillmentCreated,
    FulfillmentUpdated,
    OrderCancelled,
    FulfillmentOrderCancelled,
}

impl PlatformTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformTopic::FulfillmentOrderRoutingComplete => "fulfillment_orders/routing_complete",
            PlatformTopic::FulfillmentCreated => "fulfillments/create",
            PlatformTopic::FulfillmentUpdated => "fulfillments/update",
            PlatformTopic::OrderCancelled => "orders/cancelled",
            PlatformTopic::FulfillmentOrderCancelled => "fulfillment_orders/cancelled",
        }
    }
}

impl fmt::Display for PlatformTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformTopic {
    type Err = EventSchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Webhook routes may use either "a/b" or "a_b" style topics.
        match s.replace('_', "/").as_str() {
            "fulfillment/orders/routing/complete" => Ok(PlatformTopic::FulfillmentOrderRoutingComplete),
            "fulfillments/create" => Ok(PlatformTopic::FulfillmentCreated),
            "fulfillments/update" => Ok(PlatformTopic::FulfillmentUpdated),
            "orders/cancelled" => Ok(PlatformTopic::OrderCancelled),
            "fulfillment/orders/cancelled" => Ok(PlatformTopic::FulfillmentOrderCancelled),
            _ => Err(EventSchemaError::UnsupportedTopic(s.to_string())),
        }
    }
}

/// Fulfillment status as reported by the supplier's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Open,
    Success,
    Cancelled,
    Error,
    Failure,
}

impl FulfillmentStatus {
    /// Statuses after which the shipment will not reach the buyer.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FulfillmentStatus::Cancelled | FulfillmentStatus::Error | FulfillmentStatus::Failure)
    }
}

/// Carrier-side progress of a shipment. Unknown values are kept as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    LabelPrinted,
    LabelPurchased,
    AttemptedDelivery,
    ReadyForPickup,
    Confirmed,
    InTransit,
    OutForDelivery,
    Delivered,
    Failure,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentLine {
    /// Supplier-side order line item id.
    #[serde(rename = "id", deserialize_with = "id_string")]
    pub line_item_id: String,
    pub quantity: u32,
}

/// A supplier-side fulfillment, normalized from the `fulfillments/*` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierFulfillment {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub order_id: String,
    pub status: FulfillmentStatus,
    #[serde(default)]
    pub shipment_status: Option<ShipmentStatus>,
    #[serde(default)]
    pub tracking_company: Option<String>,
    #[serde(default)]
    pub tracking_numbers: Vec<String>,
    #[serde(default)]
    pub tracking_urls: Vec<String>,
    #[serde(default)]
    pub line_items: Vec<FulfillmentLine>,
}

impl SupplierFulfillment {
    pub fn tracking(&self) -> TrackingInfo {
        TrackingInfo {
            company: self.tracking_company.clone(),
            numbers: self.tracking_numbers.clone(),
            urls: self.tracking_urls.clone(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.shipment_status == Some(ShipmentStatus::Delivered)
    }
}

#[derive(Debug, Deserialize)]
struct FulfillmentOrderRef {
    #[serde(deserialize_with = "id_string")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct FulfillmentOrderPayload {
    fulfillment_order: FulfillmentOrderRef,
}

#[derive(Debug, Deserialize)]
struct OrderCancelledPayload {
    #[serde(deserialize_with = "id_string")]
    id: String,
}

/// A validated commerce-platform event. `shop` is the store domain that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum PlatformEvent {
    FulfillmentOrderRoutingComplete {
        shop: String,
        fulfillment_order_id: String,
    },
    FulfillmentChanged {
        shop: String,
        fulfillment: SupplierFulfillment,
    },
    OrderCancelled {
        shop: String,
        order_id: String,
    },
    FulfillmentOrderCancelled {
        shop: String,
        fulfillment_order_id: String,
    },
}

impl PlatformEvent {
    pub fn parse(topic: PlatformTopic, shop: &str, body: &[u8]) -> Result<Self, EventSchemaError> {
        let malformed = |source| EventSchemaError::Malformed {
            topic: topic.to_string(),
            source,
        };
        let shop = shop.to_string();

        let event = match topic {
            PlatformTopic::FulfillmentOrderRoutingComplete => {
                let payload: FulfillmentOrderPayload = serde_json::from_slice(body).map_err(malformed)?;
                PlatformEvent::FulfillmentOrderRoutingComplete {
                    shop,
                    fulfillment_order_id: payload.fulfillment_order.id,
                }
            }
            PlatformTopic::FulfillmentCreated | PlatformTopic::FulfillmentUpdated => {
                let fulfillment: SupplierFulfillment = serde_json::from_slice(body).map_err(malformed)?;
                PlatformEvent::FulfillmentChanged { shop, fulfillment }
            }
            PlatformTopic::OrderCancelled => {
                let payload: OrderCancelledPayload = serde_json::from_slice(body).map_err(malformed)?;
                PlatformEvent::OrderCancelled {
                    shop,
                    order_id: payload.id,
                }
            }
            PlatformTopic::FulfillmentOrderCancelled => {
                let payload: FulfillmentOrderPayload = serde_json::from_slice(body).map_err(malformed)?;
                PlatformEvent::FulfillmentOrderCancelled {
                    shop,
                    fulfillment_order_id: payload.fulfillment_order.id,
                }
            }
        };

        Ok(event)
    }

    pub fn shop(&self) -> &str {
        match self {
            PlatformEvent::FulfillmentOrderRoutingComplete { shop, .. }
            | PlatformEvent::FulfillmentChanged { shop, .. }
            | PlatformEvent::OrderCancelled { shop, .. }
            | PlatformEvent::FulfillmentOrderCancelled { shop, .. } => shop,
        }
    }
}
