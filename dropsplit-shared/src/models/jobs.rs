use serde::{Deserialize, Serialize};

use super::events::{PlatformEvent, SupplierFulfillment};
use super::processor::ProcessorEvent;

/// A unit of asynchronous work. Ingress handlers enqueue these; the worker pool
/// runs them and retries on transient failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    RouteFulfillmentOrder {
        retailer_shop: String,
        fulfillment_order_id: String,
    },
    ReconcileFulfillment {
        supplier_shop: String,
        fulfillment: SupplierFulfillment,
    },
    SupplierOrderCancelled {
        supplier_shop: String,
        supplier_order_id: String,
    },
    RetailerFulfillmentOrderCancelled {
        retailer_shop: String,
        fulfillment_order_id: String,
    },
    ProcessorEvent {
        event_id: String,
        event: ProcessorEvent,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::RouteFulfillmentOrder { .. } => "route_fulfillment_order",
            Job::ReconcileFulfillment { .. } => "reconcile_fulfillment",
            Job::SupplierOrderCancelled { .. } => "supplier_order_cancelled",
            Job::RetailerFulfillmentOrderCancelled { .. } => "retailer_fulfillment_order_cancelled",
            Job::ProcessorEvent { .. } => "processor_event",
        }
    }

    /// Partition key: jobs touching the same ledger entity share a key so a
    /// partitioned queue keeps them in order.
    pub fn key(&self) -> String {
        match self {
            Job::RouteFulfillmentOrder { fulfillment_order_id, .. }
            | Job::RetailerFulfillmentOrderCancelled { fulfillment_order_id, .. } => {
                format!("fo:{}", fulfillment_order_id)
            }
            Job::ReconcileFulfillment { fulfillment, .. } => format!("so:{}", fulfillment.order_id),
            Job::SupplierOrderCancelled { supplier_order_id, .. } => format!("so:{}", supplier_order_id),
            Job::ProcessorEvent { event_id, .. } => format!("evt:{}", event_id),
        }
    }
}

impl From<PlatformEvent> for Job {
    fn from(event: PlatformEvent) -> Self {
        match event {
            PlatformEvent::FulfillmentOrderRoutingComplete { shop, fulfillment_order_id } => {
                Job::RouteFulfillmentOrder {
                    retailer_shop: shop,
                    fulfillment_order_id,
                }
            }
            PlatformEvent::FulfillmentChanged { shop, fulfillment } => Job::ReconcileFulfillment {
                supplier_shop: shop,
                fulfillment,
            },
            PlatformEvent::OrderCancelled { shop, order_id } => Job::SupplierOrderCancelled {
                supplier_shop: shop,
                supplier_order_id: order_id,
            },
            PlatformEvent::FulfillmentOrderCancelled { shop, fulfillment_order_id } => {
                Job::RetailerFulfillmentOrderCancelled {
                    retailer_shop: shop,
                    fulfillment_order_id,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wire_format_is_tagged() {
        let job = Job::RouteFulfillmentOrder {
            retailer_shop: "retailer.example.com".into(),
            fulfillment_order_id: "gid://platform/FulfillmentOrder/1".into(),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["job"], "route_fulfillment_order");

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.key(), "fo:gid://platform/FulfillmentOrder/1");
    }
}
