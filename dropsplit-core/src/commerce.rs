use async_trait::async_trait;
use dropsplit_shared::models::{Address, TrackingInfo};
use dropsplit_shared::Masked;
use serde::{Deserialize, Serialize};

/// Credentials for calling one party's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHandle {
    pub shop_domain: String,
    pub access_token: Masked<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentOrderLine {
    /// Fulfillment-order line item id (what fulfillment mutations reference).
    pub id: String,
    /// Underlying order line item id.
    pub line_item_id: String,
    pub variant_id: String,
    pub quantity: u32,
    /// Minor units.
    pub unit_price: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentOrderDetails {
    pub id: String,
    pub order_id: String,
    pub assigned_location_id: String,
    pub currency: String,
    pub destination: Address,
    /// Delivery method code the buyer picked at checkout, if any.
    pub shipping_service_code: Option<String>,
    pub line_items: Vec<FulfillmentOrderLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub variant_id: String,
    pub quantity: u32,
}

/// One delivery option as estimated by a store's own carrier settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOption {
    pub title: String,
    pub code: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftOrderLine {
    pub variant_id: String,
    pub quantity: u32,
    /// Price charged on the supplier order, minor units.
    pub unit_price: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftOrderRequest {
    pub currency: String,
    pub shipping_address: Address,
    pub shipping_title: String,
    pub shipping_code: String,
    pub shipping_price: i64,
    pub lines: Vec<DraftOrderLine>,
    pub tags: Vec<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOrderLine {
    pub id: String,
    pub variant_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOrder {
    pub order_id: String,
    pub line_items: Vec<CompletedOrderLine>,
}

impl CompletedOrder {
    pub fn line_for_variant(&self, variant_id: &str) -> Option<&CompletedOrderLine> {
        self.line_items.iter().find(|l| l.variant_id == variant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorLine {
    pub fulfillment_order_line_id: String,
    pub quantity: u32,
}

/// A fulfillment to create on the retailer's store mirroring a supplier shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorFulfillment {
    pub fulfillment_order_id: String,
    pub lines: Vec<MirrorLine>,
    pub tracking: TrackingInfo,
    pub notify_customer: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CommerceError {
    #[error("Platform unreachable: {0}")]
    Transport(String),

    #[error("Platform rate limit hit")]
    RateLimited,

    #[error("Platform returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Platform rejected mutation: {}", .0.join("; "))]
    UserErrors(Vec<String>),

    #[error("Not found on platform: {0}")]
    NotFound(String),

    #[error("Unexpected platform response: {0}")]
    Decode(String),
}

impl CommerceError {
    pub fn is_transient(&self) -> bool {
        match self {
            CommerceError::Transport(_) | CommerceError::RateLimited => true,
            CommerceError::Api { status, .. } => *status >= 500,
            CommerceError::UserErrors(_) | CommerceError::NotFound(_) | CommerceError::Decode(_) => false,
        }
    }
}

/// Outbound calls to the commerce platform, each made with the credentials of
/// the store it targets.
#[async_trait]
pub trait CommercePlatform: Send + Sync {
    async fn fulfillment_order(
        &self,
        store: &StoreHandle,
        fulfillment_order_id: &str,
    ) -> Result<FulfillmentOrderDetails, CommerceError>;

    /// Build a throwaway cart on `store` and read back its delivery estimates.
    async fn delivery_options(
        &self,
        store: &StoreHandle,
        lines: &[CartLine],
        destination: &Address,
        currency: &str,
    ) -> Result<Vec<DeliveryOption>, CommerceError>;

    /// Returns the draft order id.
    async fn create_draft_order(
        &self,
        store: &StoreHandle,
        draft: &DraftOrderRequest,
    ) -> Result<String, CommerceError>;

    async fn complete_draft_order(
        &self,
        store: &StoreHandle,
        draft_order_id: &str,
    ) -> Result<CompletedOrder, CommerceError>;

    async fn cancel_order(&self, store: &StoreHandle, order_id: &str) -> Result<(), CommerceError>;

    /// Returns the id of the created fulfillment.
    async fn create_fulfillment(
        &self,
        store: &StoreHandle,
        fulfillment: &MirrorFulfillment,
    ) -> Result<String, CommerceError>;

    async fn update_tracking(
        &self,
        store: &StoreHandle,
        fulfillment_id: &str,
        tracking: &TrackingInfo,
    ) -> Result<(), CommerceError>;

    async fn cancel_fulfillment(&self, store: &StoreHandle, fulfillment_id: &str) -> Result<(), CommerceError>;

    async fn reopen_fulfillment_order(
        &self,
        store: &StoreHandle,
        fulfillment_order_id: &str,
    ) -> Result<(), CommerceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CommerceError::RateLimited.is_transient());
        assert!(CommerceError::Api { status: 502, message: "bad gateway".into() }.is_transient());
        assert!(!CommerceError::Api { status: 422, message: "invalid".into() }.is_transient());
        assert!(!CommerceError::UserErrors(vec!["Variant is archived".into()]).is_transient());
    }

    #[test]
    fn test_store_handle_debug_hides_token() {
        let handle = StoreHandle {
            shop_domain: "supplier.example.com".into(),
            access_token: Masked::from("shpat_secret"),
        };
        assert!(!format!("{:?}", handle).contains("shpat_secret"));
    }
}
