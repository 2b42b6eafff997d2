use async_trait::async_trait;
use dropsplit_shared::Masked;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commerce::StoreHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartnerRole {
    Retailer,
    Supplier,
}

/// A connected store and the credentials to act on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreAccount {
    pub id: Uuid,
    pub shop_domain: String,
    pub access_token: Masked<String>,
    pub role: PartnerRole,
    /// Retailers only: the fulfillment location dropshipped items are assigned to.
    pub dropship_location_id: Option<String>,
}

impl StoreAccount {
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            shop_domain: self.shop_domain.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

/// A supplier variant mirrored into a retailer store, with the terms frozen
/// from the price list in effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedVariant {
    pub retailer_variant_id: String,
    pub supplier_id: Uuid,
    pub supplier_variant_id: String,
    pub price_list_id: Option<Uuid>,
    pub retail_price: i64,
    pub retailer_profit: i64,
    pub supplier_profit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentProfile {
    /// Supplier payout destination.
    pub connected_account_id: Option<String>,
    pub payouts_enabled: bool,
    /// Retailer billing customer.
    pub customer_id: Option<String>,
    pub default_payment_method_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory lookup failed: {0}")]
    Database(String),
}

/// Read access to the catalog/partnership tables owned by the admin UI,
/// plus the payment-account flags the processor events maintain.
#[async_trait]
pub trait PartnerDirectory: Send + Sync {
    async fn store_by_domain(&self, shop_domain: &str) -> Result<Option<StoreAccount>, DirectoryError>;

    async fn store_by_id(&self, store_id: Uuid) -> Result<Option<StoreAccount>, DirectoryError>;

    /// Cheap existence check used on the checkout hot path.
    async fn has_imported_variants(&self, retailer_id: Uuid, variant_ids: &[String]) -> Result<bool, DirectoryError>;

    async fn imported_variants(
        &self,
        retailer_id: Uuid,
        variant_ids: &[String],
    ) -> Result<Vec<ImportedVariant>, DirectoryError>;

    async fn payment_profile(&self, store_id: Uuid) -> Result<Option<PaymentProfile>, DirectoryError>;

    /// Returns `false` when no store owns the account.
    async fn update_account_capabilities(
        &self,
        connected_account_id: &str,
        payouts_enabled: bool,
    ) -> Result<bool, DirectoryError>;

    async fn disconnect_account(&self, connected_account_id: &str) -> Result<bool, DirectoryError>;

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<bool, DirectoryError>;

    /// Clears the default method only if it is still `payment_method_id`.
    async fn detach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<bool, DirectoryError>;
}
