use serde::{Deserialize, Serialize};

use super::common::{id_string, Address};

// ============================================================================
// Carrier-service wire format
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RateRequestEnvelope {
    pub rate: RateRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateRequest {
    #[serde(default)]
    pub origin: Address,
    pub destination: Address,
    #[serde(default)]
    pub items: Vec<RateItem>,
    pub currency: String,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateItem {
    #[serde(deserialize_with = "id_string")]
    pub variant_id: String,
    pub quantity: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub grams: u32,
    /// Unit price in minor units.
    #[serde(default)]
    pub price: i64,
    #[serde(default = "default_requires_shipping")]
    pub requires_shipping: bool,
}

fn default_requires_shipping() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingRate {
    pub service_name: String,
    pub service_code: String,
    /// Minor units rendered as a string, as the platform expects.
    pub total_price: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An empty `rates` array tells the platform to fall back to its own rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateResponse {
    pub rates: Vec<ShippingRate>,
}

impl RateResponse {
    pub fn empty() -> Self {
        Self::default()
    }
}
