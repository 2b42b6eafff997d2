use async_trait::async_trait;

use crate::commerce::DeliveryOption;

/// Short-lived store for supplier delivery estimates. Implementations fail
/// open: a broken cache reads as a miss and drops writes.
#[async_trait]
pub trait EstimateCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<DeliveryOption>>;

    async fn put(&self, key: &str, options: &[DeliveryOption]);
}
