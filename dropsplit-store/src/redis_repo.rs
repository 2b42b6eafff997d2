use async_trait::async_trait;
use dropsplit_core::cache::EstimateCache;
use dropsplit_core::commerce::DeliveryOption;
use redis::{AsyncCommands, RedisResult};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
    ttl_seconds: u64,
}

impl RedisClient {
    pub async fn new(connection_string: &str, ttl_seconds: u64) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client, ttl_seconds })
    }

    fn estimate_key(key: &str) -> String {
        format!("quote:{}", key)
    }

    pub async fn get_estimates(&self, key: &str) -> RedisResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.get(Self::estimate_key(key)).await
    }

    pub async fn set_estimates(&self, key: &str, payload: &str) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(Self::estimate_key(key), payload, self.ttl_seconds).await
    }
}

#[async_trait]
impl EstimateCache for RedisClient {
    async fn get(&self, key: &str) -> Option<Vec<DeliveryOption>> {
        let raw = match self.get_estimates(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "Quote cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(options) => {
                debug!(key, "Quote cache hit");
                Some(options)
            }
            Err(e) => {
                warn!(error = %e, key, "Discarding unreadable cached estimate");
                None
            }
        }
    }

    async fn put(&self, key: &str, options: &[DeliveryOption]) {
        let payload = match serde_json::to_string(options) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode estimate for cache");
                return;
            }
        };

        if let Err(e) = self.set_estimates(key, &payload).await {
            warn!(error = %e, "Quote cache write failed");
        }
    }
}
