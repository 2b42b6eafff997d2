use std::sync::Arc;
use dropsplit_core::queue::JobQueue;
use dropsplit_core::repository::LedgerRepository;
use dropsplit_order::CarrierRateQuoter;
use dropsplit_shared::Masked;
use dropsplit_store::DbClient;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct WebhookSecrets {
    /// Commerce-platform app secret; signs platform webhooks and rate callbacks.
    pub platform_secret: Masked<String>,
    pub processor_secret: Masked<String>,
    pub processor_tolerance_seconds: i64,
}

#[derive(Clone)]
pub struct AppState {
    /// `None` when running without a database (tests); health then reports ok.
    pub db: Option<Arc<DbClient>>,
    pub ledger: Arc<dyn LedgerRepository>,
    pub queue: Arc<dyn JobQueue>,
    pub quoter: Arc<CarrierRateQuoter>,
    pub metrics: Arc<Metrics>,
    pub secrets: WebhookSecrets,
}
