use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dropsplit_api::clients::{PlatformClient, ProcessorClient};
use dropsplit_api::metrics::Metrics;
use dropsplit_api::worker::{self, LocalQueue, RetryPolicy};
use dropsplit_api::{app, AppState, WebhookSecrets};
use dropsplit_core::cache::EstimateCache;
use dropsplit_core::commerce::CommercePlatform;
use dropsplit_core::directory::PartnerDirectory;
use dropsplit_core::queue::JobQueue;
use dropsplit_core::repository::LedgerRepository;
use dropsplit_order::{
    CarrierRateQuoter, FulfillmentReconciler, JobRunner, OrderRouter, ProcessorEventHandler, SettlementService,
};
use dropsplit_shared::Masked;
use dropsplit_store::app_config::QueueBackend;
use dropsplit_store::{Config, DbClient, EventProducer, PgLedgerRepository, PgPartnerDirectory, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dropsplit_api=debug,dropsplit_order=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().expect("Failed to load config");
    tracing::info!("Starting dropsplit on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .expect("Failed to connect to Postgres");
    db.migrate().await.expect("Failed to run migrations");
    let db = Arc::new(db);

    let ledger: Arc<dyn LedgerRepository> = Arc::new(PgLedgerRepository::new(db.pool.clone()));
    let directory: Arc<dyn PartnerDirectory> = Arc::new(PgPartnerDirectory::new(db.pool.clone()));

    // Outbound clients
    let request_timeout = Duration::from_millis(config.platform.request_timeout_ms);
    let commerce: Arc<dyn CommercePlatform> = Arc::new(
        PlatformClient::new(&config.platform.api_version, request_timeout)
            .expect("Failed to build platform client"),
    );
    let processor = Arc::new(
        ProcessorClient::new(
            &config.processor.api_base,
            Masked::new(config.processor.secret_key.clone()),
            request_timeout,
        )
        .expect("Failed to build processor client"),
    );

    // Rate quoting, with an optional Redis estimate cache
    let mut quoter = CarrierRateQuoter::new(
        directory.clone(),
        commerce.clone(),
        Duration::from_millis(config.rates.supplier_timeout_ms),
    );
    if let Some(url) = &config.redis.url {
        match RedisClient::new(url, config.redis.quote_ttl_seconds).await {
            Ok(redis) => {
                let cache: Arc<dyn EstimateCache> = Arc::new(redis);
                quoter = quoter.with_cache(cache);
            }
            Err(e) => tracing::warn!("Redis unavailable, quoting without cache: {}", e),
        }
    }

    // Job execution
    let settlement = Arc::new(SettlementService::new(directory.clone(), processor, ledger.clone()));
    let router = Arc::new(OrderRouter::new(
        directory.clone(),
        commerce.clone(),
        ledger.clone(),
        config.routing.default_service_code.clone(),
    ));
    let reconciler = Arc::new(FulfillmentReconciler::new(
        directory.clone(),
        commerce,
        ledger.clone(),
        settlement,
    ));
    let processor_events = Arc::new(ProcessorEventHandler::new(directory));
    let runner = Arc::new(JobRunner::new(router, reconciler, processor_events));

    let metrics = Arc::new(Metrics::new().expect("Failed to register metrics"));
    let policy = RetryPolicy {
        max_attempts: config.queue.max_attempts,
        base_backoff: Duration::from_millis(config.queue.base_backoff_ms),
        max_backoff: Duration::from_millis(config.queue.max_backoff_ms),
    };

    let queue: Arc<dyn JobQueue> = match config.queue.backend {
        QueueBackend::Local => {
            let (queue, receiver) = LocalQueue::new(config.queue.capacity);
            worker::spawn_local_workers(receiver, config.queue.workers, runner, policy, metrics.clone());
            tracing::info!("Running {} local job workers", config.queue.workers);
            Arc::new(queue)
        }
        QueueBackend::Kafka => {
            let producer = EventProducer::new(&config.kafka.brokers, &config.kafka.jobs_topic)
                .expect("Failed to create Kafka producer");
            let kafka = config.kafka.clone();
            let worker_metrics = metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = worker::start_kafka_worker(
                    kafka.brokers,
                    kafka.group_id,
                    kafka.jobs_topic,
                    runner,
                    policy,
                    worker_metrics,
                )
                .await
                {
                    tracing::error!("Kafka job worker stopped: {}", e);
                }
            });
            Arc::new(producer)
        }
    };

    let app_state = AppState {
        db: Some(db),
        ledger,
        queue,
        quoter: Arc::new(quoter),
        metrics,
        secrets: WebhookSecrets {
            platform_secret: Masked::new(config.platform.app_secret.clone()),
            processor_secret: Masked::new(config.processor.webhook_secret.clone()),
            processor_tolerance_seconds: config.processor.signature_tolerance_seconds,
        },
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind listener");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("Server error");
}
