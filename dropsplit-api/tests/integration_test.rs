use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use dropsplit_api::metrics::Metrics;
use dropsplit_api::platform_webhooks::{PLATFORM_HMAC_HEADER, PLATFORM_SHOP_HEADER};
use dropsplit_api::signing::{sign_platform_body, sign_processor_payload};
use dropsplit_api::webhooks::PROCESSOR_SIGNATURE_HEADER;
use dropsplit_api::{app, AppState, WebhookSecrets};
use dropsplit_core::directory::PartnerRole;
use dropsplit_core::queue::{JobQueue, QueueError};
use dropsplit_order::testing::{delivery_option, imported_fixture, store_fixture, FakeCommerce};
use dropsplit_order::CarrierRateQuoter;
use dropsplit_shared::models::{Job, ProcessorEvent};
use dropsplit_shared::Masked;
use dropsplit_store::{InMemoryDirectory, InMemoryLedger};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const PLATFORM_SECRET: &str = "platform-app-secret";
const PROCESSOR_SECRET: &str = "whsec_integration";

#[derive(Default)]
struct RecordingQueue {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingQueue {
    fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}

struct TestApp {
    router: Router,
    queue: Arc<RecordingQueue>,
    ledger: Arc<InMemoryLedger>,
}

fn test_app(directory: Arc<InMemoryDirectory>, commerce: Arc<FakeCommerce>) -> TestApp {
    let ledger = Arc::new(InMemoryLedger::new());
    let queue = Arc::new(RecordingQueue::default());
    let quoter = CarrierRateQuoter::new(directory, commerce, Duration::from_millis(500));

    let state = AppState {
        db: None,
        ledger: ledger.clone(),
        queue: queue.clone(),
        quoter: Arc::new(quoter),
        metrics: Arc::new(Metrics::new().unwrap()),
        secrets: WebhookSecrets {
            platform_secret: Masked::new(PLATFORM_SECRET.to_string()),
            processor_secret: Masked::new(PROCESSOR_SECRET.to_string()),
            processor_tolerance_seconds: 300,
        },
    };

    TestApp {
        router: app(state),
        queue,
        ledger,
    }
}

fn empty_app() -> TestApp {
    test_app(Arc::new(InMemoryDirectory::new()), Arc::new(FakeCommerce::new()))
}

fn platform_request(uri: &str, shop: &str, body: &Value, secret: &str) -> Request<Body> {
    let bytes = serde_json::to_vec(body).unwrap();
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header(PLATFORM_SHOP_HEADER, shop)
        .header(PLATFORM_HMAC_HEADER, sign_platform_body(&bytes, secret).unwrap())
        .body(Body::from(bytes))
        .unwrap()
}

fn processor_request(body: &Value, secret: &str) -> Request<Body> {
    let bytes = serde_json::to_vec(body).unwrap();
    let now = chrono::Utc::now().timestamp();
    Request::builder()
        .method("POST")
        .uri("/webhooks/processor")
        .header("content-type", "application/json")
        .header(PROCESSOR_SIGNATURE_HEADER, sign_processor_payload(&bytes, secret, now).unwrap())
        .body(Body::from(bytes))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn rate_request(variant_id: &str) -> Value {
    json!({
        "rate": {
            "origin": { "country": "US", "postal_code": "10001" },
            "destination": { "country": "US", "postal_code": "94107", "city": "San Francisco" },
            "items": [
                { "variant_id": variant_id, "quantity": 1, "grams": 500, "price": 2500, "requires_shipping": true }
            ],
            "currency": "USD"
        }
    })
}

fn account_updated(event_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": "account.updated",
        "created": 1_700_000_000,
        "data": {
            "object": { "id": "acct_1", "charges_enabled": true, "payouts_enabled": true, "details_submitted": true }
        }
    })
}

// ============================================================================
// Carrier service
// ============================================================================

#[tokio::test]
async fn test_rates_without_imported_items_are_empty() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_store(store_fixture("retailer.example.com", PartnerRole::Retailer));
    let app = test_app(directory, Arc::new(FakeCommerce::new()));

    let response = app
        .router
        .oneshot(platform_request(
            "/carrier-service/rates",
            "retailer.example.com",
            &rate_request("native-1"),
            PLATFORM_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "rates": [] }));
}

#[tokio::test]
async fn test_rates_blend_supplier_options() {
    let directory = Arc::new(InMemoryDirectory::new());
    let commerce = Arc::new(FakeCommerce::new());
    let retailer = store_fixture("retailer.example.com", PartnerRole::Retailer);
    let supplier = store_fixture("supplier.example.com", PartnerRole::Supplier);
    directory.add_store(retailer.clone());
    directory.add_store(supplier.clone());
    directory.add_imported_variant(retailer.id, imported_fixture(supplier.id, "rv-a", "sv-a"));
    commerce.set_delivery_options("supplier.example.com", vec![delivery_option("Standard", 500)]);
    let app = test_app(directory, commerce);

    let response = app
        .router
        .oneshot(platform_request(
            "/carrier-service/rates",
            "retailer.example.com",
            &rate_request("rv-a"),
            PLATFORM_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let rates = body["rates"].as_array().unwrap();
    assert_eq!(rates.len(), 1);
    assert_eq!(rates[0]["service_code"], "standard");
    assert_eq!(rates[0]["currency"], "USD");
}

#[tokio::test]
async fn test_rates_with_bad_signature_still_answer_200() {
    let app = empty_app();

    let response = app
        .router
        .oneshot(platform_request(
            "/carrier-service/rates",
            "retailer.example.com",
            &rate_request("rv-a"),
            "wrong-secret",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "rates": [] }));
}

#[tokio::test]
async fn test_rates_with_garbage_body_still_answer_200() {
    let app = empty_app();
    let bytes = b"not json".to_vec();
    let request = Request::builder()
        .method("POST")
        .uri("/carrier-service/rates")
        .header(PLATFORM_SHOP_HEADER, "retailer.example.com")
        .header(PLATFORM_HMAC_HEADER, sign_platform_body(&bytes, PLATFORM_SECRET).unwrap())
        .body(Body::from(bytes))
        .unwrap();

    let response = app.router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "rates": [] }));
}

// ============================================================================
// Processor webhooks
// ============================================================================

#[tokio::test]
async fn test_processor_event_is_dispatched_once() {
    let app = empty_app();
    let event = account_updated("evt_dup");

    let first = app
        .router
        .clone()
        .oneshot(processor_request(&event, PROCESSOR_SECRET))
        .await
        .unwrap();
    let second = app
        .router
        .clone()
        .oneshot(processor_request(&event, PROCESSOR_SECRET))
        .await
        .unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_json(second).await["duplicate"], true);

    let jobs = app.queue.jobs();
    assert_eq!(jobs.len(), 1);
    match &jobs[0] {
        Job::ProcessorEvent { event_id, event } => {
            assert_eq!(event_id, "evt_dup");
            assert!(matches!(event, ProcessorEvent::AccountUpdated { .. }));
        }
        other => panic!("unexpected job {:?}", other),
    }
    assert_eq!(app.ledger.processed_webhooks().len(), 1);
}

#[tokio::test]
async fn test_processor_bad_signature_is_rejected() {
    let app = empty_app();

    let response = app
        .router
        .oneshot(processor_request(&account_updated("evt_forged"), "whsec_forged"))
        .await
        .unwrap();

    assert!(response.status().is_server_error());
    assert!(app.queue.jobs().is_empty());
    assert!(app.ledger.processed_webhooks().is_empty());
}

#[tokio::test]
async fn test_processor_unknown_type_is_not_handled() {
    let app = empty_app();
    let event = json!({
        "id": "evt_other",
        "type": "invoice.paid",
        "data": { "object": { "id": "in_1" } }
    });

    let response = app
        .router
        .oneshot(processor_request(&event, PROCESSOR_SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["handled"], false);
    assert!(app.queue.jobs().is_empty());
}

#[tokio::test]
async fn test_processor_malformed_known_type_is_bad_request() {
    let app = empty_app();
    let event = json!({
        "id": "evt_bad",
        "type": "charge.failed",
        "data": { "object": { "id": "ch_1" } }
    });

    let response = app
        .router
        .oneshot(processor_request(&event, PROCESSOR_SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.queue.jobs().is_empty());
    assert!(app.ledger.processed_webhooks().is_empty());
}

// ============================================================================
// Platform webhooks
// ============================================================================

#[tokio::test]
async fn test_routing_complete_is_queued() {
    let app = empty_app();
    let body = json!({ "fulfillment_order": { "id": 1001, "status": "open" } });

    let response = app
        .router
        .oneshot(platform_request(
            "/webhooks/platform/fulfillment_orders/routing_complete",
            "retailer.example.com",
            &body,
            PLATFORM_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        app.queue.jobs(),
        vec![Job::RouteFulfillmentOrder {
            retailer_shop: "retailer.example.com".into(),
            fulfillment_order_id: "1001".into(),
        }]
    );
}

#[tokio::test]
async fn test_platform_webhook_bad_hmac_is_unauthorized() {
    let app = empty_app();
    let body = json!({ "id": 77 });

    let response = app
        .router
        .oneshot(platform_request(
            "/webhooks/platform/orders/cancelled",
            "supplier.example.com",
            &body,
            "wrong-secret",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.queue.jobs().is_empty());
}

#[tokio::test]
async fn test_platform_webhook_unknown_topic_is_bad_request() {
    let app = empty_app();

    let response = app
        .router
        .oneshot(platform_request(
            "/webhooks/platform/products/update",
            "supplier.example.com",
            &json!({ "id": 1 }),
            PLATFORM_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.queue.jobs().is_empty());
}

// ============================================================================
// Operations
// ============================================================================

#[tokio::test]
async fn test_health_and_metrics() {
    let app = empty_app();

    app.router
        .clone()
        .oneshot(processor_request(&account_updated("evt_m"), PROCESSOR_SECRET))
        .await
        .unwrap();

    let health = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let metrics = app
        .router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = String::from_utf8(metrics.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
    assert!(text.contains("dropsplit_webhooks_received_total"));
}
