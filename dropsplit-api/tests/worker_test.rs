use dropsplit_api::metrics::Metrics;
use dropsplit_api::worker::{execute_with_retry, spawn_local_workers, JobDisposition, LocalQueue, RetryPolicy};
use dropsplit_core::directory::PartnerRole;
use dropsplit_core::queue::JobQueue;
use dropsplit_order::testing::{store_fixture, FakeCommerce, FakeProcessor};
use dropsplit_order::{FulfillmentReconciler, JobRunner, OrderRouter, ProcessorEventHandler, SettlementService};
use dropsplit_shared::models::processor::ConnectedAccount;
use dropsplit_shared::models::{Job, ProcessorEvent};
use dropsplit_store::{InMemoryDirectory, InMemoryLedger};
use std::sync::Arc;
use std::time::Duration;

fn runner(directory: Arc<InMemoryDirectory>, commerce: Arc<FakeCommerce>) -> Arc<JobRunner> {
    let ledger = Arc::new(InMemoryLedger::new());
    let router = Arc::new(OrderRouter::new(directory.clone(), commerce.clone(), ledger.clone(), "standard"));
    let settlement = Arc::new(SettlementService::new(
        directory.clone(),
        Arc::new(FakeProcessor::new()),
        ledger.clone(),
    ));
    let reconciler = Arc::new(FulfillmentReconciler::new(directory.clone(), commerce, ledger, settlement));
    let processor_events = Arc::new(ProcessorEventHandler::new(directory));
    Arc::new(JobRunner::new(router, reconciler, processor_events))
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn route_job() -> Job {
    Job::RouteFulfillmentOrder {
        retailer_shop: "retailer.example.com".into(),
        fulfillment_order_id: "fo-1".into(),
    }
}

fn render(metrics: &Metrics) -> String {
    metrics.render().unwrap()
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let runner = runner(Arc::new(InMemoryDirectory::new()), Arc::new(FakeCommerce::new()));
    let metrics = Metrics::new().unwrap();

    let disposition = execute_with_retry(&runner, &route_job(), &fast_policy(3), &metrics).await;

    assert_eq!(disposition, JobDisposition::Failed);
    assert!(!render(&metrics).contains("outcome=\"retried\""));
}

#[tokio::test]
async fn test_transient_failure_exhausts_attempts() {
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_store(store_fixture("retailer.example.com", PartnerRole::Retailer));
    let commerce = Arc::new(FakeCommerce::new());
    commerce.fail_shop("retailer.example.com");
    let runner = runner(directory, commerce);
    let metrics = Metrics::new().unwrap();

    let disposition = execute_with_retry(&runner, &route_job(), &fast_policy(3), &metrics).await;

    assert_eq!(disposition, JobDisposition::Exhausted);
    let text = render(&metrics);
    assert!(text.contains("outcome=\"retried\""));
    assert!(text.contains("outcome=\"exhausted\""));
}

#[tokio::test]
async fn test_local_workers_drain_queue() {
    let runner = runner(Arc::new(InMemoryDirectory::new()), Arc::new(FakeCommerce::new()));
    let metrics = Arc::new(Metrics::new().unwrap());
    let (queue, receiver) = LocalQueue::new(8);
    let handles = spawn_local_workers(receiver, 2, runner, fast_policy(1), metrics.clone());

    for i in 0..3 {
        let job = Job::ProcessorEvent {
            event_id: format!("evt_{}", i),
            event: ProcessorEvent::AccountUpdated {
                account: ConnectedAccount {
                    id: "acct_unknown".into(),
                    charges_enabled: true,
                    payouts_enabled: true,
                    details_submitted: true,
                },
            },
        };
        queue.enqueue(&job).await.unwrap();
    }
    drop(queue);

    for handle in handles {
        handle.await.unwrap();
    }

    let text = render(&metrics);
    let line = text
        .lines()
        .find(|l| l.starts_with("dropsplit_jobs_total{") && l.contains("outcome=\"ok\""))
        .unwrap();
    assert!(line.ends_with(" 3"));
}
