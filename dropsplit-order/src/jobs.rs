use dropsplit_core::directory::DirectoryError;
use dropsplit_shared::models::Job;
use std::sync::Arc;
use tracing::{info, warn};

use crate::processor_events::ProcessorEventHandler;
use crate::reconciler::{FulfillmentReconciler, ReconcileError};
use crate::router::{GroupFailure, OrderRouter, RoutingError};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("{} supplier group(s) failed to route", .0.len())]
    PartialRouting(Vec<GroupFailure>),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl JobError {
    /// Whether the worker should run the job again.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Routing(e) => e.is_transient(),
            JobError::PartialRouting(failures) => failures.iter().any(|f| f.transient),
            JobError::Reconcile(e) => e.is_transient(),
            JobError::Directory(_) => true,
        }
    }
}

/// Executes one queued [`Job`] against the engine components.
pub struct JobRunner {
    router: Arc<OrderRouter>,
    reconciler: Arc<FulfillmentReconciler>,
    processor_events: Arc<ProcessorEventHandler>,
}

impl JobRunner {
    pub fn new(
        router: Arc<OrderRouter>,
        reconciler: Arc<FulfillmentReconciler>,
        processor_events: Arc<ProcessorEventHandler>,
    ) -> Self {
        Self {
            router,
            reconciler,
            processor_events,
        }
    }

    pub async fn run(&self, job: &Job) -> Result<(), JobError> {
        match job {
            Job::RouteFulfillmentOrder {
                retailer_shop,
                fulfillment_order_id,
            } => {
                let report = self.router.route(retailer_shop, fulfillment_order_id).await?;
                if let Some(reason) = &report.skipped {
                    info!(fulfillment_order = %fulfillment_order_id, reason = %reason, "Routing skipped");
                    return Ok(());
                }
                info!(
                    fulfillment_order = %fulfillment_order_id,
                    created = report.created.len(),
                    already_routed = report.already_routed.len(),
                    failed = report.failed.len(),
                    "Fulfillment order routed"
                );
                if !report.is_complete() {
                    // Rerunning is safe: routed groups are found in the ledger and skipped.
                    return Err(JobError::PartialRouting(report.failed));
                }
            }
            Job::ReconcileFulfillment {
                supplier_shop,
                fulfillment,
            } => {
                let outcome = self.reconciler.reconcile(supplier_shop, fulfillment).await?;
                info!(supplier_fulfillment = %fulfillment.id, ?outcome, "Fulfillment reconciled");
            }
            Job::SupplierOrderCancelled {
                supplier_shop,
                supplier_order_id,
            } => {
                let outcome = self
                    .reconciler
                    .supplier_order_cancelled(supplier_shop, supplier_order_id)
                    .await?;
                info!(supplier_order = %supplier_order_id, ?outcome, "Supplier cancellation reconciled");
            }
            Job::RetailerFulfillmentOrderCancelled {
                retailer_shop,
                fulfillment_order_id,
            } => {
                let outcome = self
                    .reconciler
                    .retailer_fulfillment_order_cancelled(retailer_shop, fulfillment_order_id)
                    .await?;
                info!(fulfillment_order = %fulfillment_order_id, ?outcome, "Retailer cancellation reconciled");
            }
            Job::ProcessorEvent { event_id, event } => {
                let effect = self.processor_events.handle(event_id, event).await?;
                if effect == crate::processor_events::EventEffect::NoMatch {
                    warn!(event_id = %event_id, kind = event.type_name(), "Processor event matched no store");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::SettlementService;
    use crate::testing::{delivery_option, imported_fixture, store_fixture, FakeCommerce, FakeProcessor};
    use dropsplit_core::commerce::{FulfillmentOrderDetails, FulfillmentOrderLine};
    use dropsplit_core::directory::PartnerRole;
    use dropsplit_shared::models::processor::ConnectedAccount;
    use dropsplit_shared::models::{Address, ProcessorEvent};
    use dropsplit_store::{InMemoryDirectory, InMemoryLedger};

    fn runner() -> (Arc<FakeCommerce>, Arc<InMemoryLedger>, JobRunner) {
        let directory = Arc::new(InMemoryDirectory::new());
        let commerce = Arc::new(FakeCommerce::new());
        let ledger = Arc::new(InMemoryLedger::new());

        let retailer = store_fixture("retailer.example.com", PartnerRole::Retailer);
        let supplier = store_fixture("supplier.example.com", PartnerRole::Supplier);
        directory.add_store(retailer.clone());
        directory.add_store(supplier.clone());
        directory.add_imported_variant(retailer.id, imported_fixture(supplier.id, "rv-a", "sv-a"));
        commerce.set_delivery_options("supplier.example.com", vec![delivery_option("Standard", 500)]);
        commerce.add_fulfillment_order(FulfillmentOrderDetails {
            id: "fo-1".into(),
            order_id: "ro-1".into(),
            assigned_location_id: "loc-dropship".into(),
            currency: "USD".into(),
            destination: Address::default(),
            shipping_service_code: None,
            line_items: vec![FulfillmentOrderLine {
                id: "fol-a".into(),
                line_item_id: "li-a".into(),
                variant_id: "rv-a".into(),
                quantity: 1,
                unit_price: 2500,
            }],
        });

        let router = Arc::new(OrderRouter::new(directory.clone(), commerce.clone(), ledger.clone(), "standard"));
        let settlement = Arc::new(SettlementService::new(
            directory.clone(),
            Arc::new(FakeProcessor::new()),
            ledger.clone(),
        ));
        let reconciler = Arc::new(FulfillmentReconciler::new(
            directory.clone(),
            commerce.clone(),
            ledger.clone(),
            settlement,
        ));
        let processor_events = Arc::new(ProcessorEventHandler::new(directory));

        (commerce, ledger, JobRunner::new(router, reconciler, processor_events))
    }

    fn route_job() -> Job {
        Job::RouteFulfillmentOrder {
            retailer_shop: "retailer.example.com".into(),
            fulfillment_order_id: "fo-1".into(),
        }
    }

    #[tokio::test]
    async fn test_route_job_is_safe_to_rerun() {
        let (_, ledger, runner) = runner();

        runner.run(&route_job()).await.unwrap();
        runner.run(&route_job()).await.unwrap();

        assert_eq!(ledger.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_routing_is_retryable() {
        let (commerce, ledger, runner) = runner();
        commerce.fail_shop("supplier.example.com");

        let err = runner.run(&route_job()).await.unwrap_err();

        assert!(matches!(err, JobError::PartialRouting(_)));
        assert!(err.is_transient());
        assert!(ledger.orders().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_processor_event_still_succeeds() {
        let (_, _, runner) = runner();
        let job = Job::ProcessorEvent {
            event_id: "evt_1".into(),
            event: ProcessorEvent::AccountUpdated {
                account: ConnectedAccount {
                    id: "acct_unknown".into(),
                    charges_enabled: false,
                    payouts_enabled: true,
                    details_submitted: false,
                },
            },
        };

        assert!(runner.run(&job).await.is_ok());
    }
}
