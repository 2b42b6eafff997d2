use dropsplit_core::commerce::{CommerceError, CommercePlatform, MirrorFulfillment, MirrorLine, StoreHandle};
use dropsplit_core::directory::{DirectoryError, PartnerDirectory, StoreAccount};
use dropsplit_core::ledger::{FulfilledLine, Fulfillment, Order, OrderLineItem, PaymentStatus};
use dropsplit_core::repository::{FulfillmentRecord, LedgerError, LedgerRepository};
use dropsplit_shared::models::events::{FulfillmentStatus, SupplierFulfillment};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::quantities::{self, ShippedLine};
use crate::settlement::{SettlementError, SettlementOutcome, SettlementService};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Store {0} is not registered")]
    UnknownStore(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Commerce(#[from] CommerceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

impl ReconcileError {
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::UnknownStore(_) => false,
            ReconcileError::Directory(_) => true,
            ReconcileError::Commerce(e) => e.is_transient(),
            ReconcileError::Ledger(e) => e.is_transient(),
            ReconcileError::Settlement(e) => e.is_transient(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The event concerns an order the ledger does not track.
    NotTracked,
    /// The supplier has not shipped yet; nothing is counted or mirrored.
    NotShipped {
        order_id: Uuid,
    },
    Shipment {
        order_id: Uuid,
        /// Units newly counted as fulfilled by this delivery.
        units: i32,
        retailer_fulfillment_id: Option<String>,
        settlement: Option<SettlementOutcome>,
    },
    ShipmentCancelled {
        order_id: Uuid,
        units: i32,
    },
    Cancelled {
        order_ids: Vec<Uuid>,
        units: i32,
    },
}

pub struct FulfillmentReconciler {
    directory: Arc<dyn PartnerDirectory>,
    commerce: Arc<dyn CommercePlatform>,
    ledger: Arc<dyn LedgerRepository>,
    settlement: Arc<SettlementService>,
}

fn shipped_lines(fulfillment: &SupplierFulfillment) -> Vec<ShippedLine> {
    fulfillment
        .line_items
        .iter()
        .map(|l| ShippedLine {
            supplier_line_item_id: l.line_item_id.clone(),
            quantity: i32::try_from(l.quantity).unwrap_or(i32::MAX),
        })
        .collect()
}

fn to_units(delta: i32) -> u32 {
    u32::try_from(delta).unwrap_or(0)
}

/// Mirror lines for an already-recorded shipment: the units it counted.
fn remirror_lines(lines: &[OrderLineItem], counted: &[FulfilledLine]) -> Vec<MirrorLine> {
    counted
        .iter()
        .filter_map(|c| {
            let line = lines.iter().find(|l| l.id == c.line_id)?;
            let quantity = to_units(c.quantity);
            (quantity > 0).then(|| MirrorLine {
                fulfillment_order_line_id: line.retailer_line_item_id.clone(),
                quantity,
            })
        })
        .collect()
}

impl FulfillmentReconciler {
    pub fn new(
        directory: Arc<dyn PartnerDirectory>,
        commerce: Arc<dyn CommercePlatform>,
        ledger: Arc<dyn LedgerRepository>,
        settlement: Arc<SettlementService>,
    ) -> Self {
        Self {
            directory,
            commerce,
            ledger,
            settlement,
        }
    }

    async fn tracked_order(
        &self,
        supplier_shop: &str,
        supplier_order_id: &str,
    ) -> Result<Option<(Order, StoreAccount)>, ReconcileError> {
        let Some(supplier) = self.directory.store_by_domain(supplier_shop).await? else {
            debug!(shop = supplier_shop, "Event from unknown store");
            return Ok(None);
        };

        let Some(order) = self
            .ledger
            .find_order_by_supplier_order(supplier.id, supplier_order_id)
            .await?
        else {
            debug!(shop = supplier_shop, supplier_order = supplier_order_id, "Supplier order is not tracked");
            return Ok(None);
        };

        let retailer = self
            .directory
            .store_by_id(order.retailer_id)
            .await?
            .ok_or_else(|| ReconcileError::UnknownStore(order.retailer_id.to_string()))?;

        Ok(Some((order, retailer)))
    }

    /// Apply a supplier fulfillment create/update: count shipped units once,
    /// mirror the shipment on the retailer store, keep tracking current and
    /// settle once the carrier reports delivery.
    pub async fn reconcile(
        &self,
        supplier_shop: &str,
        fulfillment: &SupplierFulfillment,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some((order, retailer)) = self.tracked_order(supplier_shop, &fulfillment.order_id).await? else {
            return Ok(ReconcileOutcome::NotTracked);
        };

        if fulfillment.status.is_cancellation() {
            return self.cancel_shipment(&order, &retailer, fulfillment).await;
        }
        if fulfillment.status != FulfillmentStatus::Success {
            debug!(order_id = %order.id, supplier_fulfillment = %fulfillment.id, status = ?fulfillment.status, "Shipment not sent yet");
            return Ok(ReconcileOutcome::NotShipped { order_id: order.id });
        }

        let retailer_handle = retailer.handle();
        let counted = shipped_lines(fulfillment);
        let tracking = fulfillment.tracking();

        let record = self
            .ledger
            .record_fulfillment(order.id, &fulfillment.id, &move |lines: &mut [OrderLineItem]| {
                quantities::apply_shipment(lines, &counted)?;
                Ok(None)
            })
            .await?;

        let (units, retailer_fulfillment_id) = match record {
            FulfillmentRecord::Created { fulfillment: row, update } => {
                let lines: Vec<MirrorLine> = update
                    .fulfilled_deltas()
                    .into_iter()
                    .map(|(line, delta)| MirrorLine {
                        fulfillment_order_line_id: line.retailer_line_item_id.clone(),
                        quantity: to_units(delta),
                    })
                    .collect();
                let units: i32 = update.fulfilled_deltas().iter().map(|(_, d)| *d).sum();
                let mirrored = self.mirror(&order, &retailer_handle, &row, lines, fulfillment).await?;
                (units, mirrored)
            }
            FulfillmentRecord::Existing(row) => match &row.retailer_fulfillment_id {
                Some(retailer_fulfillment_id) => {
                    if !tracking.is_empty() {
                        self.commerce
                            .update_tracking(&retailer_handle, retailer_fulfillment_id, &tracking)
                            .await?;
                        debug!(order_id = %order.id, fulfillment = %retailer_fulfillment_id, "Tracking updated");
                    }
                    (0, Some(retailer_fulfillment_id.clone()))
                }
                None => {
                    // Counted earlier but the mirror call never completed.
                    let current = self.ledger.line_items(order.id).await?;
                    let lines = remirror_lines(&current, &row.lines);
                    let mirrored = self.mirror(&order, &retailer_handle, &row, lines, fulfillment).await?;
                    (0, mirrored)
                }
            },
        };

        let settlement = if fulfillment.is_delivered() {
            Some(self.settlement.settle(order.id, &fulfillment.id).await?)
        } else {
            None
        };

        Ok(ReconcileOutcome::Shipment {
            order_id: order.id,
            units,
            retailer_fulfillment_id,
            settlement,
        })
    }

    async fn mirror(
        &self,
        order: &Order,
        retailer: &StoreHandle,
        row: &Fulfillment,
        lines: Vec<MirrorLine>,
        fulfillment: &SupplierFulfillment,
    ) -> Result<Option<String>, ReconcileError> {
        if lines.is_empty() {
            debug!(order_id = %order.id, supplier_fulfillment = %fulfillment.id, "Nothing new to mirror");
            return Ok(None);
        }

        let mirror = MirrorFulfillment {
            fulfillment_order_id: order.retailer_fulfillment_order_id.clone(),
            lines,
            tracking: fulfillment.tracking(),
            notify_customer: true,
        };
        let retailer_fulfillment_id = self.commerce.create_fulfillment(retailer, &mirror).await?;
        self.ledger
            .set_retailer_fulfillment(row.id, &retailer_fulfillment_id)
            .await?;

        info!(
            order_id = %order.id,
            supplier_fulfillment = %fulfillment.id,
            retailer_fulfillment = %retailer_fulfillment_id,
            "Shipment mirrored to retailer"
        );
        Ok(Some(retailer_fulfillment_id))
    }

    async fn cancel_shipment(
        &self,
        order: &Order,
        retailer: &StoreAccount,
        fulfillment: &SupplierFulfillment,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(existing) = self.ledger.find_fulfillment(&fulfillment.id).await? else {
            debug!(supplier_fulfillment = %fulfillment.id, "Cancelled shipment was never recorded");
            return Ok(ReconcileOutcome::ShipmentCancelled {
                order_id: order.id,
                units: 0,
            });
        };

        // Its units may already be charged; let the settlement finish first.
        if let Some(open) = self.ledger.open_settlement(order.id).await? {
            if open.fulfillment_id == existing.id {
                return Err(SettlementError::InProgress(order.id).into());
            }
        }

        let handle = retailer.handle();
        if let Some(retailer_fulfillment_id) = &existing.retailer_fulfillment_id {
            match self.commerce.cancel_fulfillment(&handle, retailer_fulfillment_id).await {
                Ok(()) => {}
                Err(CommerceError::UserErrors(errors)) => {
                    warn!(fulfillment = %retailer_fulfillment_id, ?errors, "Retailer fulfillment not cancellable, continuing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self
            .commerce
            .reopen_fulfillment_order(&handle, &order.retailer_fulfillment_order_id)
            .await
        {
            Ok(()) => {}
            Err(CommerceError::UserErrors(errors)) => {
                warn!(fulfillment_order = %order.retailer_fulfillment_order_id, ?errors, "Fulfillment order not reopened");
            }
            Err(e) => return Err(e.into()),
        }

        let counted = existing.lines.clone();
        let removed = self
            .ledger
            .remove_fulfillment(&fulfillment.id, &move |lines: &mut [OrderLineItem]| {
                quantities::revert_shipment(lines, &counted)?;
                Ok(None)
            })
            .await?;

        let units = removed
            .map(|(_, update)| -update.fulfilled_deltas().iter().map(|(_, d)| *d).sum::<i32>())
            .unwrap_or(0);

        info!(order_id = %order.id, supplier_fulfillment = %fulfillment.id, units, "Supplier shipment cancelled");
        Ok(ReconcileOutcome::ShipmentCancelled {
            order_id: order.id,
            units,
        })
    }

    /// The supplier cancelled its order: every unit not yet shipped is cancelled.
    pub async fn supplier_order_cancelled(
        &self,
        supplier_shop: &str,
        supplier_order_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some((order, _)) = self.tracked_order(supplier_shop, supplier_order_id).await? else {
            return Ok(ReconcileOutcome::NotTracked);
        };

        let update = self
            .ledger
            .update_line_items(order.id, &|lines: &mut [OrderLineItem]| {
                quantities::cancel_remaining(lines)?;
                Ok(Some(PaymentStatus::derive(lines)))
            })
            .await?;

        let units = update.cancelled_units();
        info!(order_id = %order.id, units, status = %update.payment_status, "Supplier order cancelled");
        Ok(ReconcileOutcome::Cancelled {
            order_ids: vec![order.id],
            units,
        })
    }

    /// The retailer cancelled its fulfillment order: cancel the open supplier
    /// orders behind it, then cancel their unshipped units.
    pub async fn retailer_fulfillment_order_cancelled(
        &self,
        retailer_shop: &str,
        fulfillment_order_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let Some(retailer) = self.directory.store_by_domain(retailer_shop).await? else {
            debug!(shop = retailer_shop, "Cancellation from unknown store");
            return Ok(ReconcileOutcome::NotTracked);
        };

        let orders = self
            .ledger
            .orders_for_fulfillment_order(retailer.id, fulfillment_order_id)
            .await?;
        if orders.is_empty() {
            return Ok(ReconcileOutcome::NotTracked);
        }

        let mut order_ids = Vec::with_capacity(orders.len());
        let mut units = 0;

        for order in orders {
            let lines = self.ledger.line_items(order.id).await?;
            if lines.iter().any(|l| l.remaining() > 0) {
                let supplier = self
                    .directory
                    .store_by_id(order.supplier_id)
                    .await?
                    .ok_or_else(|| ReconcileError::UnknownStore(order.supplier_id.to_string()))?;

                match self.commerce.cancel_order(&supplier.handle(), &order.supplier_order_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => {
                        warn!(
                            order_id = %order.id,
                            supplier_order = %order.supplier_order_id,
                            error = %e,
                            "Supplier order could not be cancelled, cancelling ledger units anyway"
                        );
                    }
                }
            }

            let update = self
                .ledger
                .update_line_items(order.id, &|lines: &mut [OrderLineItem]| {
                    quantities::cancel_remaining(lines)?;
                    let shipped = lines.iter().any(|l| l.quantity_fulfilled > 0);
                    let status = if !shipped && quantities::total_paid(lines) == 0 {
                        PaymentStatus::Cancelled
                    } else {
                        PaymentStatus::derive(lines)
                    };
                    Ok(Some(status))
                })
                .await?;

            units += update.cancelled_units();
            order_ids.push(order.id);
            info!(
                order_id = %order.id,
                cancelled = update.cancelled_units(),
                status = %update.payment_status,
                "Retailer cancellation applied"
            );
        }

        Ok(ReconcileOutcome::Cancelled { order_ids, units })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::OrderRouter;
    use crate::testing::{delivery_option, imported_fixture, store_fixture, FakeCommerce, FakeProcessor};
    use dropsplit_core::commerce::{FulfillmentOrderDetails, FulfillmentOrderLine};
    use dropsplit_core::directory::{PartnerRole, PaymentProfile};
    use dropsplit_shared::models::events::{FulfillmentLine, FulfillmentStatus, ShipmentStatus};
    use dropsplit_shared::models::Address;
    use dropsplit_store::{InMemoryDirectory, InMemoryLedger};

    struct Harness {
        directory: Arc<InMemoryDirectory>,
        commerce: Arc<FakeCommerce>,
        processor: Arc<FakeProcessor>,
        ledger: Arc<InMemoryLedger>,
        reconciler: FulfillmentReconciler,
        s1: StoreAccount,
        s2: StoreAccount,
        retailer: StoreAccount,
    }

    fn fo_line(id: &str, variant_id: &str, quantity: u32) -> FulfillmentOrderLine {
        FulfillmentOrderLine {
            id: id.into(),
            line_item_id: format!("li-{}", id),
            variant_id: variant_id.into(),
            quantity,
            unit_price: 2500,
        }
    }

    /// Retailer fulfillment order fo-1: 2 units from s1, 1 unit from s2, routed.
    async fn routed() -> Harness {
        let directory = Arc::new(InMemoryDirectory::new());
        let commerce = Arc::new(FakeCommerce::new());
        let processor = Arc::new(FakeProcessor::new());
        let ledger = Arc::new(InMemoryLedger::new());

        let retailer = store_fixture("retailer.example.com", PartnerRole::Retailer);
        let s1 = store_fixture("s1.example.com", PartnerRole::Supplier);
        let s2 = store_fixture("s2.example.com", PartnerRole::Supplier);
        for store in [&retailer, &s1, &s2] {
            directory.add_store(store.clone());
        }
        directory.add_imported_variant(retailer.id, imported_fixture(s1.id, "rv-a", "sv-a"));
        directory.add_imported_variant(retailer.id, imported_fixture(s2.id, "rv-b", "sv-b"));
        directory.set_payment_profile(
            retailer.id,
            PaymentProfile {
                customer_id: Some("cus_retailer".into()),
                default_payment_method_id: Some("pm_card".into()),
                ..Default::default()
            },
        );
        for (store, account) in [(&s1, "acct_s1"), (&s2, "acct_s2")] {
            directory.set_payment_profile(
                store.id,
                PaymentProfile {
                    connected_account_id: Some(account.into()),
                    payouts_enabled: true,
                    ..Default::default()
                },
            );
        }

        commerce.set_delivery_options("s1.example.com", vec![delivery_option("Standard", 500)]);
        commerce.set_delivery_options("s2.example.com", vec![delivery_option("Standard", 700)]);
        commerce.add_fulfillment_order(FulfillmentOrderDetails {
            id: "fo-1".into(),
            order_id: "ro-1".into(),
            assigned_location_id: "loc-dropship".into(),
            currency: "USD".into(),
            destination: Address::default(),
            shipping_service_code: Some("standard".into()),
            line_items: vec![fo_line("fol-a", "rv-a", 2), fo_line("fol-b", "rv-b", 1)],
        });

        let router = OrderRouter::new(directory.clone(), commerce.clone(), ledger.clone(), "standard");
        let report = router.route("retailer.example.com", "fo-1").await.unwrap();
        assert_eq!(report.created.len(), 2);

        let settlement = Arc::new(SettlementService::new(directory.clone(), processor.clone(), ledger.clone()));
        let reconciler = FulfillmentReconciler::new(directory.clone(), commerce.clone(), ledger.clone(), settlement);

        Harness {
            directory,
            commerce,
            processor,
            ledger,
            reconciler,
            s1,
            s2,
            retailer,
        }
    }

    impl Harness {
        async fn order_for(&self, supplier: &StoreAccount) -> (Order, Vec<OrderLineItem>) {
            let order = self
                .ledger
                .find_order_for_supplier("fo-1", supplier.id)
                .await
                .unwrap()
                .unwrap();
            let lines = self.ledger.line_items(order.id).await.unwrap();
            (order, lines)
        }

        async fn shipment(&self, id: &str, quantity: u32, shipment_status: Option<ShipmentStatus>) -> SupplierFulfillment {
            let (order, lines) = self.order_for(&self.s1).await;
            SupplierFulfillment {
                id: id.into(),
                order_id: order.supplier_order_id,
                status: FulfillmentStatus::Success,
                shipment_status,
                tracking_company: Some("UPS".into()),
                tracking_numbers: vec!["1Z999".into()],
                tracking_urls: vec![],
                line_items: vec![FulfillmentLine {
                    line_item_id: lines[0].supplier_line_item_id.clone(),
                    quantity,
                }],
            }
        }
    }

    #[tokio::test]
    async fn test_two_supplier_scenario() {
        let h = routed().await;

        // s1 ships 2/2.
        let shipped = h.shipment("f-1", 2, Some(ShipmentStatus::InTransit)).await;
        let outcome = h.reconciler.reconcile("s1.example.com", &shipped).await.unwrap();
        match outcome {
            ReconcileOutcome::Shipment { units, retailer_fulfillment_id, settlement, .. } => {
                assert_eq!(units, 2);
                assert!(retailer_fulfillment_id.is_some());
                assert!(settlement.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        let mirrored = h.commerce.mirrored();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].0, "retailer.example.com");
        assert_eq!(mirrored[0].1.lines[0].fulfillment_order_line_id, "fol-a");
        assert_eq!(mirrored[0].1.lines[0].quantity, 2);

        let (_, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_fulfilled, 2);

        // Delivery confirmation settles units plus shipping.
        let delivered = h.shipment("f-1", 2, Some(ShipmentStatus::Delivered)).await;
        let outcome = h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap();
        match outcome {
            ReconcileOutcome::Shipment { settlement: Some(settlement), .. } => assert_eq!(
                settlement,
                SettlementOutcome::Settled {
                    charged: 2 * 1800 + 500,
                    transferred: 2 * 1500 + 500,
                    units: 2,
                    status: PaymentStatus::Paid,
                }
            ),
            other => panic!("unexpected {:?}", other),
        }

        let (order, lines) = h.order_for(&h.s1).await;
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert_eq!(lines[0].quantity_paid, 2);
        assert_eq!(h.processor.charges()[0].customer_id, "cus_retailer");
        assert_eq!(h.processor.transfers()[0].destination_account, "acct_s1");

        // s2 cancels before shipping.
        let (order2, _) = h.order_for(&h.s2).await;
        let outcome = h
            .reconciler
            .supplier_order_cancelled("s2.example.com", &order2.supplier_order_id)
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Cancelled { order_ids: vec![order2.id], units: 1 });

        let (order2, lines2) = h.order_for(&h.s2).await;
        assert_eq!(lines2[0].quantity, 1);
        assert_eq!(lines2[0].quantity_cancelled, 1);
        assert_eq!(order2.payment_status, PaymentStatus::Incomplete);
    }

    #[tokio::test]
    async fn test_redelivered_delivery_moves_no_more_money() {
        let h = routed().await;
        let delivered = h.shipment("f-1", 2, Some(ShipmentStatus::Delivered)).await;

        h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap();
        let outcome = h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap();

        match outcome {
            ReconcileOutcome::Shipment { units, settlement, .. } => {
                assert_eq!(units, 0);
                assert_eq!(settlement, Some(SettlementOutcome::NothingToSettle { status: PaymentStatus::Paid }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.processor.charges().len(), 1);
        assert_eq!(h.processor.transfers().len(), 1);
        assert_eq!(h.commerce.mirrored().len(), 1);
        assert_eq!(h.commerce.tracking_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_declined_charge_leaves_paid_quantity_alone() {
        let h = routed().await;
        h.processor.decline_charges(true);
        let delivered = h.shipment("f-1", 2, Some(ShipmentStatus::Delivered)).await;

        let err = h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Settlement(SettlementError::Payment { .. })));
        assert!(err.is_transient());

        let (order, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_fulfilled, 2);
        assert_eq!(lines[0].quantity_paid, 0);
        assert_eq!(order.payment_status, PaymentStatus::Incomplete);
        assert!(h.processor.transfers().is_empty());

        h.processor.decline_charges(false);
        h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap();

        let (order, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_paid, 2);
        assert_eq!(order.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_failed_transfer_is_not_charged_twice() {
        let h = routed().await;
        h.processor.fail_transfers(true);
        let first = h.shipment("f-1", 1, Some(ShipmentStatus::Delivered)).await;

        let err = h.reconciler.reconcile("s1.example.com", &first).await.unwrap_err();
        assert!(err.is_transient());
        let (_, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_paid, 0);

        // A second delivery lands before the first one is redriven.
        h.processor.fail_transfers(false);
        let second = h.shipment("f-2", 1, Some(ShipmentStatus::Delivered)).await;
        h.reconciler.reconcile("s1.example.com", &second).await.unwrap();

        let charged: i64 = h.processor.charges().iter().map(|c| c.amount).sum();
        let transferred: i64 = h.processor.transfers().iter().map(|t| t.amount).sum();
        assert_eq!(h.processor.charges().len(), 2);
        assert_eq!(charged, 2 * 1800 + 500);
        assert_eq!(transferred, 2 * 1500 + 500);

        let (order, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_paid, 2);
        assert_eq!(order.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_redriven_delivery_reuses_the_recorded_charge() {
        let h = routed().await;
        h.processor.fail_transfers(true);
        let delivered = h.shipment("f-1", 1, Some(ShipmentStatus::Delivered)).await;
        h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap_err();

        h.processor.fail_transfers(false);
        let outcome = h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap();

        match outcome {
            ReconcileOutcome::Shipment { settlement: Some(settlement), .. } => assert_eq!(
                settlement,
                SettlementOutcome::Settled {
                    charged: 1800 + 500,
                    transferred: 1500 + 500,
                    units: 1,
                    status: PaymentStatus::PartiallyPaid,
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.processor.charges().len(), 1);
        assert_eq!(h.processor.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_shipment_with_settlement_in_flight_is_not_cancelled() {
        let h = routed().await;
        h.processor.fail_transfers(true);
        let delivered = h.shipment("f-1", 2, Some(ShipmentStatus::Delivered)).await;
        h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap_err();

        let mut cancelled = delivered.clone();
        cancelled.status = FulfillmentStatus::Cancelled;
        let err = h.reconciler.reconcile("s1.example.com", &cancelled).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Settlement(SettlementError::InProgress(_))));
        assert!(err.is_transient());
        let (_, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_fulfilled, 2);
        assert!(h.commerce.cancelled_fulfillments().is_empty());
    }

    #[tokio::test]
    async fn test_supplier_without_payouts_is_not_settled() {
        let h = routed().await;
        h.directory.set_payment_profile(h.s1.id, PaymentProfile::default());
        let delivered = h.shipment("f-1", 2, Some(ShipmentStatus::Delivered)).await;

        let err = h.reconciler.reconcile("s1.example.com", &delivered).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Settlement(SettlementError::Payment { .. })));
        assert!(h.processor.charges().is_empty());
        let (_, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_paid, 0);
    }

    #[tokio::test]
    async fn test_failed_mirror_is_retried_without_recounting() {
        let h = routed().await;
        h.commerce.fail_shop("retailer.example.com");
        let shipped = h.shipment("f-1", 2, None).await;

        let err = h.reconciler.reconcile("s1.example.com", &shipped).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.ledger.fulfillments()[0].retailer_fulfillment_id, None);

        h.commerce.recover_shop("retailer.example.com");
        let outcome = h.reconciler.reconcile("s1.example.com", &shipped).await.unwrap();

        match outcome {
            ReconcileOutcome::Shipment { units, retailer_fulfillment_id, .. } => {
                assert_eq!(units, 0);
                assert!(retailer_fulfillment_id.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        let (_, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_fulfilled, 2);
        assert_eq!(h.commerce.mirrored()[0].1.lines[0].quantity, 2);
    }

    #[tokio::test]
    async fn test_cancelled_shipment_returns_units_to_outstanding() {
        let h = routed().await;
        let shipped = h.shipment("f-1", 2, None).await;
        h.reconciler.reconcile("s1.example.com", &shipped).await.unwrap();

        let mut cancelled = shipped.clone();
        cancelled.status = FulfillmentStatus::Cancelled;
        let outcome = h.reconciler.reconcile("s1.example.com", &cancelled).await.unwrap();

        let (order, lines) = h.order_for(&h.s1).await;
        assert_eq!(outcome, ReconcileOutcome::ShipmentCancelled { order_id: order.id, units: 2 });
        assert_eq!(lines[0].quantity_fulfilled, 0);
        assert_eq!(lines[0].quantity_cancelled, 0);
        assert_eq!(h.commerce.cancelled_fulfillments().len(), 1);
        assert_eq!(h.commerce.reopened(), vec![("retailer.example.com".to_string(), "fo-1".to_string())]);
        assert!(h.ledger.fulfillments().is_empty());

        // A replacement shipment counts again.
        let reshipped = h.shipment("f-2", 2, None).await;
        h.reconciler.reconcile("s1.example.com", &reshipped).await.unwrap();
        let (_, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_fulfilled, 2);
    }

    #[tokio::test]
    async fn test_cancelling_a_capped_shipment_keeps_the_other_live() {
        let h = routed().await;
        let first = h.shipment("f-1", 1, None).await;
        h.reconciler.reconcile("s1.example.com", &first).await.unwrap();

        // Reports 2 units but only 1 was still outstanding.
        let capped = h.shipment("f-2", 2, None).await;
        let outcome = h.reconciler.reconcile("s1.example.com", &capped).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Shipment { units: 1, .. }));

        let mut cancelled = capped.clone();
        cancelled.status = FulfillmentStatus::Cancelled;
        let outcome = h.reconciler.reconcile("s1.example.com", &cancelled).await.unwrap();

        let (order, lines) = h.order_for(&h.s1).await;
        assert_eq!(outcome, ReconcileOutcome::ShipmentCancelled { order_id: order.id, units: 1 });
        assert_eq!(lines[0].quantity_fulfilled, 1);
        assert_eq!(h.ledger.fulfillments().len(), 1);
        assert_eq!(h.ledger.fulfillments()[0].supplier_fulfillment_id, "f-1");
    }

    #[tokio::test]
    async fn test_pending_shipment_is_not_counted() {
        let h = routed().await;
        let mut pending = h.shipment("f-1", 2, None).await;
        pending.status = FulfillmentStatus::Pending;

        let outcome = h.reconciler.reconcile("s1.example.com", &pending).await.unwrap();

        let (order, lines) = h.order_for(&h.s1).await;
        assert_eq!(outcome, ReconcileOutcome::NotShipped { order_id: order.id });
        assert_eq!(lines[0].quantity_fulfilled, 0);
        assert!(h.commerce.mirrored().is_empty());
        assert!(h.ledger.fulfillments().is_empty());

        pending.status = FulfillmentStatus::Open;
        h.reconciler.reconcile("s1.example.com", &pending).await.unwrap();
        assert!(h.ledger.fulfillments().is_empty());

        pending.status = FulfillmentStatus::Success;
        let outcome = h.reconciler.reconcile("s1.example.com", &pending).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Shipment { units: 2, .. }));
        assert_eq!(h.commerce.mirrored().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_tolerates_already_cancelled_mirror() {
        let h = routed().await;
        let shipped = h.shipment("f-1", 1, None).await;
        let outcome = h.reconciler.reconcile("s1.example.com", &shipped).await.unwrap();
        let ReconcileOutcome::Shipment { retailer_fulfillment_id: Some(mirror_id), .. } = outcome else {
            panic!("expected mirrored shipment");
        };
        h.commerce.reject_fulfillment_cancel(&mirror_id);

        let mut cancelled = shipped.clone();
        cancelled.status = FulfillmentStatus::Failure;
        h.reconciler.reconcile("s1.example.com", &cancelled).await.unwrap();

        let (_, lines) = h.order_for(&h.s1).await;
        assert_eq!(lines[0].quantity_fulfilled, 0);
    }

    #[tokio::test]
    async fn test_retailer_cancellation_cancels_supplier_orders() {
        let h = routed().await;
        let shipped = h.shipment("f-1", 1, None).await;
        h.reconciler.reconcile("s1.example.com", &shipped).await.unwrap();

        let outcome = h
            .reconciler
            .retailer_fulfillment_order_cancelled("retailer.example.com", "fo-1")
            .await
            .unwrap();

        let ReconcileOutcome::Cancelled { order_ids, units } = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(order_ids.len(), 2);
        assert_eq!(units, 2);
        assert_eq!(h.commerce.cancelled_orders().len(), 2);

        let (order1, lines1) = h.order_for(&h.s1).await;
        assert_eq!(lines1[0].quantity_fulfilled, 1);
        assert_eq!(lines1[0].quantity_cancelled, 1);
        // The shipped unit is still owed once delivered.
        assert_eq!(order1.payment_status, PaymentStatus::Incomplete);
        let (order2, _) = h.order_for(&h.s2).await;
        assert_eq!(order2.payment_status, PaymentStatus::Cancelled);

        // Replaying the cancellation changes nothing.
        let replay = h
            .reconciler
            .retailer_fulfillment_order_cancelled("retailer.example.com", "fo-1")
            .await
            .unwrap();
        assert!(matches!(replay, ReconcileOutcome::Cancelled { units: 0, .. }));
        assert_eq!(h.commerce.cancelled_orders().len(), 2);
    }

    #[tokio::test]
    async fn test_untracked_orders_are_ignored() {
        let h = routed().await;
        let mut stray = h.shipment("f-9", 1, None).await;
        stray.order_id = "not-ours".into();

        assert_eq!(
            h.reconciler.reconcile("s1.example.com", &stray).await.unwrap(),
            ReconcileOutcome::NotTracked
        );
        assert_eq!(
            h.reconciler.supplier_order_cancelled("unknown.example.com", "1").await.unwrap(),
            ReconcileOutcome::NotTracked
        );
        assert_eq!(
            h.reconciler
                .retailer_fulfillment_order_cancelled(&h.retailer.shop_domain, "fo-404")
                .await
                .unwrap(),
            ReconcileOutcome::NotTracked
        );
    }
}
