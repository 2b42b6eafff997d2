use chrono::{DateTime, Utc};
use dropsplit_core::directory::{DirectoryError, PartnerDirectory};
use dropsplit_core::ledger::{
    FulfilledLine, Fulfillment, Order, OrderLineItem, PaidTarget, PaymentStatus, SettlementAttempt, SettlementState,
};
use dropsplit_core::payment::{ChargeRequest, PaymentError, PaymentProcessor, TransferRequest};
use dropsplit_core::repository::{LedgerError, LedgerRepository};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::quantities;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Order {0} has a settlement in flight")]
    InProgress(Uuid),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Settlement of order {order_id} failed: {source}")]
    Payment {
        order_id: Uuid,
        #[source]
        source: PaymentError,
    },
}

impl SettlementError {
    pub fn is_transient(&self) -> bool {
        match self {
            SettlementError::OrderNotFound(_) => false,
            SettlementError::InProgress(_) => true,
            SettlementError::Ledger(e) => e.is_transient(),
            SettlementError::Directory(_) => true,
            SettlementError::Payment { source, .. } => source.is_transient(),
        }
    }
}

/// Money owed for the units one delivered shipment counted, computed from a
/// locked read of the Order's lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementPlan {
    pub order_id: Uuid,
    pub fulfillment_id: Uuid,
    pub currency: String,
    pub targets: Vec<PaidTarget>,
    /// Retailer cost for the units plus shipping on the first settlement.
    pub retailer_charge: i64,
    /// Supplier payout for the units plus shipping on the first settlement.
    pub supplier_payout: i64,
    pub includes_shipping: bool,
}

impl SettlementPlan {
    /// Units shipped by other fulfillments of the Order are left for their own delivery.
    pub fn for_fulfillment(order: &Order, fulfillment: &Fulfillment, lines: &[OrderLineItem]) -> Self {
        let mut targets = Vec::new();
        let mut retailer_charge = 0i64;
        let mut supplier_payout = 0i64;

        for counted in &fulfillment.lines {
            let Some(line) = lines.iter().find(|l| l.id == counted.line_id) else {
                continue;
            };
            let units = counted.quantity.min(line.unpaid_fulfilled());
            if units <= 0 {
                continue;
            }
            targets.push(PaidTarget {
                line_id: line.id,
                paid_from: line.quantity_paid,
                paid_to: line.quantity_paid + units,
            });
            retailer_charge += line.retailer_cost_per_unit() * i64::from(units);
            supplier_payout += line.supplier_profit_per_unit * i64::from(units);
        }

        let includes_shipping = !targets.is_empty() && quantities::total_paid(lines) == 0 && order.shipping_cost > 0;
        if includes_shipping {
            retailer_charge += order.shipping_cost;
            supplier_payout += order.shipping_cost;
        }

        Self {
            order_id: order.id,
            fulfillment_id: fulfillment.id,
            currency: order.currency.clone(),
            targets,
            retailer_charge,
            supplier_payout,
            includes_shipping,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn units(&self) -> i32 {
        self.targets.iter().map(|t| t.paid_to - t.paid_from).sum()
    }

    fn into_attempt(self, now: DateTime<Utc>) -> SettlementAttempt {
        SettlementAttempt {
            id: Uuid::new_v4(),
            order_id: self.order_id,
            fulfillment_id: self.fulfillment_id,
            currency: self.currency,
            targets: self.targets,
            retailer_charge: self.retailer_charge,
            supplier_payout: self.supplier_payout,
            includes_shipping: self.includes_shipping,
            charge_id: None,
            transfer_id: None,
            state: SettlementState::Open,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    NothingToSettle { status: PaymentStatus },
    Settled {
        charged: i64,
        transferred: i64,
        units: i32,
        status: PaymentStatus,
    },
}

struct PaymentAccounts {
    customer_id: String,
    payment_method_id: String,
    destination_account: String,
}

fn attempt_metadata(attempt: &SettlementAttempt) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("order_id".to_string(), attempt.order_id.to_string());
    metadata.insert("settlement_id".to_string(), attempt.id.to_string());
    metadata.insert("units".to_string(), attempt.units().to_string());
    metadata
}

pub struct SettlementService {
    directory: Arc<dyn PartnerDirectory>,
    payments: Arc<dyn PaymentProcessor>,
    ledger: Arc<dyn LedgerRepository>,
}

impl SettlementService {
    pub fn new(
        directory: Arc<dyn PartnerDirectory>,
        payments: Arc<dyn PaymentProcessor>,
        ledger: Arc<dyn LedgerRepository>,
    ) -> Self {
        Self {
            directory,
            payments,
            ledger,
        }
    }

    /// Charge the retailer and pay the supplier for the units a delivered
    /// supplier shipment counted and nobody has paid for yet, then advance
    /// `quantity_paid`. The attempt is persisted before money moves; an open
    /// attempt left by an earlier run is finished first, with its stored
    /// amounts and keys.
    pub async fn settle(
        &self,
        order_id: Uuid,
        supplier_fulfillment_id: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let order = self
            .ledger
            .get_order(order_id)
            .await?
            .ok_or(SettlementError::OrderNotFound(order_id))?;

        let Some(fulfillment) = self.ledger.find_fulfillment(supplier_fulfillment_id).await? else {
            // Cancelled since the delivery was reported.
            return Ok(SettlementOutcome::NothingToSettle {
                status: order.payment_status,
            });
        };

        if let Some(open) = self.ledger.open_settlement(order_id).await? {
            info!(order_id = %order.id, settlement_id = %open.id, "Resuming open settlement");
            let resumed_own = open.fulfillment_id == fulfillment.id;
            let outcome = self.execute(&order, open, None).await?;
            if resumed_own {
                return Ok(outcome);
            }
        }

        // Phase 1: read under lock and mark the Order as mid-settlement.
        let counted: Vec<FulfilledLine> = fulfillment.lines.clone();
        let already_settled = fulfillment.settled_at.is_some();
        let snapshot = self
            .ledger
            .update_line_items(order_id, &move |lines: &mut [OrderLineItem]| {
                let owed = !already_settled
                    && counted
                        .iter()
                        .any(|c| lines.iter().any(|l| l.id == c.line_id && l.unpaid_fulfilled() > 0));
                Ok(owed.then_some(PaymentStatus::Initiated))
            })
            .await?;

        let plan = SettlementPlan::for_fulfillment(&order, &fulfillment, &snapshot.lines);
        if already_settled || plan.is_empty() {
            return Ok(SettlementOutcome::NothingToSettle {
                status: snapshot.payment_status,
            });
        }

        let result = self.start(&order, plan).await;
        if result.is_err() {
            // Put back the status the lines actually support.
            let restored = PaymentStatus::derive(&snapshot.lines);
            if let Err(restore_err) = self.ledger.set_payment_status(order.id, restored).await {
                warn!(order_id = %order.id, error = %restore_err, "Failed to restore payment status");
            }
        }
        result
    }

    async fn start(&self, order: &Order, plan: SettlementPlan) -> Result<SettlementOutcome, SettlementError> {
        // Nothing is persisted until both parties can actually be paid.
        let accounts = self.accounts(order).await?;

        let attempt = plan.into_attempt(Utc::now());
        if !self.ledger.begin_settlement(&attempt).await? {
            return Err(SettlementError::InProgress(order.id));
        }
        self.execute(order, attempt, Some(accounts)).await
    }

    async fn accounts(&self, order: &Order) -> Result<PaymentAccounts, SettlementError> {
        let payment_err = |source| SettlementError::Payment {
            order_id: order.id,
            source,
        };

        let retailer = self.directory.payment_profile(order.retailer_id).await?.unwrap_or_default();
        let supplier = self.directory.payment_profile(order.supplier_id).await?.unwrap_or_default();

        let (Some(customer_id), Some(payment_method_id)) = (retailer.customer_id, retailer.default_payment_method_id)
        else {
            return Err(payment_err(PaymentError::Misconfigured(format!(
                "retailer {} has no saved payment method",
                order.retailer_id
            ))));
        };

        let destination_account = match supplier.connected_account_id {
            Some(account) if supplier.payouts_enabled => account,
            _ => {
                return Err(payment_err(PaymentError::Misconfigured(format!(
                    "supplier {} cannot receive payouts",
                    order.supplier_id
                ))))
            }
        };

        Ok(PaymentAccounts {
            customer_id,
            payment_method_id,
            destination_account,
        })
    }

    /// Charge first, then transfer, recording each receipt on the attempt as
    /// it comes back. Only a refused charge closes the attempt; any other
    /// failure leaves it open for the next run to resume.
    async fn execute(
        &self,
        order: &Order,
        mut attempt: SettlementAttempt,
        accounts: Option<PaymentAccounts>,
    ) -> Result<SettlementOutcome, SettlementError> {
        let accounts = match accounts {
            Some(accounts) => accounts,
            None => self.accounts(order).await?,
        };
        let transfer_group = Some(format!("order_{}", order.id));

        if attempt.charge_id.is_none() && attempt.retailer_charge > 0 {
            let charge = ChargeRequest {
                customer_id: accounts.customer_id,
                payment_method_id: accounts.payment_method_id,
                amount: attempt.retailer_charge,
                currency: attempt.currency.clone(),
                description: format!("Dropship order {}", order.supplier_order_id),
                transfer_group: transfer_group.clone(),
                idempotency_key: attempt.idempotency_key("charge"),
                metadata: attempt_metadata(&attempt),
            };
            match self.payments.charge_saved_payment_method(&charge).await {
                Ok(receipt) => {
                    self.ledger.record_settlement_charge(attempt.id, &receipt.id).await?;
                    attempt.charge_id = Some(receipt.id);
                }
                Err(e) => {
                    error!(
                        order_id = %order.id,
                        settlement_id = %attempt.id,
                        amount = attempt.retailer_charge,
                        error = %e,
                        "Retailer charge failed, paid quantities unchanged"
                    );
                    if e.is_refusal() {
                        self.ledger.abandon_settlement(attempt.id).await?;
                    }
                    return Err(SettlementError::Payment {
                        order_id: order.id,
                        source: e,
                    });
                }
            }
        }

        if attempt.transfer_id.is_none() && attempt.supplier_payout > 0 {
            let transfer = TransferRequest {
                destination_account: accounts.destination_account,
                amount: attempt.supplier_payout,
                currency: attempt.currency.clone(),
                transfer_group,
                idempotency_key: attempt.idempotency_key("transfer"),
                metadata: attempt_metadata(&attempt),
            };
            match self.payments.transfer_to_connected_account(&transfer).await {
                Ok(receipt) => {
                    self.ledger.record_settlement_transfer(attempt.id, &receipt.id).await?;
                    attempt.transfer_id = Some(receipt.id);
                }
                Err(e) => {
                    error!(
                        order_id = %order.id,
                        settlement_id = %attempt.id,
                        charge_id = ?attempt.charge_id,
                        amount = attempt.supplier_payout,
                        error = %e,
                        "Supplier transfer failed after charge, settlement left open"
                    );
                    return Err(SettlementError::Payment {
                        order_id: order.id,
                        source: e,
                    });
                }
            }
        }

        // Phase 2: advance paid counts only where nobody else did.
        let targets = attempt.targets.clone();
        let update = self
            .ledger
            .complete_settlement(attempt.id, &move |lines: &mut [OrderLineItem]| {
                quantities::advance_paid(lines, &targets)?;
                Ok(Some(PaymentStatus::derive(lines)))
            })
            .await?;

        info!(
            order_id = %order.id,
            settlement_id = %attempt.id,
            units = attempt.units(),
            charged = attempt.retailer_charge,
            transferred = attempt.supplier_payout,
            shipping = attempt.includes_shipping,
            status = %update.payment_status,
            "Order settled"
        );

        Ok(SettlementOutcome::Settled {
            charged: attempt.retailer_charge,
            transferred: attempt.supplier_payout,
            units: attempt.units(),
            status: update.payment_status,
        })
    }
}
