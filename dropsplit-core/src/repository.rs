use async_trait::async_trait;
use uuid::Uuid;

use crate::ledger::{
    Fulfillment, LineMutation, NewOrder, Order, OrderLineItem, PaymentStatus, QuantityError, SettlementAttempt,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quantity rule rejected update: {0}")]
    Quantity(#[from] QuantityError),
}

impl LedgerError {
    /// Connection and serialization failures clear on retry; rule violations do not.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Database(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(Order),
    /// Another delivery already persisted this (fulfillment order, supplier) pair.
    AlreadyExists(Order),
}

impl InsertOutcome {
    pub fn order(&self) -> &Order {
        match self {
            InsertOutcome::Created(order) | InsertOutcome::AlreadyExists(order) => order,
        }
    }
}

/// Lines and status as committed by a locked update, with the lines as they
/// were read under the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LineUpdate {
    pub previous: Vec<OrderLineItem>,
    pub lines: Vec<OrderLineItem>,
    pub payment_status: PaymentStatus,
}

impl LineUpdate {
    /// Per-line change in `quantity_fulfilled`, skipping unchanged lines.
    pub fn fulfilled_deltas(&self) -> Vec<(&OrderLineItem, i32)> {
        self.lines
            .iter()
            .zip(self.previous.iter())
            .map(|(after, before)| (after, after.quantity_fulfilled - before.quantity_fulfilled))
            .filter(|(_, delta)| *delta != 0)
            .collect()
    }

    pub fn cancelled_units(&self) -> i32 {
        let after: i32 = self.lines.iter().map(|l| l.quantity_cancelled).sum();
        let before: i32 = self.previous.iter().map(|l| l.quantity_cancelled).sum();
        after - before
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FulfillmentRecord {
    /// First sighting of this supplier fulfillment; quantities were applied.
    Created { fulfillment: Fulfillment, update: LineUpdate },
    /// Seen before; nothing was changed.
    Existing(Fulfillment),
}

/// Data access for the cross-party ledger.
///
/// Every quantity change runs through a [`LineMutation`] executed while the
/// Order's line rows are locked, so concurrent deliveries serialize per Order.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn find_order_for_supplier(
        &self,
        retailer_fulfillment_order_id: &str,
        supplier_id: Uuid,
    ) -> Result<Option<Order>, LedgerError>;

    /// Insert an Order with its lines in one transaction, keyed by
    /// `(retailer_fulfillment_order_id, supplier_id)`.
    async fn insert_order(&self, order: NewOrder) -> Result<InsertOutcome, LedgerError>;

    async fn find_order_by_supplier_order(
        &self,
        supplier_id: Uuid,
        supplier_order_id: &str,
    ) -> Result<Option<Order>, LedgerError>;

    async fn orders_for_fulfillment_order(
        &self,
        retailer_id: Uuid,
        retailer_fulfillment_order_id: &str,
    ) -> Result<Vec<Order>, LedgerError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, LedgerError>;

    async fn line_items(&self, order_id: Uuid) -> Result<Vec<OrderLineItem>, LedgerError>;

    /// Lock the Order's lines, apply `mutation`, check invariants and commit.
    async fn update_line_items(
        &self,
        order_id: Uuid,
        mutation: &LineMutation<'_>,
    ) -> Result<LineUpdate, LedgerError>;

    async fn set_payment_status(&self, order_id: Uuid, status: PaymentStatus) -> Result<(), LedgerError>;

    async fn find_fulfillment(&self, supplier_fulfillment_id: &str) -> Result<Option<Fulfillment>, LedgerError>;

    /// Insert the Fulfillment row and apply `mutation` in the same transaction,
    /// storing the per-line `quantity_fulfilled` increase the mutation made.
    /// A row that already exists short-circuits without touching the lines.
    async fn record_fulfillment(
        &self,
        order_id: Uuid,
        supplier_fulfillment_id: &str,
        mutation: &LineMutation<'_>,
    ) -> Result<FulfillmentRecord, LedgerError>;

    async fn set_retailer_fulfillment(
        &self,
        fulfillment_id: Uuid,
        retailer_fulfillment_id: &str,
    ) -> Result<(), LedgerError>;

    /// Delete the Fulfillment row and apply `mutation` in the same transaction.
    /// Returns `None` when there was no row (already removed or never recorded).
    async fn remove_fulfillment(
        &self,
        supplier_fulfillment_id: &str,
        mutation: &LineMutation<'_>,
    ) -> Result<Option<(Fulfillment, LineUpdate)>, LedgerError>;

    /// The Order's open settlement attempt, if a previous run left one behind.
    async fn open_settlement(&self, order_id: Uuid) -> Result<Option<SettlementAttempt>, LedgerError>;

    /// Persist a new open attempt. Returns `false` when the Order already has one.
    async fn begin_settlement(&self, attempt: &SettlementAttempt) -> Result<bool, LedgerError>;

    async fn record_settlement_charge(&self, attempt_id: Uuid, charge_id: &str) -> Result<(), LedgerError>;

    async fn record_settlement_transfer(&self, attempt_id: Uuid, transfer_id: &str) -> Result<(), LedgerError>;

    /// Apply `mutation` to the attempt's Order, close the attempt and mark its
    /// Fulfillment settled, all in one transaction.
    async fn complete_settlement(
        &self,
        attempt_id: Uuid,
        mutation: &LineMutation<'_>,
    ) -> Result<LineUpdate, LedgerError>;

    /// Close an attempt whose charge was refused.
    async fn abandon_settlement(&self, attempt_id: Uuid) -> Result<(), LedgerError>;

    /// Returns `true` if this call recorded the event, `false` if it was already present.
    async fn record_processed_webhook(&self, event_id: &str, event_type: &str) -> Result<bool, LedgerError>;

    async fn is_webhook_processed(&self, event_id: &str) -> Result<bool, LedgerError>;
}
