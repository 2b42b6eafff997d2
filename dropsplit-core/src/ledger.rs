use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Settlement progress of one supplier sub-order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Initiated,
    Incomplete,
    PartiallyPaid,
    Paid,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "INITIATED",
            PaymentStatus::Incomplete => "INCOMPLETE",
            PaymentStatus::PartiallyPaid => "PARTIALLY_PAID",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Status implied by the line quantities.
    ///
    /// Cancelled units are not payable, so a line is settled once
    /// `quantity_paid == quantity - quantity_cancelled`.
    pub fn derive(lines: &[OrderLineItem]) -> PaymentStatus {
        let paid: i32 = lines.iter().map(|l| l.quantity_paid).sum();
        if paid == 0 {
            return PaymentStatus::Incomplete;
        }

        if lines.iter().all(|l| l.quantity_paid == l.payable_quantity()) {
            PaymentStatus::Paid
        } else {
            PaymentStatus::PartiallyPaid
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(PaymentStatus::Initiated),
            "INCOMPLETE" => Ok(PaymentStatus::Incomplete),
            "PARTIALLY_PAID" => Ok(PaymentStatus::PartiallyPaid),
            "PAID" => Ok(PaymentStatus::Paid),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            other => Err(QuantityError::UnknownStatus(other.to_string())),
        }
    }
}

/// One supplier's share of a retailer fulfillment order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub currency: String,
    pub retailer_fulfillment_order_id: String,
    pub retailer_order_id: String,
    pub supplier_order_id: String,
    pub retailer_id: Uuid,
    pub supplier_id: Uuid,
    pub shipping_cost: i64,
    pub shipping_service_code: String,
    pub payment_status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One supplier variant within an [`Order`]. Prices are per unit, in minor units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderLineItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub retailer_variant_id: String,
    pub supplier_variant_id: String,
    /// Retailer fulfillment-order line id; used to mirror shipments back.
    pub retailer_line_item_id: String,
    pub supplier_line_item_id: String,
    pub retail_price_per_unit: i64,
    pub retailer_profit_per_unit: i64,
    pub supplier_profit_per_unit: i64,
    pub quantity: i32,
    pub quantity_fulfilled: i32,
    pub quantity_paid: i32,
    pub quantity_cancelled: i32,
    pub price_list_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderLineItem {
    /// Units neither shipped nor cancelled.
    pub fn remaining(&self) -> i32 {
        self.quantity - self.quantity_fulfilled - self.quantity_cancelled
    }

    /// Units that can ever be paid for.
    pub fn payable_quantity(&self) -> i32 {
        self.quantity - self.quantity_cancelled
    }

    /// Shipped units not yet settled.
    pub fn unpaid_fulfilled(&self) -> i32 {
        self.quantity_fulfilled - self.quantity_paid
    }

    /// What the retailer owes per unit.
    pub fn retailer_cost_per_unit(&self) -> i64 {
        self.retail_price_per_unit - self.retailer_profit_per_unit
    }

    pub fn check_invariants(&self) -> Result<(), QuantityError> {
        let counts_valid = self.quantity >= 0
            && self.quantity_fulfilled >= 0
            && self.quantity_paid >= 0
            && self.quantity_cancelled >= 0;

        if !counts_valid
            || self.quantity_fulfilled + self.quantity_cancelled > self.quantity
            || self.quantity_paid > self.quantity_fulfilled
        {
            return Err(QuantityError::InvariantViolated {
                line_id: self.id,
                quantity: self.quantity,
                fulfilled: self.quantity_fulfilled,
                paid: self.quantity_paid,
                cancelled: self.quantity_cancelled,
            });
        }
        Ok(())
    }
}

/// Links a supplier shipment to the retailer-side fulfillment mirroring it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fulfillment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub supplier_fulfillment_id: String,
    /// Unset until the mirror call on the retailer store succeeds.
    pub retailer_fulfillment_id: Option<String>,
    /// Units this shipment added to `quantity_fulfilled`, per line, after capping.
    pub lines: Vec<FulfilledLine>,
    /// Set once the units of this shipment have been charged and paid out.
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Fulfillment {
    pub fn units(&self) -> i32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FulfilledLine {
    pub line_id: Uuid,
    pub quantity: i32,
}

/// Settlement target for one line: advance `quantity_paid` from `paid_from`
/// to `paid_to`, but only if nobody else moved it in between.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaidTarget {
    pub line_id: Uuid,
    pub paid_from: i32,
    pub paid_to: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Open,
    Completed,
    /// The processor refused the charge; no money moved.
    Abandoned,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Open => "OPEN",
            SettlementState::Completed => "COMPLETED",
            SettlementState::Abandoned => "ABANDONED",
        }
    }
}

impl FromStr for SettlementState {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(SettlementState::Open),
            "COMPLETED" => Ok(SettlementState::Completed),
            "ABANDONED" => Ok(SettlementState::Abandoned),
            other => Err(QuantityError::UnknownStatus(other.to_string())),
        }
    }
}

/// One charge-then-transfer run for a delivered shipment, persisted before
/// any money moves. A redrive resumes the open attempt with its stored amounts
/// and idempotency keys instead of planning again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementAttempt {
    pub id: Uuid,
    pub order_id: Uuid,
    /// The [`Fulfillment`] whose delivery this attempt pays for.
    pub fulfillment_id: Uuid,
    pub currency: String,
    pub targets: Vec<PaidTarget>,
    pub retailer_charge: i64,
    pub supplier_payout: i64,
    pub includes_shipping: bool,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub state: SettlementState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementAttempt {
    pub fn units(&self) -> i32 {
        self.targets.iter().map(|t| t.paid_to - t.paid_from).sum()
    }

    /// Stable for the life of the attempt, so a replayed call returns the
    /// processor's first result.
    pub fn idempotency_key(&self, operation: &str) -> String {
        format!("settlement-{}-{}", self.id, operation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedWebhook {
    pub event_id: String,
    pub event_type: String,
    pub received_at: DateTime<Utc>,
}

/// Input for persisting one supplier group.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub currency: String,
    pub retailer_fulfillment_order_id: String,
    pub retailer_order_id: String,
    pub supplier_order_id: String,
    pub retailer_id: Uuid,
    pub supplier_id: Uuid,
    pub shipping_cost: i64,
    pub shipping_service_code: String,
    pub line_items: Vec<NewLineItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLineItem {
    pub retailer_variant_id: String,
    pub supplier_variant_id: String,
    pub retailer_line_item_id: String,
    pub supplier_line_item_id: String,
    pub retail_price_per_unit: i64,
    pub retailer_profit_per_unit: i64,
    pub supplier_profit_per_unit: i64,
    pub quantity: i32,
    pub price_list_id: Option<Uuid>,
}

impl NewOrder {
    /// Assign ids and timestamps. New orders start `INCOMPLETE` with zeroed counters.
    pub fn into_records(self, now: DateTime<Utc>) -> (Order, Vec<OrderLineItem>) {
        let order = Order {
            id: Uuid::new_v4(),
            currency: self.currency,
            retailer_fulfillment_order_id: self.retailer_fulfillment_order_id,
            retailer_order_id: self.retailer_order_id,
            supplier_order_id: self.supplier_order_id,
            retailer_id: self.retailer_id,
            supplier_id: self.supplier_id,
            shipping_cost: self.shipping_cost,
            shipping_service_code: self.shipping_service_code,
            payment_status: PaymentStatus::Incomplete,
            created_at: now,
            updated_at: now,
        };

        let lines = self
            .line_items
            .into_iter()
            .map(|item| OrderLineItem {
                id: Uuid::new_v4(),
                order_id: order.id,
                retailer_variant_id: item.retailer_variant_id,
                supplier_variant_id: item.supplier_variant_id,
                retailer_line_item_id: item.retailer_line_item_id,
                supplier_line_item_id: item.supplier_line_item_id,
                retail_price_per_unit: item.retail_price_per_unit,
                retailer_profit_per_unit: item.retailer_profit_per_unit,
                supplier_profit_per_unit: item.supplier_profit_per_unit,
                quantity: item.quantity,
                quantity_fulfilled: 0,
                quantity_paid: 0,
                quantity_cancelled: 0,
                price_list_id: item.price_list_id,
                created_at: now,
                updated_at: now,
            })
            .collect();

        (order, lines)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error(
        "Line {line_id} violates quantity invariants (quantity={quantity}, fulfilled={fulfilled}, paid={paid}, cancelled={cancelled})"
    )]
    InvariantViolated {
        line_id: Uuid,
        quantity: i32,
        fulfilled: i32,
        paid: i32,
        cancelled: i32,
    },

    #[error("Unknown line item: {0}")]
    UnknownLine(String),

    #[error("Unknown payment status: {0}")]
    UnknownStatus(String),
}

/// A read-modify-write step over an Order's lines, run with the lines locked.
/// Returning a status writes it to the Order in the same transaction.
pub type LineMutation<'a> =
    dyn Fn(&mut [OrderLineItem]) -> Result<Option<PaymentStatus>, QuantityError> + Send + Sync + 'a;

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn line(quantity: i32, fulfilled: i32, paid: i32, cancelled: i32) -> OrderLineItem {
        let now = Utc::now();
        OrderLineItem {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            retailer_variant_id: "rv".into(),
            supplier_variant_id: "sv".into(),
            retailer_line_item_id: "rl".into(),
            supplier_line_item_id: "sl".into(),
            retail_price_per_unit: 2000,
            retailer_profit_per_unit: 500,
            supplier_profit_per_unit: 1200,
            quantity,
            quantity_fulfilled: fulfilled,
            quantity_paid: paid,
            quantity_cancelled: cancelled,
            price_list_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_invariants() {
        assert!(line(3, 2, 1, 1).check_invariants().is_ok());
        assert!(line(3, 3, 0, 1).check_invariants().is_err());
        assert!(line(3, 1, 2, 0).check_invariants().is_err());
        assert!(line(3, -1, 0, 0).check_invariants().is_err());
    }

    #[test]
    fn test_derive_payment_status() {
        assert_eq!(PaymentStatus::derive(&[line(2, 2, 0, 0)]), PaymentStatus::Incomplete);
        assert_eq!(PaymentStatus::derive(&[line(2, 2, 1, 0)]), PaymentStatus::PartiallyPaid);
        assert_eq!(PaymentStatus::derive(&[line(2, 2, 2, 0), line(1, 0, 0, 1)]), PaymentStatus::Paid);
        assert_eq!(PaymentStatus::derive(&[line(2, 2, 2, 0), line(1, 1, 0, 0)]), PaymentStatus::PartiallyPaid);
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            PaymentStatus::Initiated,
            PaymentStatus::Incomplete,
            PaymentStatus::PartiallyPaid,
            PaymentStatus::Paid,
            PaymentStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<PaymentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_attempt_keys_differ_per_operation() {
        let now = Utc::now();
        let attempt = SettlementAttempt {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            fulfillment_id: Uuid::new_v4(),
            currency: "USD".into(),
            targets: vec![PaidTarget { line_id: Uuid::new_v4(), paid_from: 1, paid_to: 3 }],
            retailer_charge: 3600,
            supplier_payout: 3000,
            includes_shipping: false,
            charge_id: None,
            transfer_id: None,
            state: SettlementState::Open,
            created_at: now,
            updated_at: now,
        };

        assert_eq!(attempt.units(), 2);
        assert_ne!(attempt.idempotency_key("charge"), attempt.idempotency_key("transfer"));
        assert_eq!(attempt.idempotency_key("charge"), attempt.clone().idempotency_key("charge"));
    }

    #[test]
    fn test_retailer_cost() {
        assert_eq!(line(1, 0, 0, 0).retailer_cost_per_unit(), 1500);
    }
}
