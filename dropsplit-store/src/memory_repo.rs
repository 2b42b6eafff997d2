//! Process-local ledger and directory. Same semantics as the Postgres
//! repositories, with a mutex standing in for row locks. Used by tests across
//! the workspace and by local runs without a database.

use async_trait::async_trait;
use chrono::Utc;
use dropsplit_core::directory::{DirectoryError, ImportedVariant, PartnerDirectory, PaymentProfile, StoreAccount};
use dropsplit_core::ledger::{
    FulfilledLine, Fulfillment, LineMutation, NewOrder, Order, OrderLineItem, PaymentStatus, ProcessedWebhook,
    SettlementAttempt, SettlementState,
};
use dropsplit_core::repository::{FulfillmentRecord, InsertOutcome, LedgerError, LedgerRepository, LineUpdate};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    orders: HashMap<Uuid, Order>,
    lines: HashMap<Uuid, Vec<OrderLineItem>>,
    fulfillments: HashMap<String, Fulfillment>,
    settlements: HashMap<Uuid, SettlementAttempt>,
    webhooks: HashMap<String, ProcessedWebhook>,
}

impl LedgerState {
    fn apply(&mut self, order_id: Uuid, mutation: &LineMutation<'_>) -> Result<LineUpdate, LedgerError> {
        let current_status = self
            .orders
            .get(&order_id)
            .map(|o| o.payment_status)
            .ok_or_else(|| LedgerError::NotFound(format!("order {}", order_id)))?;

        let previous = self.lines.get(&order_id).cloned().unwrap_or_default();
        let mut lines = previous.clone();
        let requested_status = mutation(lines.as_mut_slice())?;
        for line in &lines {
            line.check_invariants()?;
        }

        let now = Utc::now();
        let payment_status = requested_status.unwrap_or(current_status);
        if let Some(order) = self.orders.get_mut(&order_id) {
            if order.payment_status != payment_status {
                order.payment_status = payment_status;
                order.updated_at = now;
            }
        }
        self.lines.insert(order_id, lines.clone());

        Ok(LineUpdate {
            previous,
            lines,
            payment_status,
        })
    }

    fn settlement_mut(&mut self, attempt_id: Uuid) -> Result<&mut SettlementAttempt, LedgerError> {
        self.settlements
            .get_mut(&attempt_id)
            .ok_or_else(|| LedgerError::NotFound(format!("settlement attempt {}", attempt_id)))
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Database("in-memory ledger lock poisoned".to_string()))
    }

    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .state
            .lock()
            .map(|s| s.orders.values().cloned().collect())
            .unwrap_or_default();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    pub fn fulfillments(&self) -> Vec<Fulfillment> {
        self.state
            .lock()
            .map(|s| s.fulfillments.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn settlements(&self) -> Vec<SettlementAttempt> {
        let mut attempts: Vec<SettlementAttempt> = self
            .state
            .lock()
            .map(|s| s.settlements.values().cloned().collect())
            .unwrap_or_default();
        attempts.sort_by_key(|a| a.created_at);
        attempts
    }

    pub fn processed_webhooks(&self) -> Vec<ProcessedWebhook> {
        self.state
            .lock()
            .map(|s| s.webhooks.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedger {
    async fn find_order_for_supplier(
        &self,
        retailer_fulfillment_order_id: &str,
        supplier_id: Uuid,
    ) -> Result<Option<Order>, LedgerError> {
        let state = self.state()?;
        Ok(state
            .orders
            .values()
            .find(|o| o.retailer_fulfillment_order_id == retailer_fulfillment_order_id && o.supplier_id == supplier_id)
            .cloned())
    }

    async fn insert_order(&self, order: NewOrder) -> Result<InsertOutcome, LedgerError> {
        let mut state = self.state()?;
        let existing = state
            .orders
            .values()
            .find(|o| {
                o.retailer_fulfillment_order_id == order.retailer_fulfillment_order_id
                    && o.supplier_id == order.supplier_id
            })
            .cloned();
        if let Some(existing) = existing {
            return Ok(InsertOutcome::AlreadyExists(existing));
        }

        let (order, lines) = order.into_records(Utc::now());
        state.lines.insert(order.id, lines);
        state.orders.insert(order.id, order.clone());
        Ok(InsertOutcome::Created(order))
    }

    async fn find_order_by_supplier_order(
        &self,
        supplier_id: Uuid,
        supplier_order_id: &str,
    ) -> Result<Option<Order>, LedgerError> {
        let state = self.state()?;
        Ok(state
            .orders
            .values()
            .find(|o| o.supplier_id == supplier_id && o.supplier_order_id == supplier_order_id)
            .cloned())
    }

    async fn orders_for_fulfillment_order(
        &self,
        retailer_id: Uuid,
        retailer_fulfillment_order_id: &str,
    ) -> Result<Vec<Order>, LedgerError> {
        let state = self.state()?;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.retailer_id == retailer_id && o.retailer_fulfillment_order_id == retailer_fulfillment_order_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, LedgerError> {
        Ok(self.state()?.orders.get(&order_id).cloned())
    }

    async fn line_items(&self, order_id: Uuid) -> Result<Vec<OrderLineItem>, LedgerError> {
        Ok(self.state()?.lines.get(&order_id).cloned().unwrap_or_default())
    }

    async fn update_line_items(
        &self,
        order_id: Uuid,
        mutation: &LineMutation<'_>,
    ) -> Result<LineUpdate, LedgerError> {
        self.state()?.apply(order_id, mutation)
    }

    async fn set_payment_status(&self, order_id: Uuid, status: PaymentStatus) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| LedgerError::NotFound(format!("order {}", order_id)))?;
        order.payment_status = status;
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn find_fulfillment(&self, supplier_fulfillment_id: &str) -> Result<Option<Fulfillment>, LedgerError> {
        Ok(self.state()?.fulfillments.get(supplier_fulfillment_id).cloned())
    }

    async fn record_fulfillment(
        &self,
        order_id: Uuid,
        supplier_fulfillment_id: &str,
        mutation: &LineMutation<'_>,
    ) -> Result<FulfillmentRecord, LedgerError> {
        let mut state = self.state()?;
        if let Some(existing) = state.fulfillments.get(supplier_fulfillment_id) {
            return Ok(FulfillmentRecord::Existing(existing.clone()));
        }

        // Apply first so a rejected mutation leaves no row behind.
        let update = state.apply(order_id, mutation)?;
        let lines = update
            .fulfilled_deltas()
            .into_iter()
            .filter(|(_, delta)| *delta > 0)
            .map(|(line, delta)| FulfilledLine {
                line_id: line.id,
                quantity: delta,
            })
            .collect();
        let fulfillment = Fulfillment {
            id: Uuid::new_v4(),
            order_id,
            supplier_fulfillment_id: supplier_fulfillment_id.to_string(),
            retailer_fulfillment_id: None,
            lines,
            settled_at: None,
            created_at: Utc::now(),
        };
        state
            .fulfillments
            .insert(supplier_fulfillment_id.to_string(), fulfillment.clone());

        Ok(FulfillmentRecord::Created { fulfillment, update })
    }

    async fn set_retailer_fulfillment(
        &self,
        fulfillment_id: Uuid,
        retailer_fulfillment_id: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        if let Some(f) = state.fulfillments.values_mut().find(|f| f.id == fulfillment_id) {
            f.retailer_fulfillment_id = Some(retailer_fulfillment_id.to_string());
        }
        Ok(())
    }

    async fn remove_fulfillment(
        &self,
        supplier_fulfillment_id: &str,
        mutation: &LineMutation<'_>,
    ) -> Result<Option<(Fulfillment, LineUpdate)>, LedgerError> {
        let mut state = self.state()?;
        let Some(fulfillment) = state.fulfillments.get(supplier_fulfillment_id).cloned() else {
            return Ok(None);
        };

        let update = state.apply(fulfillment.order_id, mutation)?;
        state.fulfillments.remove(supplier_fulfillment_id);
        Ok(Some((fulfillment, update)))
    }

    async fn open_settlement(&self, order_id: Uuid) -> Result<Option<SettlementAttempt>, LedgerError> {
        let state = self.state()?;
        Ok(state
            .settlements
            .values()
            .find(|a| a.order_id == order_id && a.state == SettlementState::Open)
            .cloned())
    }

    async fn begin_settlement(&self, attempt: &SettlementAttempt) -> Result<bool, LedgerError> {
        let mut state = self.state()?;
        let busy = state
            .settlements
            .values()
            .any(|a| a.order_id == attempt.order_id && a.state == SettlementState::Open);
        if busy {
            return Ok(false);
        }
        state.settlements.insert(attempt.id, attempt.clone());
        Ok(true)
    }

    async fn record_settlement_charge(&self, attempt_id: Uuid, charge_id: &str) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let attempt = state.settlement_mut(attempt_id)?;
        attempt.charge_id = Some(charge_id.to_string());
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn record_settlement_transfer(&self, attempt_id: Uuid, transfer_id: &str) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let attempt = state.settlement_mut(attempt_id)?;
        attempt.transfer_id = Some(transfer_id.to_string());
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_settlement(
        &self,
        attempt_id: Uuid,
        mutation: &LineMutation<'_>,
    ) -> Result<LineUpdate, LedgerError> {
        let mut state = self.state()?;
        let (order_id, fulfillment_id) = {
            let attempt = state.settlement_mut(attempt_id)?;
            if attempt.state != SettlementState::Open {
                return Err(LedgerError::NotFound(format!("open settlement attempt {}", attempt_id)));
            }
            (attempt.order_id, attempt.fulfillment_id)
        };

        let update = state.apply(order_id, mutation)?;
        let now = Utc::now();
        let attempt = state.settlement_mut(attempt_id)?;
        attempt.state = SettlementState::Completed;
        attempt.updated_at = now;
        if let Some(f) = state.fulfillments.values_mut().find(|f| f.id == fulfillment_id) {
            f.settled_at = Some(now);
        }
        Ok(update)
    }

    async fn abandon_settlement(&self, attempt_id: Uuid) -> Result<(), LedgerError> {
        let mut state = self.state()?;
        let attempt = state.settlement_mut(attempt_id)?;
        if attempt.state == SettlementState::Open {
            attempt.state = SettlementState::Abandoned;
            attempt.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_processed_webhook(&self, event_id: &str, event_type: &str) -> Result<bool, LedgerError> {
        let mut state = self.state()?;
        if state.webhooks.contains_key(event_id) {
            return Ok(false);
        }
        state.webhooks.insert(
            event_id.to_string(),
            ProcessedWebhook {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                received_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn is_webhook_processed(&self, event_id: &str) -> Result<bool, LedgerError> {
        Ok(self.state()?.webhooks.contains_key(event_id))
    }
}

// ============================================================================
// Partner directory
// ============================================================================

#[derive(Default)]
struct DirectoryState {
    stores: Vec<StoreAccount>,
    variants: HashMap<(Uuid, String), ImportedVariant>,
    profiles: HashMap<Uuid, PaymentProfile>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, DirectoryState>, DirectoryError> {
        self.state
            .lock()
            .map_err(|_| DirectoryError::Database("in-memory directory lock poisoned".to_string()))
    }

    pub fn add_store(&self, store: StoreAccount) {
        if let Ok(mut state) = self.state.lock() {
            state.stores.retain(|s| s.id != store.id);
            state.stores.push(store);
        }
    }

    pub fn add_imported_variant(&self, retailer_id: Uuid, variant: ImportedVariant) {
        if let Ok(mut state) = self.state.lock() {
            state
                .variants
                .insert((retailer_id, variant.retailer_variant_id.clone()), variant);
        }
    }

    pub fn set_payment_profile(&self, store_id: Uuid, profile: PaymentProfile) {
        if let Ok(mut state) = self.state.lock() {
            state.profiles.insert(store_id, profile);
        }
    }
}

#[async_trait]
impl PartnerDirectory for InMemoryDirectory {
    async fn store_by_domain(&self, shop_domain: &str) -> Result<Option<StoreAccount>, DirectoryError> {
        Ok(self.state()?.stores.iter().find(|s| s.shop_domain == shop_domain).cloned())
    }

    async fn store_by_id(&self, store_id: Uuid) -> Result<Option<StoreAccount>, DirectoryError> {
        Ok(self.state()?.stores.iter().find(|s| s.id == store_id).cloned())
    }

    async fn has_imported_variants(&self, retailer_id: Uuid, variant_ids: &[String]) -> Result<bool, DirectoryError> {
        let state = self.state()?;
        Ok(variant_ids
            .iter()
            .any(|id| state.variants.contains_key(&(retailer_id, id.clone()))))
    }

    async fn imported_variants(
        &self,
        retailer_id: Uuid,
        variant_ids: &[String],
    ) -> Result<Vec<ImportedVariant>, DirectoryError> {
        let state = self.state()?;
        Ok(variant_ids
            .iter()
            .filter_map(|id| state.variants.get(&(retailer_id, id.clone())).cloned())
            .collect())
    }

    async fn payment_profile(&self, store_id: Uuid) -> Result<Option<PaymentProfile>, DirectoryError> {
        Ok(self.state()?.profiles.get(&store_id).cloned())
    }

    async fn update_account_capabilities(
        &self,
        connected_account_id: &str,
        payouts_enabled: bool,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.state()?;
        let profile = state
            .profiles
            .values_mut()
            .find(|p| p.connected_account_id.as_deref() == Some(connected_account_id));
        Ok(match profile {
            Some(p) => {
                p.payouts_enabled = payouts_enabled;
                true
            }
            None => false,
        })
    }

    async fn disconnect_account(&self, connected_account_id: &str) -> Result<bool, DirectoryError> {
        let mut state = self.state()?;
        let profile = state
            .profiles
            .values_mut()
            .find(|p| p.connected_account_id.as_deref() == Some(connected_account_id));
        Ok(match profile {
            Some(p) => {
                p.connected_account_id = None;
                p.payouts_enabled = false;
                true
            }
            None => false,
        })
    }

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<bool, DirectoryError> {
        let mut state = self.state()?;
        let profile = state
            .profiles
            .values_mut()
            .find(|p| p.customer_id.as_deref() == Some(customer_id));
        Ok(match profile {
            Some(p) => {
                p.default_payment_method_id = Some(payment_method_id.to_string());
                true
            }
            None => false,
        })
    }

    async fn detach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<bool, DirectoryError> {
        let mut state = self.state()?;
        let profile = state.profiles.values_mut().find(|p| {
            p.customer_id.as_deref() == Some(customer_id)
                && p.default_payment_method_id.as_deref() == Some(payment_method_id)
        });
        Ok(match profile {
            Some(p) => {
                p.default_payment_method_id = None;
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropsplit_core::ledger::NewLineItem;

    fn new_order(fo: &str, supplier_id: Uuid, quantity: i32) -> NewOrder {
        NewOrder {
            currency: "USD".into(),
            retailer_fulfillment_order_id: fo.into(),
            retailer_order_id: "ro-1".into(),
            supplier_order_id: "so-1".into(),
            retailer_id: Uuid::new_v4(),
            supplier_id,
            shipping_cost: 500,
            shipping_service_code: "standard".into(),
            line_items: vec![NewLineItem {
                retailer_variant_id: "rv-1".into(),
                supplier_variant_id: "sv-1".into(),
                retailer_line_item_id: "rl-1".into(),
                supplier_line_item_id: "sl-1".into(),
                retail_price_per_unit: 2000,
                retailer_profit_per_unit: 600,
                supplier_profit_per_unit: 1200,
                quantity,
                price_list_id: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_insert_is_keyed_by_fulfillment_order_and_supplier() {
        let ledger = InMemoryLedger::new();
        let supplier = Uuid::new_v4();

        let first = ledger.insert_order(new_order("fo-1", supplier, 2)).await.unwrap();
        let second = ledger.insert_order(new_order("fo-1", supplier, 2)).await.unwrap();

        assert!(matches!(first, InsertOutcome::Created(_)));
        assert!(matches!(second, InsertOutcome::AlreadyExists(_)));
        assert_eq!(first.order().id, second.order().id);
        assert_eq!(ledger.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_mutation_leaves_state_untouched() {
        let ledger = InMemoryLedger::new();
        let outcome = ledger.insert_order(new_order("fo-2", Uuid::new_v4(), 1)).await.unwrap();
        let order_id = outcome.order().id;

        let result = ledger
            .record_fulfillment(order_id, "sf-1", &|lines: &mut [OrderLineItem]| {
                lines[0].quantity_fulfilled = 5;
                Ok(None)
            })
            .await;

        assert!(matches!(result, Err(LedgerError::Quantity(_))));
        assert!(ledger.find_fulfillment("sf-1").await.unwrap().is_none());
        assert_eq!(ledger.line_items(order_id).await.unwrap()[0].quantity_fulfilled, 0);
    }

    #[tokio::test]
    async fn test_fulfillment_keeps_counted_units() {
        let ledger = InMemoryLedger::new();
        let outcome = ledger.insert_order(new_order("fo-3", Uuid::new_v4(), 2)).await.unwrap();
        let order_id = outcome.order().id;

        let record = ledger
            .record_fulfillment(order_id, "sf-1", &|lines: &mut [OrderLineItem]| {
                lines[0].quantity_fulfilled += 1;
                Ok(None)
            })
            .await
            .unwrap();

        let FulfillmentRecord::Created { fulfillment, .. } = record else {
            panic!("expected a new fulfillment");
        };
        let line_id = ledger.line_items(order_id).await.unwrap()[0].id;
        assert_eq!(fulfillment.lines, vec![FulfilledLine { line_id, quantity: 1 }]);
        assert_eq!(ledger.find_fulfillment("sf-1").await.unwrap().unwrap().lines, fulfillment.lines);
    }

    #[tokio::test]
    async fn test_one_open_settlement_per_order() {
        let ledger = InMemoryLedger::new();
        let outcome = ledger.insert_order(new_order("fo-4", Uuid::new_v4(), 1)).await.unwrap();
        let order_id = outcome.order().id;
        let now = Utc::now();
        let attempt = |id: Uuid| SettlementAttempt {
            id,
            order_id,
            fulfillment_id: Uuid::new_v4(),
            currency: "USD".into(),
            targets: vec![],
            retailer_charge: 100,
            supplier_payout: 80,
            includes_shipping: false,
            charge_id: None,
            transfer_id: None,
            state: SettlementState::Open,
            created_at: now,
            updated_at: now,
        };

        let first = attempt(Uuid::new_v4());
        assert!(ledger.begin_settlement(&first).await.unwrap());
        assert!(!ledger.begin_settlement(&attempt(Uuid::new_v4())).await.unwrap());

        ledger.record_settlement_charge(first.id, "ch_1").await.unwrap();
        let open = ledger.open_settlement(order_id).await.unwrap().unwrap();
        assert_eq!(open.charge_id.as_deref(), Some("ch_1"));

        ledger.abandon_settlement(first.id).await.unwrap();
        assert!(ledger.open_settlement(order_id).await.unwrap().is_none());
        assert!(ledger.begin_settlement(&attempt(Uuid::new_v4())).await.unwrap());
    }

    #[tokio::test]
    async fn test_processed_webhook_recorded_once() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.record_processed_webhook("evt_1", "charge.captured").await.unwrap());
        assert!(!ledger.record_processed_webhook("evt_1", "charge.captured").await.unwrap());
        assert!(ledger.is_webhook_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_detach_only_clears_matching_default_method() {
        let directory = InMemoryDirectory::new();
        let store_id = Uuid::new_v4();
        directory.set_payment_profile(
            store_id,
            PaymentProfile {
                customer_id: Some("cus_1".into()),
                default_payment_method_id: Some("pm_new".into()),
                ..Default::default()
            },
        );

        assert!(!directory.detach_payment_method("cus_1", "pm_old").await.unwrap());
        assert!(directory.detach_payment_method("cus_1", "pm_new").await.unwrap());
        let profile = directory.payment_profile(store_id).await.unwrap().unwrap();
        assert!(profile.default_payment_method_id.is_none());
    }
}
