//! Fixtures and in-process fakes for the platform and processor clients.

use async_trait::async_trait;
use chrono::Utc;
use dropsplit_core::commerce::{
    CartLine, CommerceError, CommercePlatform, CompletedOrder, CompletedOrderLine, DeliveryOption, DraftOrderRequest,
    FulfillmentOrderDetails, MirrorFulfillment, StoreHandle,
};
use dropsplit_core::directory::{ImportedVariant, PartnerRole, StoreAccount};
use dropsplit_core::ledger::{Order, OrderLineItem, PaymentStatus};
use dropsplit_core::payment::{ChargeRequest, PaymentError, PaymentProcessor, PaymentReceipt, TransferRequest};
use dropsplit_shared::models::{Address, TrackingInfo};
use dropsplit_shared::Masked;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

pub fn order_fixture(shipping_cost: i64) -> Order {
    let now = Utc::now();
    Order {
        id: Uuid::new_v4(),
        currency: "USD".into(),
        retailer_fulfillment_order_id: "fo-1".into(),
        retailer_order_id: "ro-1".into(),
        supplier_order_id: "so-1".into(),
        retailer_id: Uuid::new_v4(),
        supplier_id: Uuid::new_v4(),
        shipping_cost,
        shipping_service_code: "standard".into(),
        payment_status: PaymentStatus::Incomplete,
        created_at: now,
        updated_at: now,
    }
}

/// Retail 25.00, retailer keeps 7.00, supplier keeps 15.00.
pub fn line_fixture(order_id: Uuid, supplier_line: &str, quantity: i32) -> OrderLineItem {
    let now = Utc::now();
    OrderLineItem {
        id: Uuid::new_v4(),
        order_id,
        retailer_variant_id: format!("rv-{}", supplier_line),
        supplier_variant_id: format!("sv-{}", supplier_line),
        retailer_line_item_id: format!("r-{}", supplier_line),
        supplier_line_item_id: supplier_line.into(),
        retail_price_per_unit: 2500,
        retailer_profit_per_unit: 700,
        supplier_profit_per_unit: 1500,
        quantity,
        quantity_fulfilled: 0,
        quantity_paid: 0,
        quantity_cancelled: 0,
        price_list_id: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn store_fixture(shop_domain: &str, role: PartnerRole) -> StoreAccount {
    StoreAccount {
        id: Uuid::new_v4(),
        shop_domain: shop_domain.into(),
        access_token: Masked::new(format!("token-{}", shop_domain)),
        role,
        dropship_location_id: match role {
            PartnerRole::Retailer => Some("loc-dropship".into()),
            PartnerRole::Supplier => None,
        },
    }
}

/// Same price terms as [`line_fixture`].
pub fn imported_fixture(supplier_id: Uuid, retailer_variant_id: &str, supplier_variant_id: &str) -> ImportedVariant {
    ImportedVariant {
        retailer_variant_id: retailer_variant_id.into(),
        supplier_id,
        supplier_variant_id: supplier_variant_id.into(),
        price_list_id: None,
        retail_price: 2500,
        retailer_profit: 700,
        supplier_profit: 1500,
    }
}

pub fn delivery_option(title: &str, amount: i64) -> DeliveryOption {
    DeliveryOption {
        title: title.into(),
        code: title.to_lowercase(),
        amount,
        currency: "USD".into(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Commerce platform
// ============================================================================

#[derive(Default)]
struct CommerceState {
    fulfillment_orders: HashMap<String, FulfillmentOrderDetails>,
    delivery_options: HashMap<String, Vec<DeliveryOption>>,
    delays: HashMap<String, Duration>,
    failing_shops: HashSet<String>,
    rejected_fulfillment_cancels: HashSet<String>,
    lineless_shops: HashSet<String>,
    drafts: HashMap<String, (String, DraftOrderRequest)>,
    completed_orders: Vec<(String, CompletedOrder)>,
    cancelled_orders: Vec<(String, String)>,
    mirrored: Vec<(String, MirrorFulfillment)>,
    tracking_updates: Vec<(String, String, TrackingInfo)>,
    cancelled_fulfillments: Vec<(String, String)>,
    reopened: Vec<(String, String)>,
    delivery_lookups: usize,
    next_id: u64,
}

impl CommerceState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Records every call and answers from canned data.
#[derive(Default)]
pub struct FakeCommerce {
    state: Mutex<CommerceState>,
}

impl FakeCommerce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fulfillment_order(&self, details: FulfillmentOrderDetails) {
        lock(&self.state).fulfillment_orders.insert(details.id.clone(), details);
    }

    pub fn set_delivery_options(&self, shop_domain: &str, options: Vec<DeliveryOption>) {
        lock(&self.state).delivery_options.insert(shop_domain.into(), options);
    }

    pub fn set_delay(&self, shop_domain: &str, delay: Duration) {
        lock(&self.state).delays.insert(shop_domain.into(), delay);
    }

    /// Every call against `shop_domain` fails with a transport error.
    pub fn fail_shop(&self, shop_domain: &str) {
        lock(&self.state).failing_shops.insert(shop_domain.into());
    }

    pub fn recover_shop(&self, shop_domain: &str) {
        lock(&self.state).failing_shops.remove(shop_domain);
    }

    /// `cancel_fulfillment` on this id answers with user errors.
    pub fn reject_fulfillment_cancel(&self, fulfillment_id: &str) {
        lock(&self.state).rejected_fulfillment_cancels.insert(fulfillment_id.into());
    }

    /// Orders completed on `shop_domain` come back without line items.
    pub fn complete_without_lines(&self, shop_domain: &str) {
        lock(&self.state).lineless_shops.insert(shop_domain.into());
    }

    pub fn completed_orders(&self) -> Vec<(String, CompletedOrder)> {
        lock(&self.state).completed_orders.clone()
    }

    pub fn drafts(&self) -> Vec<(String, DraftOrderRequest)> {
        lock(&self.state).drafts.values().cloned().collect()
    }

    pub fn cancelled_orders(&self) -> Vec<(String, String)> {
        lock(&self.state).cancelled_orders.clone()
    }

    pub fn mirrored(&self) -> Vec<(String, MirrorFulfillment)> {
        lock(&self.state).mirrored.clone()
    }

    pub fn tracking_updates(&self) -> Vec<(String, String, TrackingInfo)> {
        lock(&self.state).tracking_updates.clone()
    }

    pub fn cancelled_fulfillments(&self) -> Vec<(String, String)> {
        lock(&self.state).cancelled_fulfillments.clone()
    }

    pub fn reopened(&self) -> Vec<(String, String)> {
        lock(&self.state).reopened.clone()
    }

    pub fn delivery_lookups(&self) -> usize {
        lock(&self.state).delivery_lookups
    }

    fn check_shop(&self, store: &StoreHandle) -> Result<(), CommerceError> {
        if lock(&self.state).failing_shops.contains(&store.shop_domain) {
            return Err(CommerceError::Transport(format!("{} unreachable", store.shop_domain)));
        }
        Ok(())
    }
}

#[async_trait]
impl CommercePlatform for FakeCommerce {
    async fn fulfillment_order(
        &self,
        store: &StoreHandle,
        fulfillment_order_id: &str,
    ) -> Result<FulfillmentOrderDetails, CommerceError> {
        self.check_shop(store)?;
        lock(&self.state)
            .fulfillment_orders
            .get(fulfillment_order_id)
            .cloned()
            .ok_or_else(|| CommerceError::NotFound(fulfillment_order_id.into()))
    }

    async fn delivery_options(
        &self,
        store: &StoreHandle,
        _lines: &[CartLine],
        _destination: &Address,
        _currency: &str,
    ) -> Result<Vec<DeliveryOption>, CommerceError> {
        let delay = {
            let mut state = lock(&self.state);
            state.delivery_lookups += 1;
            state.delays.get(&store.shop_domain).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_shop(store)?;
        Ok(lock(&self.state)
            .delivery_options
            .get(&store.shop_domain)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_draft_order(
        &self,
        store: &StoreHandle,
        draft: &DraftOrderRequest,
    ) -> Result<String, CommerceError> {
        self.check_shop(store)?;
        let mut state = lock(&self.state);
        let id = state.next_id("draft");
        state
            .drafts
            .insert(id.clone(), (store.shop_domain.clone(), draft.clone()));
        Ok(id)
    }

    async fn complete_draft_order(
        &self,
        store: &StoreHandle,
        draft_order_id: &str,
    ) -> Result<CompletedOrder, CommerceError> {
        self.check_shop(store)?;
        let mut state = lock(&self.state);
        let (_, draft) = state
            .drafts
            .get(draft_order_id)
            .cloned()
            .ok_or_else(|| CommerceError::NotFound(draft_order_id.into()))?;

        let order_id = state.next_id("order");
        let line_items = if state.lineless_shops.contains(&store.shop_domain) {
            Vec::new()
        } else {
            draft
                .lines
                .iter()
                .map(|l| CompletedOrderLine {
                    id: format!("{}-{}", order_id, l.variant_id),
                    variant_id: l.variant_id.clone(),
                    quantity: l.quantity,
                })
                .collect()
        };
        let completed = CompletedOrder { line_items, order_id };
        state
            .completed_orders
            .push((store.shop_domain.clone(), completed.clone()));
        Ok(completed)
    }

    async fn cancel_order(&self, store: &StoreHandle, order_id: &str) -> Result<(), CommerceError> {
        self.check_shop(store)?;
        lock(&self.state)
            .cancelled_orders
            .push((store.shop_domain.clone(), order_id.into()));
        Ok(())
    }

    async fn create_fulfillment(
        &self,
        store: &StoreHandle,
        fulfillment: &MirrorFulfillment,
    ) -> Result<String, CommerceError> {
        self.check_shop(store)?;
        let mut state = lock(&self.state);
        let id = state.next_id("fulfillment");
        state.mirrored.push((store.shop_domain.clone(), fulfillment.clone()));
        Ok(id)
    }

    async fn update_tracking(
        &self,
        store: &StoreHandle,
        fulfillment_id: &str,
        tracking: &TrackingInfo,
    ) -> Result<(), CommerceError> {
        self.check_shop(store)?;
        lock(&self.state).tracking_updates.push((
            store.shop_domain.clone(),
            fulfillment_id.into(),
            tracking.clone(),
        ));
        Ok(())
    }

    async fn cancel_fulfillment(&self, store: &StoreHandle, fulfillment_id: &str) -> Result<(), CommerceError> {
        self.check_shop(store)?;
        let mut state = lock(&self.state);
        if state.rejected_fulfillment_cancels.contains(fulfillment_id) {
            return Err(CommerceError::UserErrors(vec!["Fulfillment is already cancelled".into()]));
        }
        state
            .cancelled_fulfillments
            .push((store.shop_domain.clone(), fulfillment_id.into()));
        Ok(())
    }

    async fn reopen_fulfillment_order(
        &self,
        store: &StoreHandle,
        fulfillment_order_id: &str,
    ) -> Result<(), CommerceError> {
        self.check_shop(store)?;
        lock(&self.state)
            .reopened
            .push((store.shop_domain.clone(), fulfillment_order_id.into()));
        Ok(())
    }
}

// ============================================================================
// Payment processor
// ============================================================================

#[derive(Default)]
struct ProcessorState {
    charges: Vec<ChargeRequest>,
    transfers: Vec<TransferRequest>,
    decline_charges: bool,
    fail_transfers: bool,
}

/// Records charges and transfers. Replays of an idempotency key are answered
/// without recording a second money movement.
#[derive(Default)]
pub struct FakeProcessor {
    state: Mutex<ProcessorState>,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decline_charges(&self, decline: bool) {
        lock(&self.state).decline_charges = decline;
    }

    pub fn fail_transfers(&self, fail: bool) {
        lock(&self.state).fail_transfers = fail;
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        lock(&self.state).charges.clone()
    }

    pub fn transfers(&self) -> Vec<TransferRequest> {
        lock(&self.state).transfers.clone()
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn charge_saved_payment_method(&self, charge: &ChargeRequest) -> Result<PaymentReceipt, PaymentError> {
        let mut state = lock(&self.state);
        if state.decline_charges {
            return Err(PaymentError::Declined("card_declined".into()));
        }
        let id = format!("ch_{}", charge.idempotency_key);
        if !state.charges.iter().any(|c| c.idempotency_key == charge.idempotency_key) {
            state.charges.push(charge.clone());
        }
        Ok(PaymentReceipt { id })
    }

    async fn transfer_to_connected_account(&self, transfer: &TransferRequest) -> Result<PaymentReceipt, PaymentError> {
        let mut state = lock(&self.state);
        if state.fail_transfers {
            return Err(PaymentError::Api {
                status: 503,
                message: "processor unavailable".into(),
            });
        }
        let id = format!("tr_{}", transfer.idempotency_key);
        if !state.transfers.iter().any(|t| t.idempotency_key == transfer.idempotency_key) {
            state.transfers.push(transfer.clone());
        }
        Ok(PaymentReceipt { id })
    }
}
