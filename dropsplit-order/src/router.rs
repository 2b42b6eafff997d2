use dropsplit_core::commerce::{
    CartLine, CommerceError, CommercePlatform, CompletedOrder, DraftOrderLine, DraftOrderRequest,
    FulfillmentOrderDetails, FulfillmentOrderLine, StoreHandle,
};
use dropsplit_core::directory::{DirectoryError, ImportedVariant, PartnerDirectory, StoreAccount};
use dropsplit_core::ledger::{NewLineItem, NewOrder};
use dropsplit_core::repository::{InsertOutcome, LedgerError, LedgerRepository};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::rates::select_option;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Store {0} is not registered")]
    UnknownStore(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Commerce(#[from] CommerceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Supplier store {0} is not registered")]
    UnknownSupplier(Uuid),

    #[error("Supplier {0} offers no delivery option for this destination")]
    NoDeliveryOption(Uuid),

    #[error("Completed supplier order has no line for variant {0}")]
    MissingOrderLine(String),

    #[error("Quantity {0} out of range")]
    QuantityOutOfRange(u32),
}

impl RoutingError {
    pub fn is_transient(&self) -> bool {
        match self {
            RoutingError::Directory(_) => true,
            RoutingError::Commerce(e) => e.is_transient(),
            RoutingError::Ledger(e) => e.is_transient(),
            // Delivery profiles get fixed by the supplier; keep redriving.
            RoutingError::NoDeliveryOption(_) => true,
            // A redrive would complete yet another supplier order.
            RoutingError::MissingOrderLine(_) => false,
            RoutingError::UnknownStore(_) | RoutingError::UnknownSupplier(_) | RoutingError::QuantityOutOfRange(_) => {
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupFailure {
    pub supplier_id: Uuid,
    pub error: String,
    pub transient: bool,
}

/// What happened to each supplier group of one fulfillment order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingReport {
    pub fulfillment_order_id: String,
    /// Set when the fulfillment order is not ours to route.
    pub skipped: Option<String>,
    pub created: Vec<Uuid>,
    pub already_routed: Vec<Uuid>,
    pub failed: Vec<GroupFailure>,
}

impl RoutingReport {
    fn skipped(fulfillment_order_id: &str, reason: &str) -> Self {
        Self {
            fulfillment_order_id: fulfillment_order_id.to_string(),
            skipped: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Worth redriving: at least one group failed for a reason that may clear.
    pub fn has_transient_failures(&self) -> bool {
        self.failed.iter().any(|f| f.transient)
    }
}

struct SupplierGroup<'a> {
    supplier_id: Uuid,
    lines: Vec<(&'a FulfillmentOrderLine, &'a ImportedVariant)>,
}

impl SupplierGroup<'_> {
    fn quantities(&self) -> Result<Vec<i32>, RoutingError> {
        self.lines
            .iter()
            .map(|(line, _)| i32::try_from(line.quantity).map_err(|_| RoutingError::QuantityOutOfRange(line.quantity)))
            .collect()
    }
}

pub struct OrderRouter {
    directory: Arc<dyn PartnerDirectory>,
    commerce: Arc<dyn CommercePlatform>,
    ledger: Arc<dyn LedgerRepository>,
    default_service_code: String,
}

impl OrderRouter {
    pub fn new(
        directory: Arc<dyn PartnerDirectory>,
        commerce: Arc<dyn CommercePlatform>,
        ledger: Arc<dyn LedgerRepository>,
        default_service_code: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            commerce,
            ledger,
            default_service_code: default_service_code.into(),
        }
    }

    /// Split a routed retailer fulfillment order into one supplier order per
    /// supplier. Groups are independent: one failing does not undo the others,
    /// and groups already in the ledger are skipped.
    pub async fn route(&self, retailer_shop: &str, fulfillment_order_id: &str) -> Result<RoutingReport, RoutingError> {
        let retailer = self
            .directory
            .store_by_domain(retailer_shop)
            .await?
            .ok_or_else(|| RoutingError::UnknownStore(retailer_shop.to_string()))?;

        let details = self
            .commerce
            .fulfillment_order(&retailer.handle(), fulfillment_order_id)
            .await?;

        if retailer.dropship_location_id.as_deref() != Some(details.assigned_location_id.as_str()) {
            debug!(
                fulfillment_order = fulfillment_order_id,
                location = %details.assigned_location_id,
                "Fulfillment order is not assigned to the dropship location"
            );
            return Ok(RoutingReport::skipped(fulfillment_order_id, "not assigned to dropship location"));
        }

        let service_code = details
            .shipping_service_code
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| self.default_service_code.clone());

        let variant_ids: Vec<String> = details.line_items.iter().map(|l| l.variant_id.clone()).collect();
        let imported = self.directory.imported_variants(retailer.id, &variant_ids).await?;
        let groups = group_by_supplier(&details, &imported);

        if groups.is_empty() {
            return Ok(RoutingReport::skipped(fulfillment_order_id, "no imported variants"));
        }

        let mut report = RoutingReport {
            fulfillment_order_id: fulfillment_order_id.to_string(),
            ..Default::default()
        };

        for group in groups {
            let supplier_id = group.supplier_id;
            match self.route_group(&retailer, &details, &service_code, group).await {
                Ok(InsertOutcome::Created(order)) => {
                    info!(
                        fulfillment_order = fulfillment_order_id,
                        supplier_id = %supplier_id,
                        order_id = %order.id,
                        supplier_order = %order.supplier_order_id,
                        "Supplier order created"
                    );
                    report.created.push(supplier_id);
                }
                Ok(InsertOutcome::AlreadyExists(_)) => report.already_routed.push(supplier_id),
                Err(e) => {
                    error!(
                        fulfillment_order = fulfillment_order_id,
                        supplier_id = %supplier_id,
                        error = %e,
                        "Failed to route supplier group"
                    );
                    report.failed.push(GroupFailure {
                        supplier_id,
                        transient: e.is_transient(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn route_group(
        &self,
        retailer: &StoreAccount,
        details: &FulfillmentOrderDetails,
        service_code: &str,
        group: SupplierGroup<'_>,
    ) -> Result<InsertOutcome, RoutingError> {
        if let Some(existing) = self.ledger.find_order_for_supplier(&details.id, group.supplier_id).await? {
            debug!(order_id = %existing.id, "Supplier group already routed");
            return Ok(InsertOutcome::AlreadyExists(existing));
        }

        let supplier = self
            .directory
            .store_by_id(group.supplier_id)
            .await?
            .ok_or(RoutingError::UnknownSupplier(group.supplier_id))?;
        let supplier_handle = supplier.handle();
        let quantities = group.quantities()?;

        let cart: Vec<CartLine> = group
            .lines
            .iter()
            .map(|(line, variant)| CartLine {
                variant_id: variant.supplier_variant_id.clone(),
                quantity: line.quantity,
            })
            .collect();

        let options = self
            .commerce
            .delivery_options(&supplier_handle, &cart, &details.destination, &details.currency)
            .await?;
        let shipping = select_option(&options, service_code)
            .ok_or(RoutingError::NoDeliveryOption(group.supplier_id))?
            .clone();

        let draft = DraftOrderRequest {
            currency: details.currency.clone(),
            shipping_address: details.destination.clone(),
            shipping_title: shipping.title.clone(),
            shipping_code: shipping.code.clone(),
            shipping_price: shipping.amount,
            lines: group
                .lines
                .iter()
                .map(|(line, variant)| DraftOrderLine {
                    variant_id: variant.supplier_variant_id.clone(),
                    quantity: line.quantity,
                    unit_price: variant.retail_price - variant.retailer_profit,
                })
                .collect(),
            tags: vec!["dropsplit".to_string(), format!("fulfillment-order:{}", details.id)],
            note: Some(format!("Dropship order for {}", retailer.shop_domain)),
        };

        let draft_id = self.commerce.create_draft_order(&supplier_handle, &draft).await?;
        let completed = self.commerce.complete_draft_order(&supplier_handle, &draft_id).await?;

        // From here on a real supplier order exists; it must end up in the ledger or cancelled.
        let recorded = match order_lines(&group, &quantities, &completed) {
            Ok(line_items) => self
                .ledger
                .insert_order(NewOrder {
                    currency: details.currency.clone(),
                    retailer_fulfillment_order_id: details.id.clone(),
                    retailer_order_id: details.order_id.clone(),
                    supplier_order_id: completed.order_id.clone(),
                    retailer_id: retailer.id,
                    supplier_id: group.supplier_id,
                    shipping_cost: shipping.amount,
                    shipping_service_code: service_code.to_string(),
                    line_items,
                })
                .await
                .map_err(RoutingError::from),
            Err(e) => Err(e),
        };

        match recorded {
            Ok(InsertOutcome::Created(order)) => Ok(InsertOutcome::Created(order)),
            Ok(InsertOutcome::AlreadyExists(existing)) => {
                warn!(
                    order_id = %existing.id,
                    duplicate_supplier_order = %completed.order_id,
                    "Concurrent routing created a duplicate supplier order"
                );
                self.cancel_unrecorded(&supplier_handle, &completed.order_id).await;
                Ok(InsertOutcome::AlreadyExists(existing))
            }
            Err(e) => {
                // The insert may have committed before the error surfaced.
                match self.ledger.find_order_for_supplier(&details.id, group.supplier_id).await {
                    Ok(Some(recorded)) if recorded.supplier_order_id == completed.order_id => {
                        return Ok(InsertOutcome::Created(recorded));
                    }
                    Ok(Some(recorded)) => {
                        self.cancel_unrecorded(&supplier_handle, &completed.order_id).await;
                        return Ok(InsertOutcome::AlreadyExists(recorded));
                    }
                    Ok(None) => {}
                    Err(lookup_err) => {
                        warn!(error = %lookup_err, "Could not re-check ledger after failed insert");
                    }
                }
                self.cancel_unrecorded(&supplier_handle, &completed.order_id).await;
                Err(e)
            }
        }
    }

    /// Compensate for a supplier order the ledger will not track.
    async fn cancel_unrecorded(&self, supplier: &StoreHandle, supplier_order_id: &str) {
        match self.commerce.cancel_order(supplier, supplier_order_id).await {
            Ok(()) => warn!(
                shop = %supplier.shop_domain,
                supplier_order = supplier_order_id,
                "Cancelled supplier order that could not be recorded"
            ),
            Err(e) => error!(
                shop = %supplier.shop_domain,
                supplier_order = supplier_order_id,
                error = %e,
                "Failed to cancel unrecorded supplier order, needs manual cancellation"
            ),
        }
    }
}

/// Ledger lines for a completed supplier order, matched by supplier variant.
fn order_lines(
    group: &SupplierGroup<'_>,
    quantities: &[i32],
    completed: &CompletedOrder,
) -> Result<Vec<NewLineItem>, RoutingError> {
    group
        .lines
        .iter()
        .zip(quantities)
        .map(|((line, variant), quantity)| {
            let supplier_line = completed
                .line_for_variant(&variant.supplier_variant_id)
                .ok_or_else(|| RoutingError::MissingOrderLine(variant.supplier_variant_id.clone()))?;

            Ok(NewLineItem {
                retailer_variant_id: variant.retailer_variant_id.clone(),
                supplier_variant_id: variant.supplier_variant_id.clone(),
                retailer_line_item_id: line.id.clone(),
                supplier_line_item_id: supplier_line.id.clone(),
                retail_price_per_unit: variant.retail_price,
                retailer_profit_per_unit: variant.retailer_profit,
                supplier_profit_per_unit: variant.supplier_profit,
                quantity: *quantity,
                price_list_id: variant.price_list_id,
            })
        })
        .collect()
}

/// Partition fulfillment-order lines by supplier. Lines whose variant is not
/// imported belong to the retailer and are left out.
fn group_by_supplier<'a>(
    details: &'a FulfillmentOrderDetails,
    imported: &'a [ImportedVariant],
) -> Vec<SupplierGroup<'a>> {
    let mut groups: BTreeMap<Uuid, Vec<(&FulfillmentOrderLine, &ImportedVariant)>> = BTreeMap::new();

    for line in &details.line_items {
        match imported.iter().find(|v| v.retailer_variant_id == line.variant_id) {
            Some(variant) => groups.entry(variant.supplier_id).or_default().push((line, variant)),
            None => debug!(variant = %line.variant_id, "Skipping native line item"),
        }
    }

    groups
        .into_iter()
        .map(|(supplier_id, lines)| SupplierGroup { supplier_id, lines })
        .collect()
}
