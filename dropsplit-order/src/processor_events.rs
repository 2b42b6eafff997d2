use dropsplit_core::directory::{DirectoryError, PartnerDirectory};
use dropsplit_shared::models::processor::ChargeObject;
use dropsplit_shared::models::ProcessorEvent;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a processor event changed, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEffect {
    Applied,
    /// The event names an account or customer no store owns.
    NoMatch,
    Logged,
}

/// Keeps payment-account flags in the partner directory in step with the
/// processor, and surfaces charge results in the logs.
pub struct ProcessorEventHandler {
    directory: Arc<dyn PartnerDirectory>,
}

impl ProcessorEventHandler {
    pub fn new(directory: Arc<dyn PartnerDirectory>) -> Self {
        Self { directory }
    }

    pub async fn handle(&self, event_id: &str, event: &ProcessorEvent) -> Result<EventEffect, DirectoryError> {
        let matched = match event {
            ProcessorEvent::AccountUpdated { account } => {
                let matched = self
                    .directory
                    .update_account_capabilities(&account.id, account.payouts_enabled)
                    .await?;
                info!(
                    event_id,
                    account = %account.id,
                    payouts_enabled = account.payouts_enabled,
                    charges_enabled = account.charges_enabled,
                    "Connected account updated"
                );
                matched
            }
            ProcessorEvent::AccountDeauthorized { account_id } => {
                let matched = self.directory.disconnect_account(account_id).await?;
                warn!(event_id, account = %account_id, "Connected account deauthorized");
                matched
            }
            ProcessorEvent::PaymentMethodAttached { payment_method } => {
                let Some(customer) = &payment_method.customer else {
                    debug!(event_id, payment_method = %payment_method.id, "Attached method has no customer");
                    return Ok(EventEffect::NoMatch);
                };
                self.directory
                    .attach_payment_method(customer, &payment_method.id)
                    .await?
            }
            ProcessorEvent::PaymentMethodDetached {
                payment_method,
                previous_customer,
            } => {
                let Some(customer) = previous_customer.as_ref().or(payment_method.customer.as_ref()) else {
                    debug!(event_id, payment_method = %payment_method.id, "Detached method has no known customer");
                    return Ok(EventEffect::NoMatch);
                };
                self.directory
                    .detach_payment_method(customer, &payment_method.id)
                    .await?
            }
            ProcessorEvent::ChargeCaptured { charge } => {
                log_charge(event_id, charge, true);
                return Ok(EventEffect::Logged);
            }
            ProcessorEvent::ChargeFailed { charge } => {
                log_charge(event_id, charge, false);
                return Ok(EventEffect::Logged);
            }
        };

        if matched {
            Ok(EventEffect::Applied)
        } else {
            debug!(event_id, kind = event.type_name(), "No store matched processor event");
            Ok(EventEffect::NoMatch)
        }
    }
}

fn log_charge(event_id: &str, charge: &ChargeObject, captured: bool) {
    let order_id = charge.metadata.get("order_id").map(String::as_str).unwrap_or("-");
    let units = charge.metadata.get("units").map(String::as_str).unwrap_or("-");

    if captured {
        info!(
            event_id,
            charge = %charge.id,
            amount = charge.amount,
            currency = %charge.currency,
            order_id,
            units,
            "Charge captured"
        );
    } else {
        error!(
            event_id,
            charge = %charge.id,
            amount = charge.amount,
            currency = %charge.currency,
            order_id,
            units,
            reason = charge.failure_message.as_deref().unwrap_or("unknown"),
            "Charge failed"
        );
    }
}
