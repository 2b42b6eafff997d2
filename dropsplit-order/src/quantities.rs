//! Pure transitions over an Order's line quantities. Each function reads the
//! current counters and derives its delta from them, so replaying the same
//! event against already-updated lines is a no-op.

use dropsplit_core::ledger::{FulfilledLine, OrderLineItem, QuantityError};
use tracing::warn;

pub use dropsplit_core::ledger::PaidTarget;

/// A supplier line item id with the number of units an event reports for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippedLine {
    pub supplier_line_item_id: String,
    pub quantity: i32,
}

fn find_line<'a>(lines: &'a mut [OrderLineItem], supplier_line_item_id: &str) -> Option<&'a mut OrderLineItem> {
    lines
        .iter_mut()
        .find(|l| l.supplier_line_item_id == supplier_line_item_id)
}

/// Count shipped units as fulfilled, capped at what is still outstanding.
/// Returns the number of units newly counted.
pub fn apply_shipment(lines: &mut [OrderLineItem], shipped: &[ShippedLine]) -> Result<i32, QuantityError> {
    let mut applied = 0;

    for item in shipped {
        let Some(line) = find_line(lines, &item.supplier_line_item_id) else {
            warn!(line_item = %item.supplier_line_item_id, "Shipped line is not part of this order");
            continue;
        };

        let delta = item.quantity.max(0).min(line.remaining());
        if delta < item.quantity {
            warn!(
                line_id = %line.id,
                reported = item.quantity,
                counted = delta,
                "Shipment exceeds outstanding quantity, capping"
            );
        }
        line.quantity_fulfilled += delta;
        applied += delta;
        line.check_invariants()?;
    }

    Ok(applied)
}

/// Undo a cancelled shipment by exactly what it counted when recorded: units
/// go back to outstanding, not to cancelled. Paid units cannot be
/// un-fulfilled, so the decrement stops at `quantity_paid`.
pub fn revert_shipment(lines: &mut [OrderLineItem], counted: &[FulfilledLine]) -> Result<i32, QuantityError> {
    let mut reverted = 0;

    for item in counted {
        let Some(line) = lines.iter_mut().find(|l| l.id == item.line_id) else {
            continue;
        };

        let delta = item.quantity.max(0).min(line.unpaid_fulfilled());
        if delta < item.quantity {
            warn!(
                line_id = %line.id,
                requested = item.quantity,
                reverted = delta,
                paid = line.quantity_paid,
                "Cancelled shipment overlaps paid units, clamping"
            );
        }
        line.quantity_fulfilled -= delta;
        reverted += delta;
        line.check_invariants()?;
    }

    Ok(reverted)
}

/// Cancel every unit that has not shipped. Returns the number cancelled.
pub fn cancel_remaining(lines: &mut [OrderLineItem]) -> Result<i32, QuantityError> {
    let mut cancelled = 0;

    for line in lines.iter_mut() {
        let remaining = line.remaining();
        if remaining > 0 {
            line.quantity_cancelled += remaining;
            cancelled += remaining;
        }
        line.check_invariants()?;
    }

    Ok(cancelled)
}

/// Compare-and-set `quantity_paid` per target. Lines whose paid count moved
/// since the plan was computed are left alone. Returns the number of units advanced.
pub fn advance_paid(lines: &mut [OrderLineItem], targets: &[PaidTarget]) -> Result<i32, QuantityError> {
    let mut advanced = 0;

    for target in targets {
        let line = lines
            .iter_mut()
            .find(|l| l.id == target.line_id)
            .ok_or_else(|| QuantityError::UnknownLine(target.line_id.to_string()))?;

        if line.quantity_paid != target.paid_from {
            warn!(
                line_id = %line.id,
                expected = target.paid_from,
                found = line.quantity_paid,
                "Paid quantity moved under settlement, skipping line"
            );
            continue;
        }

        line.quantity_paid = target.paid_to;
        advanced += target.paid_to - target.paid_from;
        line.check_invariants()?;
    }

    Ok(advanced)
}

pub fn total_paid(lines: &[OrderLineItem]) -> i32 {
    lines.iter().map(|l| l.quantity_paid).sum()
}
