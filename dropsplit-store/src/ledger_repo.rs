use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dropsplit_core::ledger::{
    FulfilledLine, Fulfillment, LineMutation, NewOrder, Order, OrderLineItem, PaidTarget, PaymentStatus,
    SettlementAttempt, SettlementState,
};
use dropsplit_core::repository::{FulfillmentRecord, InsertOutcome, LedgerError, LedgerRepository, LineUpdate};
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Database(e.to_string())
}

const ORDER_COLUMNS: &str = "id, currency, retailer_fulfillment_order_id, retailer_order_id, supplier_order_id, \
     retailer_id, supplier_id, shipping_cost, shipping_service_code, payment_status, created_at, updated_at";

const LINE_COLUMNS: &str = "id, order_id, retailer_variant_id, supplier_variant_id, retailer_line_item_id, \
     supplier_line_item_id, retail_price_per_unit, retailer_profit_per_unit, supplier_profit_per_unit, quantity, \
     quantity_fulfilled, quantity_paid, quantity_cancelled, price_list_id, created_at, updated_at";

const FULFILLMENT_COLUMNS: &str = "id, order_id, supplier_fulfillment_id, retailer_fulfillment_id, settled_at, created_at";

const ATTEMPT_COLUMNS: &str = "id, order_id, fulfillment_id, currency, retailer_charge, supplier_payout, \
     includes_shipping, charge_id, transfer_id, state, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    currency: String,
    retailer_fulfillment_order_id: String,
    retailer_order_id: String,
    supplier_order_id: String,
    retailer_id: Uuid,
    supplier_id: Uuid,
    shipping_cost: i64,
    shipping_service_code: String,
    payment_status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = LedgerError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            currency: row.currency,
            retailer_fulfillment_order_id: row.retailer_fulfillment_order_id,
            retailer_order_id: row.retailer_order_id,
            supplier_order_id: row.supplier_order_id,
            retailer_id: row.retailer_id,
            supplier_id: row.supplier_id,
            shipping_cost: row.shipping_cost,
            shipping_service_code: row.shipping_service_code,
            payment_status: row.payment_status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LineRow {
    id: Uuid,
    order_id: Uuid,
    retailer_variant_id: String,
    supplier_variant_id: String,
    retailer_line_item_id: String,
    supplier_line_item_id: String,
    retail_price_per_unit: i64,
    retailer_profit_per_unit: i64,
    supplier_profit_per_unit: i64,
    quantity: i32,
    quantity_fulfilled: i32,
    quantity_paid: i32,
    quantity_cancelled: i32,
    price_list_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<LineRow> for OrderLineItem {
    fn from(row: LineRow) -> Self {
        OrderLineItem {
            id: row.id,
            order_id: row.order_id,
            retailer_variant_id: row.retailer_variant_id,
            supplier_variant_id: row.supplier_variant_id,
            retailer_line_item_id: row.retailer_line_item_id,
            supplier_line_item_id: row.supplier_line_item_id,
            retail_price_per_unit: row.retail_price_per_unit,
            retailer_profit_per_unit: row.retailer_profit_per_unit,
            supplier_profit_per_unit: row.supplier_profit_per_unit,
            quantity: row.quantity,
            quantity_fulfilled: row.quantity_fulfilled,
            quantity_paid: row.quantity_paid,
            quantity_cancelled: row.quantity_cancelled,
            price_list_id: row.price_list_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FulfillmentRow {
    id: Uuid,
    order_id: Uuid,
    supplier_fulfillment_id: String,
    retailer_fulfillment_id: Option<String>,
    settled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl FulfillmentRow {
    fn into_fulfillment(self, lines: Vec<FulfilledLine>) -> Fulfillment {
        Fulfillment {
            id: self.id,
            order_id: self.order_id,
            supplier_fulfillment_id: self.supplier_fulfillment_id,
            retailer_fulfillment_id: self.retailer_fulfillment_id,
            lines,
            settled_at: self.settled_at,
            created_at: self.created_at,
        }
    }
}

async fn fulfillment_lines<'e>(
    executor: impl PgExecutor<'e>,
    fulfillment_id: Uuid,
) -> Result<Vec<FulfilledLine>, LedgerError> {
    let rows: Vec<(Uuid, i32)> = sqlx::query_as(
        "SELECT line_item_id, quantity FROM fulfillment_lines WHERE fulfillment_id = $1 ORDER BY line_item_id",
    )
    .bind(fulfillment_id)
    .fetch_all(executor)
    .await
    .map_err(db_err)?;

    Ok(rows
        .into_iter()
        .map(|(line_id, quantity)| FulfilledLine { line_id, quantity })
        .collect())
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    order_id: Uuid,
    fulfillment_id: Uuid,
    currency: String,
    retailer_charge: i64,
    supplier_payout: i64,
    includes_shipping: bool,
    charge_id: Option<String>,
    transfer_id: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AttemptRow {
    fn into_attempt(self, targets: Vec<PaidTarget>) -> Result<SettlementAttempt, LedgerError> {
        Ok(SettlementAttempt {
            id: self.id,
            order_id: self.order_id,
            fulfillment_id: self.fulfillment_id,
            currency: self.currency,
            targets,
            retailer_charge: self.retailer_charge,
            supplier_payout: self.supplier_payout,
            includes_shipping: self.includes_shipping,
            charge_id: self.charge_id,
            transfer_id: self.transfer_id,
            state: self.state.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

async fn attempt_targets<'e>(executor: impl PgExecutor<'e>, attempt_id: Uuid) -> Result<Vec<PaidTarget>, LedgerError> {
    let rows: Vec<(Uuid, i32, i32)> = sqlx::query_as(
        "SELECT line_item_id, paid_from, paid_to FROM settlement_attempt_lines WHERE attempt_id = $1 ORDER BY line_item_id",
    )
    .bind(attempt_id)
    .fetch_all(executor)
    .await
    .map_err(db_err)?;

    Ok(rows
        .into_iter()
        .map(|(line_id, paid_from, paid_to)| PaidTarget { line_id, paid_from, paid_to })
        .collect())
}

// ============================================================================
// Locked line updates
// ============================================================================

/// Take the Order row lock. Every writer to an Order's lines goes through
/// here first, so lock order is always orders -> order_line_items.
async fn lock_order(tx: &mut Transaction<'_, Postgres>, order_id: Uuid) -> Result<PaymentStatus, LedgerError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT payment_status FROM orders WHERE id = $1 FOR UPDATE")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;

    let (status,) = row.ok_or_else(|| LedgerError::NotFound(format!("order {}", order_id)))?;
    Ok(status.parse()?)
}

async fn apply_locked(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    mutation: &LineMutation<'_>,
) -> Result<LineUpdate, LedgerError> {
    let current_status = lock_order(tx, order_id).await?;

    let rows: Vec<LineRow> = sqlx::query_as(&format!(
        "SELECT {} FROM order_line_items WHERE order_id = $1 ORDER BY created_at, id FOR UPDATE",
        LINE_COLUMNS
    ))
    .bind(order_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(db_err)?;

    let before: Vec<OrderLineItem> = rows.into_iter().map(OrderLineItem::from).collect();
    let mut lines = before.clone();
    let requested_status = mutation(lines.as_mut_slice())?;

    for line in &lines {
        line.check_invariants()?;
    }

    let now = Utc::now();
    for (line, old) in lines.iter_mut().zip(before.iter()) {
        let unchanged = line.quantity_fulfilled == old.quantity_fulfilled
            && line.quantity_paid == old.quantity_paid
            && line.quantity_cancelled == old.quantity_cancelled;
        if unchanged {
            continue;
        }

        sqlx::query(
            r#"
            UPDATE order_line_items
            SET quantity_fulfilled = $2, quantity_paid = $3, quantity_cancelled = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(line.id)
        .bind(line.quantity_fulfilled)
        .bind(line.quantity_paid)
        .bind(line.quantity_cancelled)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        line.updated_at = now;
    }

    let payment_status = match requested_status {
        Some(status) if status != current_status => {
            sqlx::query("UPDATE orders SET payment_status = $2, updated_at = $3 WHERE id = $1")
                .bind(order_id)
                .bind(status.as_str())
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            status
        }
        Some(status) => status,
        None => current_status,
    };

    Ok(LineUpdate {
        previous: before,
        lines,
        payment_status,
    })
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn find_order_for_supplier(
        &self,
        retailer_fulfillment_order_id: &str,
        supplier_id: Uuid,
    ) -> Result<Option<Order>, LedgerError> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE retailer_fulfillment_order_id = $1 AND supplier_id = $2",
            ORDER_COLUMNS
        ))
        .bind(retailer_fulfillment_order_id)
        .bind(supplier_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Order::try_from).transpose()
    }

    async fn insert_order(&self, order: NewOrder) -> Result<InsertOutcome, LedgerError> {
        let (order, lines) = order.into_records(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO orders (id, currency, retailer_fulfillment_order_id, retailer_order_id, supplier_order_id,
                                retailer_id, supplier_id, shipping_cost, shipping_service_code, payment_status,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (retailer_fulfillment_order_id, supplier_id) DO NOTHING
            "#,
        )
        .bind(order.id)
        .bind(&order.currency)
        .bind(&order.retailer_fulfillment_order_id)
        .bind(&order.retailer_order_id)
        .bind(&order.supplier_order_id)
        .bind(order.retailer_id)
        .bind(order.supplier_id)
        .bind(order.shipping_cost)
        .bind(&order.shipping_service_code)
        .bind(order.payment_status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            debug!(
                fulfillment_order = %order.retailer_fulfillment_order_id,
                supplier_id = %order.supplier_id,
                "Order already recorded"
            );
            let existing = self
                .find_order_for_supplier(&order.retailer_fulfillment_order_id, order.supplier_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("order for {}", order.retailer_fulfillment_order_id)))?;
            return Ok(InsertOutcome::AlreadyExists(existing));
        }

        for line in &lines {
            sqlx::query(
                r#"
                INSERT INTO order_line_items (id, order_id, retailer_variant_id, supplier_variant_id,
                                              retailer_line_item_id, supplier_line_item_id, retail_price_per_unit,
                                              retailer_profit_per_unit, supplier_profit_per_unit, quantity,
                                              quantity_fulfilled, quantity_paid, quantity_cancelled, price_list_id,
                                              created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, 0, 0, $11, $12, $13)
                "#,
            )
            .bind(line.id)
            .bind(line.order_id)
            .bind(&line.retailer_variant_id)
            .bind(&line.supplier_variant_id)
            .bind(&line.retailer_line_item_id)
            .bind(&line.supplier_line_item_id)
            .bind(line.retail_price_per_unit)
            .bind(line.retailer_profit_per_unit)
            .bind(line.supplier_profit_per_unit)
            .bind(line.quantity)
            .bind(line.price_list_id)
            .bind(line.created_at)
            .bind(line.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(InsertOutcome::Created(order))
    }

    async fn find_order_by_supplier_order(
        &self,
        supplier_id: Uuid,
        supplier_order_id: &str,
    ) -> Result<Option<Order>, LedgerError> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE supplier_id = $1 AND supplier_order_id = $2",
            ORDER_COLUMNS
        ))
        .bind(supplier_id)
        .bind(supplier_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Order::try_from).transpose()
    }

    async fn orders_for_fulfillment_order(
        &self,
        retailer_id: Uuid,
        retailer_fulfillment_order_id: &str,
    ) -> Result<Vec<Order>, LedgerError> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE retailer_id = $1 AND retailer_fulfillment_order_id = $2 ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .bind(retailer_id)
        .bind(retailer_fulfillment_order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, LedgerError> {
        let row: Option<OrderRow> = sqlx::query_as(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Order::try_from).transpose()
    }

    async fn line_items(&self, order_id: Uuid) -> Result<Vec<OrderLineItem>, LedgerError> {
        let rows: Vec<LineRow> = sqlx::query_as(&format!(
            "SELECT {} FROM order_line_items WHERE order_id = $1 ORDER BY created_at, id",
            LINE_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(OrderLineItem::from).collect())
    }

    async fn update_line_items(
        &self,
        order_id: Uuid,
        mutation: &LineMutation<'_>,
    ) -> Result<LineUpdate, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let update = apply_locked(&mut tx, order_id, mutation).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(update)
    }

    async fn set_payment_status(&self, order_id: Uuid, status: PaymentStatus) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE orders SET payment_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("order {}", order_id)));
        }
        Ok(())
    }

    async fn find_fulfillment(&self, supplier_fulfillment_id: &str) -> Result<Option<Fulfillment>, LedgerError> {
        let row: Option<FulfillmentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM fulfillments WHERE supplier_fulfillment_id = $1",
            FULFILLMENT_COLUMNS
        ))
        .bind(supplier_fulfillment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let lines = fulfillment_lines(&self.pool, row.id).await?;
                Ok(Some(row.into_fulfillment(lines)))
            }
            None => Ok(None),
        }
    }

    async fn record_fulfillment(
        &self,
        order_id: Uuid,
        supplier_fulfillment_id: &str,
        mutation: &LineMutation<'_>,
    ) -> Result<FulfillmentRecord, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_order(&mut tx, order_id).await?;

        let mut fulfillment = Fulfillment {
            id: Uuid::new_v4(),
            order_id,
            supplier_fulfillment_id: supplier_fulfillment_id.to_string(),
            retailer_fulfillment_id: None,
            lines: Vec::new(),
            settled_at: None,
            created_at: Utc::now(),
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO fulfillments (id, order_id, supplier_fulfillment_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (supplier_fulfillment_id) DO NOTHING
            "#,
        )
        .bind(fulfillment.id)
        .bind(order_id)
        .bind(supplier_fulfillment_id)
        .bind(fulfillment.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            let existing = self
                .find_fulfillment(supplier_fulfillment_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("fulfillment {}", supplier_fulfillment_id)))?;
            return Ok(FulfillmentRecord::Existing(existing));
        }

        let update = apply_locked(&mut tx, order_id, mutation).await?;

        for (line, delta) in update.fulfilled_deltas() {
            if delta <= 0 {
                continue;
            }
            sqlx::query("INSERT INTO fulfillment_lines (fulfillment_id, line_item_id, quantity) VALUES ($1, $2, $3)")
                .bind(fulfillment.id)
                .bind(line.id)
                .bind(delta)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            fulfillment.lines.push(FulfilledLine {
                line_id: line.id,
                quantity: delta,
            });
        }

        tx.commit().await.map_err(db_err)?;

        Ok(FulfillmentRecord::Created { fulfillment, update })
    }

    async fn set_retailer_fulfillment(
        &self,
        fulfillment_id: Uuid,
        retailer_fulfillment_id: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE fulfillments SET retailer_fulfillment_id = $2 WHERE id = $1")
            .bind(fulfillment_id)
            .bind(retailer_fulfillment_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_fulfillment(
        &self,
        supplier_fulfillment_id: &str,
        mutation: &LineMutation<'_>,
    ) -> Result<Option<(Fulfillment, LineUpdate)>, LedgerError> {
        let Some(existing) = self.find_fulfillment(supplier_fulfillment_id).await? else {
            return Ok(None);
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_order(&mut tx, existing.order_id).await?;

        // Counted lines go with the row (ON DELETE CASCADE), so read them first.
        let lines = fulfillment_lines(&mut *tx, existing.id).await?;
        let deleted: Option<FulfillmentRow> = sqlx::query_as(&format!(
            "DELETE FROM fulfillments WHERE supplier_fulfillment_id = $1 RETURNING {}",
            FULFILLMENT_COLUMNS
        ))
        .bind(supplier_fulfillment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(deleted) = deleted else {
            // A concurrent cancellation got here first.
            tx.rollback().await.map_err(db_err)?;
            return Ok(None);
        };

        let fulfillment = deleted.into_fulfillment(lines);
        let update = apply_locked(&mut tx, fulfillment.order_id, mutation).await?;
        tx.commit().await.map_err(db_err)?;

        Ok(Some((fulfillment, update)))
    }

    async fn open_settlement(&self, order_id: Uuid) -> Result<Option<SettlementAttempt>, LedgerError> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM settlement_attempts WHERE order_id = $1 AND state = 'OPEN'",
            ATTEMPT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let targets = attempt_targets(&self.pool, row.id).await?;
                row.into_attempt(targets).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn begin_settlement(&self, attempt: &SettlementAttempt) -> Result<bool, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The partial unique index on open attempts turns a second one into a no-op.
        let inserted = sqlx::query(
            r#"
            INSERT INTO settlement_attempts (id, order_id, fulfillment_id, currency, retailer_charge, supplier_payout,
                                             includes_shipping, state, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.order_id)
        .bind(attempt.fulfillment_id)
        .bind(&attempt.currency)
        .bind(attempt.retailer_charge)
        .bind(attempt.supplier_payout)
        .bind(attempt.includes_shipping)
        .bind(SettlementState::Open.as_str())
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        for target in &attempt.targets {
            sqlx::query(
                "INSERT INTO settlement_attempt_lines (attempt_id, line_item_id, paid_from, paid_to) VALUES ($1, $2, $3, $4)",
            )
            .bind(attempt.id)
            .bind(target.line_id)
            .bind(target.paid_from)
            .bind(target.paid_to)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn record_settlement_charge(&self, attempt_id: Uuid, charge_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE settlement_attempts SET charge_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(attempt_id)
            .bind(charge_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("settlement attempt {}", attempt_id)));
        }
        Ok(())
    }

    async fn record_settlement_transfer(&self, attempt_id: Uuid, transfer_id: &str) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE settlement_attempts SET transfer_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(attempt_id)
            .bind(transfer_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("settlement attempt {}", attempt_id)));
        }
        Ok(())
    }

    async fn complete_settlement(
        &self,
        attempt_id: Uuid,
        mutation: &LineMutation<'_>,
    ) -> Result<LineUpdate, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row: Option<(Uuid, Uuid)> = sqlx::query_as(
            "SELECT order_id, fulfillment_id FROM settlement_attempts WHERE id = $1 AND state = 'OPEN' FOR UPDATE",
        )
        .bind(attempt_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let (order_id, fulfillment_id) =
            row.ok_or_else(|| LedgerError::NotFound(format!("open settlement attempt {}", attempt_id)))?;

        let update = apply_locked(&mut tx, order_id, mutation).await?;

        sqlx::query("UPDATE settlement_attempts SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(attempt_id)
            .bind(SettlementState::Completed.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // The shipment may have been cancelled since; then there is nothing to mark.
        sqlx::query("UPDATE fulfillments SET settled_at = NOW() WHERE id = $1")
            .bind(fulfillment_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(update)
    }

    async fn abandon_settlement(&self, attempt_id: Uuid) -> Result<(), LedgerError> {
        sqlx::query("UPDATE settlement_attempts SET state = $2, updated_at = NOW() WHERE id = $1 AND state = 'OPEN'")
            .bind(attempt_id)
            .bind(SettlementState::Abandoned.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn record_processed_webhook(&self, event_id: &str, event_type: &str) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhooks (event_id, event_type, received_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_webhook_processed(&self, event_id: &str) -> Result<bool, LedgerError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT event_id FROM processed_webhooks WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.is_some())
    }
}
