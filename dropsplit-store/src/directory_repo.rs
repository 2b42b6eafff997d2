use async_trait::async_trait;
use dropsplit_core::directory::{DirectoryError, ImportedVariant, PartnerDirectory, PartnerRole, PaymentProfile, StoreAccount};
use dropsplit_shared::Masked;
use sqlx::PgPool;
use uuid::Uuid;

pub struct PgPartnerDirectory {
    pool: PgPool,
}

impl PgPartnerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> DirectoryError {
    DirectoryError::Database(e.to_string())
}

#[derive(sqlx::FromRow)]
struct StoreRow {
    id: Uuid,
    shop_domain: String,
    access_token: String,
    role: String,
    dropship_location_id: Option<String>,
}

impl TryFrom<StoreRow> for StoreAccount {
    type Error = DirectoryError;

    fn try_from(row: StoreRow) -> Result<Self, Self::Error> {
        let role = match row.role.as_str() {
            "retailer" => PartnerRole::Retailer,
            "supplier" => PartnerRole::Supplier,
            other => return Err(DirectoryError::Database(format!("unknown store role {}", other))),
        };

        Ok(StoreAccount {
            id: row.id,
            shop_domain: row.shop_domain,
            access_token: Masked::new(row.access_token),
            role,
            dropship_location_id: row.dropship_location_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VariantRow {
    retailer_variant_id: String,
    supplier_id: Uuid,
    supplier_variant_id: String,
    price_list_id: Option<Uuid>,
    retail_price: i64,
    retailer_profit: i64,
    supplier_profit: i64,
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    connected_account_id: Option<String>,
    payouts_enabled: bool,
    customer_id: Option<String>,
    default_payment_method_id: Option<String>,
}

#[async_trait]
impl PartnerDirectory for PgPartnerDirectory {
    async fn store_by_domain(&self, shop_domain: &str) -> Result<Option<StoreAccount>, DirectoryError> {
        let row: Option<StoreRow> = sqlx::query_as(
            "SELECT id, shop_domain, access_token, role, dropship_location_id FROM stores WHERE shop_domain = $1",
        )
        .bind(shop_domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(StoreAccount::try_from).transpose()
    }

    async fn store_by_id(&self, store_id: Uuid) -> Result<Option<StoreAccount>, DirectoryError> {
        let row: Option<StoreRow> = sqlx::query_as(
            "SELECT id, shop_domain, access_token, role, dropship_location_id FROM stores WHERE id = $1",
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(StoreAccount::try_from).transpose()
    }

    async fn has_imported_variants(&self, retailer_id: Uuid, variant_ids: &[String]) -> Result<bool, DirectoryError> {
        if variant_ids.is_empty() {
            return Ok(false);
        }

        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM imported_variants
                WHERE retailer_id = $1 AND retailer_variant_id = ANY($2)
            )
            "#,
        )
        .bind(retailer_id)
        .bind(variant_ids)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(exists)
    }

    async fn imported_variants(
        &self,
        retailer_id: Uuid,
        variant_ids: &[String],
    ) -> Result<Vec<ImportedVariant>, DirectoryError> {
        let rows: Vec<VariantRow> = sqlx::query_as(
            r#"
            SELECT retailer_variant_id, supplier_id, supplier_variant_id, price_list_id,
                   retail_price, retailer_profit, supplier_profit
            FROM imported_variants
            WHERE retailer_id = $1 AND retailer_variant_id = ANY($2)
            "#,
        )
        .bind(retailer_id)
        .bind(variant_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| ImportedVariant {
                retailer_variant_id: r.retailer_variant_id,
                supplier_id: r.supplier_id,
                supplier_variant_id: r.supplier_variant_id,
                price_list_id: r.price_list_id,
                retail_price: r.retail_price,
                retailer_profit: r.retailer_profit,
                supplier_profit: r.supplier_profit,
            })
            .collect())
    }

    async fn payment_profile(&self, store_id: Uuid) -> Result<Option<PaymentProfile>, DirectoryError> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT connected_account_id, payouts_enabled, customer_id, default_payment_method_id
            FROM payment_accounts WHERE store_id = $1
            "#,
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| PaymentProfile {
            connected_account_id: r.connected_account_id,
            payouts_enabled: r.payouts_enabled,
            customer_id: r.customer_id,
            default_payment_method_id: r.default_payment_method_id,
        }))
    }

    async fn update_account_capabilities(
        &self,
        connected_account_id: &str,
        payouts_enabled: bool,
    ) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            "UPDATE payment_accounts SET payouts_enabled = $2, updated_at = NOW() WHERE connected_account_id = $1",
        )
        .bind(connected_account_id)
        .bind(payouts_enabled)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn disconnect_account(&self, connected_account_id: &str) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_accounts
            SET connected_account_id = NULL, payouts_enabled = FALSE, updated_at = NOW()
            WHERE connected_account_id = $1
            "#,
        )
        .bind(connected_account_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            "UPDATE payment_accounts SET default_payment_method_id = $2, updated_at = NOW() WHERE customer_id = $1",
        )
        .bind(customer_id)
        .bind(payment_method_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn detach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_accounts
            SET default_payment_method_id = NULL, updated_at = NOW()
            WHERE customer_id = $1 AND default_payment_method_id = $2
            "#,
        )
        .bind(customer_id)
        .bind(payment_method_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}
