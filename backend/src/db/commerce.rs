use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPool, types::Json, FromRow};

use super::{app_id, db_id};
use crate::error::ProvisioningResult;
use crate::store::{
    BillingDetails, CommerceStore, Customer, CustomerId, Entity, Order, OrderId, OrderItem,
};

#[derive(FromRow)]
struct OrderRow {
    id: i64,
    number: String,
    customer_id: Option<i64>,
    billing: Json<BillingDetails>,
    items: Json<Vec<OrderItem>>,
}

impl OrderRow {
    fn into_order(self) -> ProvisioningResult<Order> {
        Ok(Order {
            id: app_id(self.id)?,
            number: self.number,
            customer_id: self.customer_id.map(app_id).transpose()?,
            billing: self.billing.0,
            items: self.items.0,
        })
    }
}

#[derive(FromRow)]
struct CustomerRow {
    id: i64,
    email: String,
    first_name: String,
    last_name: String,
    company: Option<String>,
}

/// Storefront snapshots and entity metadata kept in Postgres.
#[derive(Clone)]
pub struct PgCommerceStore {
    pool: PgPool,
}

impl PgCommerceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommerceStore for PgCommerceStore {
    async fn order(&self, order_id: OrderId) -> ProvisioningResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"SELECT id, number, customer_id, billing, items
               FROM commerce_orders WHERE id = $1"#,
        )
        .bind(db_id(order_id)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OrderRow::into_order).transpose()
    }

    async fn customer(&self, customer_id: CustomerId) -> ProvisioningResult<Option<Customer>> {
        let row = sqlx::query_as::<_, CustomerRow>(
            r#"SELECT id, email, first_name, last_name, company
               FROM commerce_customers WHERE id = $1"#,
        )
        .bind(db_id(customer_id)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Customer {
                id: app_id(row.id)?,
                email: row.email,
                first_name: row.first_name,
                last_name: row.last_name,
                company: row.company,
            })
        })
        .transpose()
    }

    async fn save_order(&self, order: &Order) -> ProvisioningResult<()> {
        sqlx::query(
            r#"INSERT INTO commerce_orders (id, number, customer_id, billing, items, updated_at)
               VALUES ($1, $2, $3, $4, $5, NOW())
               ON CONFLICT (id) DO UPDATE SET
                   number = EXCLUDED.number,
                   customer_id = EXCLUDED.customer_id,
                   billing = EXCLUDED.billing,
                   items = EXCLUDED.items,
                   updated_at = NOW()"#,
        )
        .bind(db_id(order.id)?)
        .bind(&order.number)
        .bind(order.customer_id.map(db_id).transpose()?)
        .bind(Json(&order.billing))
        .bind(Json(&order.items))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_customer(&self, customer: &Customer) -> ProvisioningResult<()> {
        sqlx::query(
            r#"INSERT INTO commerce_customers (id, email, first_name, last_name, company, updated_at)
               VALUES ($1, $2, $3, $4, $5, NOW())
               ON CONFLICT (id) DO UPDATE SET
                   email = EXCLUDED.email,
                   first_name = EXCLUDED.first_name,
                   last_name = EXCLUDED.last_name,
                   company = EXCLUDED.company,
                   updated_at = NOW()"#,
        )
        .bind(db_id(customer.id)?)
        .bind(&customer.email)
        .bind(&customer.first_name)
        .bind(&customer.last_name)
        .bind(&customer.company)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_meta(&self, entity: Entity, key: &str) -> ProvisioningResult<Option<Value>> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"SELECT meta_value FROM entity_meta
               WHERE entity_kind = $1 AND entity_id = $2 AND meta_key = $3"#,
        )
        .bind(entity.kind())
        .bind(db_id(entity.id())?)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set_meta(&self, entity: Entity, key: &str, value: Value) -> ProvisioningResult<()> {
        sqlx::query(
            r#"INSERT INTO entity_meta (entity_kind, entity_id, meta_key, meta_value, updated_at)
               VALUES ($1, $2, $3, $4, NOW())
               ON CONFLICT (entity_kind, entity_id, meta_key)
               DO UPDATE SET meta_value = EXCLUDED.meta_value, updated_at = NOW()"#,
        )
        .bind(entity.kind())
        .bind(db_id(entity.id())?)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_meta(&self, entity: Entity, key: &str) -> ProvisioningResult<bool> {
        let result = sqlx::query(
            r#"DELETE FROM entity_meta
               WHERE entity_kind = $1 AND entity_id = $2 AND meta_key = $3"#,
        )
        .bind(entity.kind())
        .bind(db_id(entity.id())?)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
