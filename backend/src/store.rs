use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProvisioningResult;
use crate::models::{RemoteId, ServiceStatus};

pub type OrderId = u64;
pub type CustomerId = u64;
pub type ProductId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingDetails {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub number: String,
    /// `None` for guest checkouts.
    pub customer_id: Option<CustomerId>,
    pub billing: BillingDetails,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Order(OrderId),
    Customer(CustomerId),
}

impl Entity {
    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Order(_) => "order",
            Entity::Customer(_) => "customer",
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Entity::Order(id) | Entity::Customer(id) => *id,
        }
    }
}

/// Metadata keys written on orders and customers.
pub mod meta {
    pub const PROCESSED: &str = "provisioning_processed";
    pub const STATUS: &str = "provisioning_status";
    pub const SERVICE_ID: &str = "provisioning_service_id";
    pub const ACCOUNT_ID: &str = "provisioning_account_id";
    pub const PROCESSED_DATE: &str = "provisioning_processed_date";
    pub const CREDENTIALS: &str = "provisioning_credentials_encrypted";
    /// Set by checkout when the customer picked a domain.
    pub const HOSTING_DOMAIN: &str = "hosting_domain";
    /// Customer-level link to the remote account.
    pub const REMOTE_ACCOUNT: &str = "remote_account_id";
}

/// Order and customer data pushed by the storefront, plus the metadata the
/// provisioning workflow keeps on both.
#[async_trait]
pub trait CommerceStore: Send + Sync {
    async fn order(&self, order_id: OrderId) -> ProvisioningResult<Option<Order>>;

    async fn customer(&self, customer_id: CustomerId) -> ProvisioningResult<Option<Customer>>;

    /// Inserts or replaces an order snapshot. Metadata is left untouched.
    async fn save_order(&self, order: &Order) -> ProvisioningResult<()>;

    async fn save_customer(&self, customer: &Customer) -> ProvisioningResult<()>;

    async fn get_meta(&self, entity: Entity, key: &str) -> ProvisioningResult<Option<Value>>;

    async fn set_meta(&self, entity: Entity, key: &str, value: Value) -> ProvisioningResult<()>;

    async fn delete_meta(&self, entity: Entity, key: &str) -> ProvisioningResult<bool>;
}

/// Process-local store used by tests and the route fixtures.
#[derive(Default)]
pub struct InMemoryCommerceStore {
    orders: DashMap<OrderId, Order>,
    customers: DashMap<CustomerId, Customer>,
    metadata: DashMap<(Entity, String), Value>,
}

impl InMemoryCommerceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_order(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    pub fn insert_customer(&self, customer: Customer) {
        self.customers.insert(customer.id, customer);
    }
}

#[async_trait]
impl CommerceStore for InMemoryCommerceStore {
    async fn order(&self, order_id: OrderId) -> ProvisioningResult<Option<Order>> {
        Ok(self.orders.get(&order_id).map(|entry| entry.clone()))
    }

    async fn customer(&self, customer_id: CustomerId) -> ProvisioningResult<Option<Customer>> {
        Ok(self.customers.get(&customer_id).map(|entry| entry.clone()))
    }

    async fn save_order(&self, order: &Order) -> ProvisioningResult<()> {
        self.insert_order(order.clone());
        Ok(())
    }

    async fn save_customer(&self, customer: &Customer) -> ProvisioningResult<()> {
        self.insert_customer(customer.clone());
        Ok(())
    }

    async fn get_meta(&self, entity: Entity, key: &str) -> ProvisioningResult<Option<Value>> {
        Ok(self
            .metadata
            .get(&(entity, key.to_string()))
            .map(|entry| entry.clone()))
    }

    async fn set_meta(&self, entity: Entity, key: &str, value: Value) -> ProvisioningResult<()> {
        self.metadata.insert((entity, key.to_string()), value);
        Ok(())
    }

    async fn delete_meta(&self, entity: Entity, key: &str) -> ProvisioningResult<bool> {
        Ok(self.metadata.remove(&(entity, key.to_string())).is_some())
    }
}

/// Provisioning state persisted on an order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisioningRecord {
    pub processed: bool,
    pub status: Option<ServiceStatus>,
    pub service_id: Option<RemoteId>,
    pub remote_account_id: Option<RemoteId>,
    pub processed_date: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub credentials_encrypted: Option<String>,
    pub has_credentials: bool,
}

impl ProvisioningRecord {
    pub async fn load(store: &dyn CommerceStore, order_id: OrderId) -> ProvisioningResult<Self> {
        let entity = Entity::Order(order_id);
        let processed = read_meta(store, entity, meta::PROCESSED).await?;
        let status = read_meta(store, entity, meta::STATUS).await?;
        let service_id = read_meta(store, entity, meta::SERVICE_ID).await?;
        let account_id = read_meta(store, entity, meta::ACCOUNT_ID).await?;
        let processed_date = read_meta(store, entity, meta::PROCESSED_DATE).await?;
        let credentials = read_meta(store, entity, meta::CREDENTIALS).await?;

        let credentials_encrypted = credentials
            .and_then(|value| value.as_str().map(str::to_string))
            .filter(|value| !value.is_empty());

        Ok(Self {
            processed: processed.and_then(|value| value.as_bool()).unwrap_or(false),
            status: status.and_then(|value| serde_json::from_value(value).ok()),
            service_id: service_id.and_then(|value| serde_json::from_value(value).ok()),
            remote_account_id: account_id.and_then(|value| serde_json::from_value(value).ok()),
            processed_date: processed_date.and_then(|value| serde_json::from_value(value).ok()),
            has_credentials: credentials_encrypted.is_some(),
            credentials_encrypted,
        })
    }
}

async fn read_meta(
    store: &dyn CommerceStore,
    entity: Entity,
    key: &str,
) -> ProvisioningResult<Option<Value>> {
    Ok(store
        .get_meta(entity, key)
        .await?
        .filter(|value| !value.is_null()))
}

pub async fn set_order_status(
    store: &dyn CommerceStore,
    order_id: OrderId,
    status: &ServiceStatus,
) -> ProvisioningResult<()> {
    store
        .set_meta(
            Entity::Order(order_id),
            meta::STATUS,
            Value::String(status.as_str().to_string()),
        )
        .await
}
