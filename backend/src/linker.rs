use std::sync::Arc;

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

use crate::client::HostingApi;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::models::{NewUser, RemoteId, UserUpdate};
use crate::store::{meta, BillingDetails, CommerceStore, Customer, CustomerId, Entity};
use crate::telemetry::{LogContext, LogSink};

const PASSWORD_LENGTH: usize = 16;
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+[]{}";

/// Who a remote account is created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
}

impl AccountIdentity {
    pub fn from_customer(customer: &Customer) -> Self {
        Self {
            email: customer.email.trim().to_string(),
            first_name: customer.first_name.clone(),
            last_name: customer.last_name.clone(),
            company: non_empty(customer.company.as_deref()),
        }
    }

    pub fn from_billing(billing: &BillingDetails) -> Self {
        Self {
            email: billing.email.trim().to_string(),
            first_name: billing.first_name.clone(),
            last_name: billing.last_name.clone(),
            company: non_empty(billing.company.as_deref()),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Keeps the link between local customers and remote panel accounts.
pub struct CustomerLinker {
    api: Arc<dyn HostingApi>,
    store: Arc<dyn CommerceStore>,
    log: Arc<dyn LogSink>,
}

impl CustomerLinker {
    pub fn new(
        api: Arc<dyn HostingApi>,
        store: Arc<dyn CommerceStore>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self { api, store, log }
    }

    pub async fn linked_account(
        &self,
        customer_id: CustomerId,
    ) -> ProvisioningResult<Option<RemoteId>> {
        let value = self
            .store
            .get_meta(Entity::Customer(customer_id), meta::REMOTE_ACCOUNT)
            .await?;
        Ok(value.and_then(|value| serde_json::from_value(value).ok()))
    }

    pub async fn link_customer(
        &self,
        customer_id: CustomerId,
        account_id: &RemoteId,
    ) -> ProvisioningResult<()> {
        self.store
            .set_meta(
                Entity::Customer(customer_id),
                meta::REMOTE_ACCOUNT,
                Value::from(account_id),
            )
            .await?;
        self.log.info(
            "Linked customer to remote account",
            LogContext::event("customer_sync")
                .field("customer_id", customer_id)
                .field("remote_user_id", account_id),
        );
        Ok(())
    }

    pub async fn unlink_customer(&self, customer_id: CustomerId) -> ProvisioningResult<bool> {
        let removed = self
            .store
            .delete_meta(Entity::Customer(customer_id), meta::REMOTE_ACCOUNT)
            .await?;
        self.log.info(
            "Unlinked customer from remote account",
            LogContext::event("customer_sync").field("customer_id", customer_id),
        );
        Ok(removed)
    }

    /// Returns the linked account, or finds/creates one by the customer's email
    /// and links it.
    pub async fn get_or_create_account(
        &self,
        customer_id: CustomerId,
    ) -> ProvisioningResult<RemoteId> {
        if let Some(account_id) = self.linked_account(customer_id).await? {
            return Ok(account_id);
        }
        let customer = self
            .store
            .customer(customer_id)
            .await?
            .ok_or_else(|| ProvisioningError::validation("customer not found"))?;
        self.resolve(&AccountIdentity::from_customer(&customer), Some(customer_id))
            .await
    }

    /// Same as [`get_or_create_account`](Self::get_or_create_account) for orders
    /// that may belong to a guest. The link is only persisted when a customer
    /// id is known.
    pub async fn ensure_account(
        &self,
        identity: &AccountIdentity,
        customer_id: Option<CustomerId>,
    ) -> ProvisioningResult<RemoteId> {
        if let Some(customer_id) = customer_id {
            if let Some(account_id) = self.linked_account(customer_id).await? {
                return Ok(account_id);
            }
        }
        self.resolve(identity, customer_id).await
    }

    async fn resolve(
        &self,
        identity: &AccountIdentity,
        customer_id: Option<CustomerId>,
    ) -> ProvisioningResult<RemoteId> {
        if identity.email.is_empty() {
            return Err(ProvisioningError::validation("customer email not found"));
        }

        let mut context = LogContext::event("customer_sync").email(&identity.email);
        if let Some(customer_id) = customer_id {
            context = context.field("customer_id", customer_id);
        }

        match self.api.get_user_by_email(&identity.email).await {
            Ok(existing) => {
                self.persist_link(customer_id, &existing.id).await?;
                self.log.info(
                    "Linked existing remote user",
                    context.field("remote_user_id", &existing.id),
                );
                return Ok(existing.id);
            }
            Err(ProvisioningError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let new_user = NewUser {
            email: identity.email.clone(),
            password: generate_password(PASSWORD_LENGTH),
            first_name: identity.first_name.clone(),
            last_name: identity.last_name.clone(),
            company: non_empty(identity.company.as_deref()),
        };
        let created = match self.api.create_user(&new_user).await {
            Ok(created) => created,
            Err(err) => {
                self.log.error(
                    "Failed to create remote user",
                    context.status("failed").field("error", err.to_string()),
                );
                return Err(err);
            }
        };

        self.persist_link(customer_id, &created.id).await?;
        self.log.info(
            "Created and linked remote user",
            context.field("remote_user_id", &created.id),
        );
        Ok(created.id)
    }

    async fn persist_link(
        &self,
        customer_id: Option<CustomerId>,
        account_id: &RemoteId,
    ) -> ProvisioningResult<()> {
        let Some(customer_id) = customer_id else {
            return Ok(());
        };
        self.store
            .set_meta(
                Entity::Customer(customer_id),
                meta::REMOTE_ACCOUNT,
                Value::from(account_id),
            )
            .await
    }

    /// Pushes name and company of a linked customer to the remote account. A
    /// blank company is sent as an empty string so the remote value is cleared.
    pub async fn sync_customer_profile(&self, customer_id: CustomerId) -> ProvisioningResult<()> {
        let account_id = self
            .linked_account(customer_id)
            .await?
            .ok_or_else(|| ProvisioningError::validation("customer not linked"))?;
        let customer = self
            .store
            .customer(customer_id)
            .await?
            .ok_or_else(|| ProvisioningError::validation("customer not found"))?;

        let update = UserUpdate {
            first_name: Some(customer.first_name.clone()),
            last_name: Some(customer.last_name.clone()),
            company: Some(non_empty(customer.company.as_deref()).unwrap_or_default()),
        };
        let context = LogContext::event("customer_sync")
            .field("customer_id", customer_id)
            .field("remote_user_id", &account_id);

        match self.api.update_user(&account_id, &update).await {
            Ok(()) => {
                self.log
                    .info("Customer profile synced", context.status("success"));
                Ok(())
            }
            Err(err) => {
                self.log.error(
                    "Failed to sync customer profile",
                    context.status("failed").field("error", err.to_string()),
                );
                Err(err)
            }
        }
    }
}

/// Random password with at least one character from every class.
pub fn generate_password(length: usize) -> String {
    let classes = [LOWER, UPPER, DIGITS, SYMBOLS];
    let length = length.max(classes.len());
    let alphabet: Vec<u8> = classes.concat();

    let mut rng = OsRng;
    let mut password: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();
    while password.len() < length {
        password.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    password.shuffle(&mut rng);
    password.into_iter().map(char::from).collect()
}
