//! Maps billing events onto queued jobs.
//!
//! Events may carry the storefront's order or customer snapshot; it is saved
//! before routing so the workers read the same data the storefront sent.
//! Routing never talks to the remote API directly except for billing address
//! changes, which are pushed synchronously through the linker.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config_store::ConfigStore;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::job_queue::{Job, JobId, JobQueue};
use crate::linker::CustomerLinker;
use crate::models::ServiceStatus;
use crate::store::{
    meta, CommerceStore, Customer, CustomerId, Entity, Order, OrderId, ProvisioningRecord,
};
use crate::telemetry::{LogContext, LogSink};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    #[serde(default)]
    pub parent_order_id: Option<OrderId>,
    #[serde(default)]
    pub billing_email: Option<String>,
}

/// Order as pushed by the storefront, with the domain picked at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    #[serde(flatten)]
    pub order: Order,
    #[serde(default)]
    pub hosting_domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BillingEvent {
    OrderCompleted {
        order_id: OrderId,
        #[serde(default)]
        order: Option<OrderSnapshot>,
    },
    PaymentFailed {
        subscription: Subscription,
    },
    PaymentSucceeded {
        subscription: Subscription,
    },
    SubscriptionCancelled {
        subscription: Subscription,
    },
    SubscriptionExpired {
        subscription: Subscription,
    },
    CustomerAddressChanged {
        customer_id: CustomerId,
        address_type: String,
        #[serde(default)]
        customer: Option<Customer>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RouteOutcome {
    Enqueued(JobId),
    Skipped(String),
    /// The queue already holds an equivalent job.
    Refused(String),
    ProfileSynced,
}

pub struct EventRouter {
    queue: Arc<JobQueue>,
    linker: Arc<CustomerLinker>,
    config: Arc<dyn ConfigStore>,
    store: Arc<dyn CommerceStore>,
    log: Arc<dyn LogSink>,
}

impl EventRouter {
    pub fn new(
        queue: Arc<JobQueue>,
        linker: Arc<CustomerLinker>,
        config: Arc<dyn ConfigStore>,
        store: Arc<dyn CommerceStore>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            queue,
            linker,
            config,
            store,
            log,
        }
    }

    pub async fn route(&self, event: &BillingEvent) -> ProvisioningResult<RouteOutcome> {
        self.save_snapshots(event).await?;
        match event {
            BillingEvent::OrderCompleted { order_id, .. } => {
                self.order_completed(*order_id).await
            }
            BillingEvent::PaymentFailed { subscription } => {
                self.subscription_event("payment_failed", subscription, |order_id, record| {
                    record.service_id.map(|service_id| Job::Suspend {
                        order_id,
                        service_id,
                    })
                })
                .await
            }
            BillingEvent::PaymentSucceeded { subscription } => {
                self.subscription_event("payment_complete", subscription, |order_id, record| {
                    match (record.service_id, record.status) {
                        (Some(service_id), Some(ServiceStatus::Suspended)) => {
                            Some(Job::Unsuspend {
                                order_id,
                                service_id,
                            })
                        }
                        _ => None,
                    }
                })
                .await
            }
            BillingEvent::SubscriptionCancelled { subscription }
            | BillingEvent::SubscriptionExpired { subscription } => {
                self.subscription_event(
                    "subscription_cancelled",
                    subscription,
                    |order_id, record| {
                        record.service_id.map(|service_id| Job::Cancel {
                            order_id,
                            service_id,
                        })
                    },
                )
                .await
            }
            BillingEvent::CustomerAddressChanged {
                customer_id,
                address_type,
                ..
            } => self.address_changed(*customer_id, address_type).await,
        }
    }

    /// Persists the snapshots an event carries. A snapshot for a different id
    /// than the event names is refused.
    async fn save_snapshots(&self, event: &BillingEvent) -> ProvisioningResult<()> {
        match event {
            BillingEvent::OrderCompleted {
                order_id,
                order: Some(snapshot),
            } => {
                if snapshot.order.id != *order_id {
                    return Err(ProvisioningError::validation(
                        "order snapshot does not match order_id",
                    ));
                }
                self.store.save_order(&snapshot.order).await?;
                let domain = snapshot
                    .hosting_domain
                    .as_deref()
                    .map(str::trim)
                    .filter(|domain| !domain.is_empty());
                if let Some(domain) = domain {
                    self.store
                        .set_meta(
                            Entity::Order(*order_id),
                            meta::HOSTING_DOMAIN,
                            Value::String(domain.to_string()),
                        )
                        .await?;
                }
                self.log.debug(
                    "Order snapshot saved",
                    LogContext::event("order_completed")
                        .order(*order_id)
                        .status("saved"),
                );
            }
            BillingEvent::CustomerAddressChanged {
                customer_id,
                customer: Some(customer),
                ..
            } => {
                if customer.id != *customer_id {
                    return Err(ProvisioningError::validation(
                        "customer snapshot does not match customer_id",
                    ));
                }
                self.store.save_customer(customer).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn order_completed(&self, order_id: OrderId) -> ProvisioningResult<RouteOutcome> {
        let Some(order) = self.store.order(order_id).await? else {
            return Ok(RouteOutcome::Skipped("order not found".into()));
        };
        let context = LogContext::event("order_completed")
            .order(order_id)
            .email(&order.billing.email);
        self.log
            .info("Order completed event received", context.clone());

        let mut has_hosting_product = false;
        for item in &order.items {
            let mapping = self.config.product_mapping(item.product_id).await?;
            if mapping.map_or(false, |mapping| mapping.auto_provision) {
                has_hosting_product = true;
                break;
            }
        }
        if !has_hosting_product {
            self.log.debug(
                "Order does not contain hosting products",
                context.status("skipped"),
            );
            return Ok(RouteOutcome::Skipped(
                "no auto-provisioned hosting product".into(),
            ));
        }

        Ok(self.enqueue(Job::Provision { order_id }, context).await)
    }

    async fn subscription_event(
        &self,
        event_type: &str,
        subscription: &Subscription,
        job_for: impl FnOnce(OrderId, ProvisioningRecord) -> Option<Job>,
    ) -> ProvisioningResult<RouteOutcome> {
        let mut context =
            LogContext::event(event_type).field("subscription_id", subscription.id);
        if let Some(email) = subscription.billing_email.as_deref() {
            context = context.email(email);
        }
        self.log
            .info("Subscription event received", context.clone());

        let parent = match subscription.parent_order_id {
            Some(order_id) if self.store.order(order_id).await?.is_some() => Some(order_id),
            _ => None,
        };
        let Some(order_id) = parent else {
            self.log
                .debug("Subscription has no parent order", context.status("skipped"));
            return Ok(RouteOutcome::Skipped("parent order not found".into()));
        };
        let context = context.order(order_id);

        let record = ProvisioningRecord::load(self.store.as_ref(), order_id).await?;
        if record.service_id.is_none() {
            self.log.warning(
                "No service ID found for subscription",
                context.status("skipped"),
            );
            return Ok(RouteOutcome::Skipped(
                "no service provisioned for order".into(),
            ));
        }

        match job_for(order_id, record) {
            Some(job) => Ok(self.enqueue(job, context).await),
            None => {
                self.log
                    .debug("Service state needs no change", context.status("skipped"));
                Ok(RouteOutcome::Skipped("service state needs no change".into()))
            }
        }
    }

    async fn address_changed(
        &self,
        customer_id: CustomerId,
        address_type: &str,
    ) -> ProvisioningResult<RouteOutcome> {
        if address_type != "billing" {
            return Ok(RouteOutcome::Skipped(format!(
                "{address_type} address is not synced"
            )));
        }
        self.log.debug(
            "Customer address changed",
            LogContext::event("customer_update").field("customer_id", customer_id),
        );
        if self.linker.linked_account(customer_id).await?.is_none() {
            return Ok(RouteOutcome::Skipped("customer not linked".into()));
        }
        self.linker.sync_customer_profile(customer_id).await?;
        Ok(RouteOutcome::ProfileSynced)
    }

    async fn enqueue(&self, job: Job, context: LogContext) -> RouteOutcome {
        match self.queue.enqueue(job).await {
            Ok(job_id) => RouteOutcome::Enqueued(job_id),
            Err(ProvisioningError::Duplicate(reason)) => RouteOutcome::Refused(reason),
            Err(err) => {
                self.log.error(
                    "Failed to enqueue job",
                    context.status("failed").field("error", err.to_string()),
                );
                RouteOutcome::Refused(err.to_string())
            }
        }
    }
}
