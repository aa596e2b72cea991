//! Provisioning workflow for a completed order.
//!
//! ```text
//! unprocessed -> mapping_validated -> account_ensured -> service_created
//!             -> polling -> credentials_saved -> completed
//! ```
//!
//! Every failure after the service exists cancels it once (best effort) and
//! marks the order `failed`. The `processed` latch is the last thing written,
//! so a second run on a completed order is refused as a duplicate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{sleep, Instant};

use crate::client::HostingApi;
use crate::config_store::{ConfigStore, ProductMapping};
use crate::crypto::CredentialCipher;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::linker::{AccountIdentity, CustomerLinker};
use crate::mail::Mailer;
use crate::models::{NewService, RemoteId, ServiceCredentials, ServiceStatus};
use crate::store::{
    meta, set_order_status, CommerceStore, Entity, Order, OrderId, ProvisioningRecord,
};
use crate::telemetry::{LogContext, LogSink};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

static DOMAIN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z0-9][a-z0-9-]{0,61}[a-z0-9]$")
        .expect("domain pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStage {
    Unprocessed,
    MappingValidated,
    AccountEnsured,
    ServiceCreated,
    Polling,
    CredentialsSaved,
    Completed,
}

impl ProvisioningStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStage::Unprocessed => "unprocessed",
            ProvisioningStage::MappingValidated => "mapping_validated",
            ProvisioningStage::AccountEnsured => "account_ensured",
            ProvisioningStage::ServiceCreated => "service_created",
            ProvisioningStage::Polling => "polling",
            ProvisioningStage::CredentialsSaved => "credentials_saved",
            ProvisioningStage::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisioningOutcome {
    pub order_id: OrderId,
    pub service_id: RemoteId,
    pub account_id: RemoteId,
    pub plan_id: String,
    pub domain: String,
    pub credentials: ServiceCredentials,
    pub email_sent: bool,
}

/// Caller of an audited admin operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub role: String,
}

impl Actor {
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: "admin".to_string(),
        }
    }

    fn is_admin(&self) -> bool {
        self.role == "admin" && !self.id.is_empty()
    }
}

pub struct Orchestrator {
    api: Arc<dyn HostingApi>,
    linker: Arc<CustomerLinker>,
    config: Arc<dyn ConfigStore>,
    store: Arc<dyn CommerceStore>,
    cipher: Arc<dyn CredentialCipher>,
    mailer: Arc<dyn Mailer>,
    log: Arc<dyn LogSink>,
    site_name: String,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        api: Arc<dyn HostingApi>,
        linker: Arc<CustomerLinker>,
        config: Arc<dyn ConfigStore>,
        store: Arc<dyn CommerceStore>,
        cipher: Arc<dyn CredentialCipher>,
        mailer: Arc<dyn Mailer>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            api,
            linker,
            config,
            store,
            cipher,
            mailer,
            log,
            site_name: "Hosting".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_site_name(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = site_name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_secs(1));
        self
    }

    fn context(order_id: OrderId, stage: ProvisioningStage) -> LogContext {
        LogContext::event("provisioning")
            .order(order_id)
            .field("stage", stage.as_str())
    }

    pub async fn provision_hosting(
        &self,
        order_id: OrderId,
    ) -> ProvisioningResult<ProvisioningOutcome> {
        let order = self
            .store
            .order(order_id)
            .await?
            .ok_or_else(|| ProvisioningError::validation("order not found"))?;
        let email = order.billing.email.trim().to_string();

        self.log.info(
            "Starting provisioning workflow",
            Self::context(order_id, ProvisioningStage::Unprocessed)
                .status("started")
                .email(&email),
        );

        if ProvisioningRecord::load(self.store.as_ref(), order_id)
            .await?
            .processed
        {
            self.log.warning(
                "Order already processed",
                Self::context(order_id, ProvisioningStage::Unprocessed)
                    .status("duplicate")
                    .field("reason", "already_processed"),
            );
            return Err(ProvisioningError::duplicate("order already processed"));
        }

        let Some(mapping) = self.resolve_mapping(&order).await? else {
            self.log.error(
                "No product mapping found",
                Self::context(order_id, ProvisioningStage::Unprocessed)
                    .status("failed")
                    .field("reason", "no_mapping"),
            );
            return Err(ProvisioningError::validation(
                "product not mapped to a hosting plan",
            ));
        };

        let identity = AccountIdentity::from_billing(&order.billing);
        let account_id = match self.linker.ensure_account(&identity, order.customer_id).await {
            Ok(account_id) => account_id,
            Err(err) => {
                self.log.error(
                    "Could not ensure remote account",
                    Self::context(order_id, ProvisioningStage::MappingValidated)
                        .status("failed")
                        .email(&email)
                        .field("error", err.to_string()),
                );
                return Err(err);
            }
        };

        let Some(domain) = self.resolve_domain(&order).await? else {
            self.log.error(
                "Domain not specified in order",
                Self::context(order_id, ProvisioningStage::AccountEnsured)
                    .status("failed")
                    .field("reason", "no_domain"),
            );
            return Err(ProvisioningError::validation("domain not specified in order"));
        };

        let new_service = NewService {
            user_id: account_id.clone(),
            plan_id: mapping.plan_id.clone(),
            domain: domain.clone(),
        };
        let service = match self.api.create_service(&new_service).await {
            Ok(service) => service,
            Err(err) => {
                self.log.error(
                    "Service creation failed",
                    Self::context(order_id, ProvisioningStage::AccountEnsured)
                        .status("failed")
                        .field("error", err.to_string()),
                );
                return Err(err);
            }
        };
        let service_id = service.id;

        let entity = Entity::Order(order_id);
        let recorded = self.record_service(order_id, &service_id, &account_id).await;
        if let Err(err) = recorded {
            self.roll_back(order_id, &service_id, &err).await;
            return Err(err);
        }
        self.log.info(
            "Service created",
            Self::context(order_id, ProvisioningStage::ServiceCreated)
                .status("service_created")
                .field("service_id", &service_id)
                .field("user_id", &account_id),
        );

        let credentials = match self.wait_for_provisioning(order_id, &service_id).await {
            Ok(credentials) => credentials,
            Err(err) => {
                self.roll_back(order_id, &service_id, &err).await;
                return Err(err);
            }
        };

        // Nothing is stored unless the credentials can be sealed, so the
        // service is cancelled like any other post-creation failure.
        let sealed = serde_json::to_string(&credentials)
            .map_err(|err| ProvisioningError::Crypto(err.to_string()))
            .and_then(|payload| self.cipher.encrypt(&payload));
        let saved = match sealed {
            Ok(sealed) => self.save_credentials(order_id, sealed).await,
            Err(err) => {
                self.log.error(
                    "Could not encrypt service credentials",
                    Self::context(order_id, ProvisioningStage::Polling)
                        .status("failed")
                        .field("service_id", &service_id)
                        .field("error", err.to_string()),
                );
                Err(err)
            }
        };
        if let Err(err) = saved {
            self.roll_back(order_id, &service_id, &err).await;
            return Err(err);
        }
        self.log.info(
            "Credentials retrieved and saved",
            Self::context(order_id, ProvisioningStage::CredentialsSaved)
                .status("credentials_saved")
                .field("service_id", &service_id),
        );

        let email_sent = self
            .send_credentials_email(&order, &credentials, &domain)
            .await;
        if email_sent {
            self.log.info(
                "Credentials email sent",
                Self::context(order_id, ProvisioningStage::CredentialsSaved)
                    .status("email_sent")
                    .email(&email),
            );
        } else {
            self.log.warning(
                "Failed to send credentials email",
                Self::context(order_id, ProvisioningStage::CredentialsSaved)
                    .status("email_failed")
                    .email(&email),
            );
        }

        self.store
            .set_meta(entity, meta::PROCESSED, Value::Bool(true))
            .await?;
        self.store
            .set_meta(
                entity,
                meta::PROCESSED_DATE,
                Value::String(Utc::now().to_rfc3339()),
            )
            .await?;
        self.log.info(
            "Provisioning workflow completed",
            Self::context(order_id, ProvisioningStage::Completed)
                .status("completed")
                .field("service_id", &service_id),
        );

        Ok(ProvisioningOutcome {
            order_id,
            service_id,
            account_id,
            plan_id: mapping.plan_id,
            domain,
            credentials,
            email_sent,
        })
    }

    async fn record_service(
        &self,
        order_id: OrderId,
        service_id: &RemoteId,
        account_id: &RemoteId,
    ) -> ProvisioningResult<()> {
        let entity = Entity::Order(order_id);
        self.store
            .set_meta(entity, meta::SERVICE_ID, Value::from(service_id))
            .await?;
        self.store
            .set_meta(entity, meta::ACCOUNT_ID, Value::from(account_id))
            .await?;
        set_order_status(self.store.as_ref(), order_id, &ServiceStatus::Provisioning).await
    }

    async fn save_credentials(&self, order_id: OrderId, sealed: String) -> ProvisioningResult<()> {
        self.store
            .set_meta(Entity::Order(order_id), meta::CREDENTIALS, Value::String(sealed))
            .await?;
        set_order_status(self.store.as_ref(), order_id, &ServiceStatus::Active).await
    }

    /// First line item with an auto-provisioned mapping, in item order.
    async fn resolve_mapping(&self, order: &Order) -> ProvisioningResult<Option<ProductMapping>> {
        let mut mapped = Vec::new();
        for item in &order.items {
            if let Some(mapping) = self.config.product_mapping(item.product_id).await? {
                if mapping.auto_provision {
                    mapped.push(mapping);
                }
            }
        }
        let mut mapped = mapped.into_iter();
        let Some(first) = mapped.next() else {
            return Ok(None);
        };
        if mapped.next().is_some() {
            self.log.warning(
                "Order has several auto-provisioned products; using the first",
                Self::context(order.id, ProvisioningStage::Unprocessed)
                    .field("plan_id", first.plan_id.as_str()),
            );
        }
        Ok(Some(first))
    }

    /// A domain chosen at checkout is authoritative: when it is invalid the
    /// order has no domain. The billing email host is used only when none was
    /// chosen.
    async fn resolve_domain(&self, order: &Order) -> ProvisioningResult<Option<String>> {
        let chosen = self
            .store
            .get_meta(Entity::Order(order.id), meta::HOSTING_DOMAIN)
            .await?;
        let chosen = chosen
            .as_ref()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|domain| !domain.is_empty());
        if let Some(chosen) = chosen {
            return Ok(normalize_domain(chosen));
        }
        Ok(order
            .billing
            .email
            .split_once('@')
            .and_then(|(_, host)| normalize_domain(host)))
    }

    async fn wait_for_provisioning(
        &self,
        order_id: OrderId,
        service_id: &RemoteId,
    ) -> ProvisioningResult<ServiceCredentials> {
        let timeout = self.config.settings().await?.provisioning_timeout();
        let started = Instant::now();

        while started.elapsed() < timeout {
            let service = self.api.get_service(service_id).await?;
            match service.status {
                ServiceStatus::Active => {
                    return self.api.get_service_credentials(service_id).await;
                }
                ServiceStatus::Failed => {
                    return Err(ProvisioningError::ProvisioningFailed {
                        service_id: service_id.to_string(),
                    });
                }
                status => {
                    self.log.debug(
                        "Service still provisioning",
                        Self::context(order_id, ProvisioningStage::Polling)
                            .status(status.as_str())
                            .field("service_id", service_id),
                    );
                }
            }
            sleep(self.poll_interval).await;
        }

        Err(ProvisioningError::Timeout {
            service_id: service_id.to_string(),
            waited_secs: started.elapsed().as_secs(),
        })
    }

    /// Cancels the half-provisioned service once. A failed cancel is logged and
    /// never replaces the original error.
    async fn roll_back(&self, order_id: OrderId, service_id: &RemoteId, cause: &ProvisioningError) {
        if let Err(cancel_err) = self.api.cancel_service(service_id).await {
            self.log.error(
                "Compensating cancel failed",
                Self::context(order_id, ProvisioningStage::Polling)
                    .status("cancel_failed")
                    .field("service_id", service_id)
                    .field("error", cancel_err.to_string()),
            );
        }
        if let Err(err) =
            set_order_status(self.store.as_ref(), order_id, &ServiceStatus::Failed).await
        {
            tracing::error!(order_id, ?err, "could not mark order failed");
        }
        self.log.error(
            "Provisioning failed, service cancelled",
            Self::context(order_id, ProvisioningStage::Polling)
                .status("failed")
                .field("service_id", service_id)
                .field("error", cause.to_string())
                .field("error_kind", cause.kind()),
        );
    }

    async fn send_credentials_email(
        &self,
        order: &Order,
        credentials: &ServiceCredentials,
        domain: &str,
    ) -> bool {
        let subject = format!("Your WordPress Hosting Credentials - {}", self.site_name);
        let body = credentials_email(order, credentials, domain, &self.site_name);
        self.mailer
            .send(order.billing.email.trim(), &subject, &body)
            .await
    }

    /// Decrypts stored credentials for an admin. Successful and refused
    /// reveals are both audited.
    pub async fn reveal_credentials(
        &self,
        order_id: OrderId,
        actor: &Actor,
    ) -> ProvisioningResult<ServiceCredentials> {
        if !actor.is_admin() {
            self.log.warning(
                "Credentials reveal denied",
                LogContext::event("credentials_revealed")
                    .order(order_id)
                    .status("denied")
                    .field("actor", actor.id.as_str())
                    .field("role", actor.role.as_str()),
            );
            return Err(ProvisioningError::Unauthorized);
        }
        let sealed = ProvisioningRecord::load(self.store.as_ref(), order_id)
            .await?
            .credentials_encrypted
            .ok_or_else(|| ProvisioningError::NotFound("credentials not found".into()))?;
        let plaintext = self.cipher.decrypt(&sealed)?;
        let credentials: ServiceCredentials = serde_json::from_str(&plaintext)
            .map_err(|_| ProvisioningError::Decode("invalid credentials format".into()))?;

        self.log.info(
            "Admin revealed credentials",
            LogContext::event("credentials_revealed")
                .order(order_id)
                .status("success")
                .field("actor", actor.id.as_str()),
        );
        Ok(credentials)
    }

    /// Clears the `processed` latch so provisioning can be queued again.
    pub async fn reset_for_retry(&self, order_id: OrderId) -> ProvisioningResult<()> {
        if self.store.order(order_id).await?.is_none() {
            return Err(ProvisioningError::NotFound(format!("order {order_id}")));
        }
        self.store
            .delete_meta(Entity::Order(order_id), meta::PROCESSED)
            .await?;
        self.log.info(
            "Provisioning latch cleared for retry",
            LogContext::event("provisioning")
                .order(order_id)
                .status("retry_requested"),
        );
        Ok(())
    }

    pub async fn provisioning_record(
        &self,
        order_id: OrderId,
    ) -> ProvisioningResult<ProvisioningRecord> {
        if self.store.order(order_id).await?.is_none() {
            return Err(ProvisioningError::NotFound(format!("order {order_id}")));
        }
        ProvisioningRecord::load(self.store.as_ref(), order_id).await
    }
}

/// Trimmed, lowercased hostname, or `None` if it is not one.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    (domain.len() <= 253 && DOMAIN_PATTERN.is_match(&domain)).then_some(domain)
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn credentials_email(
    order: &Order,
    credentials: &ServiceCredentials,
    domain: &str,
    site_name: &str,
) -> String {
    let domain = escape_html(domain);
    let login_email = credentials
        .email
        .as_deref()
        .unwrap_or(order.billing.email.as_str());
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>Your WordPress Hosting Credentials</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
<div style="max-width: 600px; margin: 0 auto; padding: 20px;">
<h2>Your WordPress Hosting is Ready!</h2>
<p>Hi {first_name},</p>
<p>Thank you for your purchase! Your WordPress hosting has been successfully provisioned.</p>
<div style="background-color: #f7f7f7; padding: 15px; margin: 20px 0;">
<h3 style="margin-top: 0;">Login Credentials</h3>
<p><strong>WordPress URL:</strong> <a href="https://{domain}/wp-admin">https://{domain}/wp-admin</a></p>
<p><strong>Username:</strong> {username}</p>
<p><strong>Password:</strong> {password}</p>
<p><strong>Email:</strong> {email}</p>
</div>
<p><strong>Important:</strong> Please change your password after your first login.</p>
<p>Best regards,<br>{site_name} Team</p>
<hr>
<p style="font-size: 12px; color: #666;">Order #{order_number}</p>
</div>
</body>
</html>"#,
        first_name = escape_html(&order.billing.first_name),
        domain = domain,
        username = escape_html(&credentials.username),
        password = escape_html(&credentials.password),
        email = escape_html(login_email),
        site_name = escape_html(site_name),
        order_number = escape_html(&order.number),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{InMemoryConfigStore, SettingsUpdate};
    use crate::crypto::AesGcmCipher;
    use crate::mail::OutboxMailer;
    use crate::store::{BillingDetails, InMemoryCommerceStore, OrderItem};
    use crate::telemetry::{IntegrationLog, LogFilter, LogLevel};
    use crate::testing::{sample_credentials, FakeHostingApi};

    struct Fixture {
        api: Arc<FakeHostingApi>,
        store: Arc<InMemoryCommerceStore>,
        config: Arc<InMemoryConfigStore>,
        mailer: Arc<OutboxMailer>,
        log: Arc<IntegrationLog>,
        orchestrator: Orchestrator,
    }

    async fn fixture() -> Fixture {
        let cipher = AesGcmCipher::from_secret("orchestrator-test").unwrap();
        fixture_with_cipher(Arc::new(cipher)).await
    }

    async fn fixture_with_cipher(cipher: Arc<dyn CredentialCipher>) -> Fixture {
        let api = Arc::new(FakeHostingApi::default());
        let store = Arc::new(InMemoryCommerceStore::new());
        let config = Arc::new(InMemoryConfigStore::new(cipher.clone()));
        let mailer = Arc::new(OutboxMailer::new());
        let log = Arc::new(IntegrationLog::new(true));
        let linker = Arc::new(CustomerLinker::new(
            api.clone(),
            store.clone(),
            log.clone(),
        ));
        let orchestrator = Orchestrator::new(
            api.clone(),
            linker,
            config.clone(),
            store.clone(),
            cipher,
            mailer.clone(),
            log.clone(),
        )
        .with_site_name("Acme Hosting");

        config
            .save_product_mapping(
                100,
                ProductMapping {
                    plan_id: "P".into(),
                    auto_provision: true,
                },
            )
            .await
            .unwrap();
        config
            .update_settings(&SettingsUpdate {
                provisioning_timeout: Some(60),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap();
        store.insert_order(order(1, "a@x.com", vec![100]));

        Fixture {
            api,
            store,
            config,
            mailer,
            log,
            orchestrator,
        }
    }

    fn order(id: OrderId, email: &str, products: Vec<u64>) -> Order {
        Order {
            id,
            number: format!("10{id}"),
            customer_id: None,
            billing: BillingDetails {
                email: email.into(),
                first_name: "Ada".into(),
                last_name: "L".into(),
                company: None,
            },
            items: products
                .into_iter()
                .map(|product_id| OrderItem {
                    product_id,
                    quantity: 1,
                })
                .collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn domain_falls_back_to_billing_email() {
        let fx = fixture().await;
        fx.api.script_statuses([ServiceStatus::Active]);

        let outcome = fx.orchestrator.provision_hosting(1).await.unwrap();
        assert_eq!(outcome.domain, "x.com");

        let services = fx.api.created_services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].plan_id, "P");
        assert_eq!(services[0].domain, "x.com");
        assert_eq!(services[0].user_id, outcome.account_id);
        assert_eq!(fx.api.created_users()[0].email, "a@x.com");
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_domain_wins_and_is_normalized() {
        let fx = fixture().await;
        fx.store
            .set_meta(
                Entity::Order(1),
                meta::HOSTING_DOMAIN,
                Value::String("  Blog.Example.ORG ".into()),
            )
            .await
            .unwrap();
        fx.api.script_statuses([ServiceStatus::Active]);
        let outcome = fx.orchestrator.provision_hosting(1).await.unwrap();
        assert_eq!(outcome.domain, "blog.example.org");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_chosen_domain_is_not_replaced_by_email_host() {
        let fx = fixture().await;
        fx.store
            .set_meta(
                Entity::Order(1),
                meta::HOSTING_DOMAIN,
                Value::String("my_shop.com".into()),
            )
            .await
            .unwrap();

        let err = fx.orchestrator.provision_hosting(1).await.unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::validation("domain not specified in order")
        );
        assert!(fx.api.created_services().is_empty());
        assert_eq!(
            fx.log.count(&LogFilter {
                event_type: Some("provisioning".into()),
                status: Some("failed".into()),
                ..LogFilter::default()
            }),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blank_chosen_domain_falls_back_to_email_host() {
        let fx = fixture().await;
        fx.store
            .set_meta(Entity::Order(1), meta::HOSTING_DOMAIN, Value::String("  ".into()))
            .await
            .unwrap();
        fx.api.script_statuses([ServiceStatus::Active]);
        let outcome = fx.orchestrator.provision_hosting(1).await.unwrap();
        assert_eq!(outcome.domain, "x.com");
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_a_duplicate() {
        let fx = fixture().await;
        fx.api.script_statuses([ServiceStatus::Active]);
        fx.orchestrator.provision_hosting(1).await.unwrap();

        let err = fx.orchestrator.provision_hosting(1).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Duplicate(_)));
        assert_eq!(fx.api.count("create_service"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_at_first_active_status() {
        let fx = fixture().await;
        fx.api.script_statuses([
            ServiceStatus::Provisioning,
            ServiceStatus::Unknown("installing".into()),
            ServiceStatus::Active,
            ServiceStatus::Active,
        ]);
        let started = Instant::now();

        let outcome = fx.orchestrator.provision_hosting(1).await.unwrap();
        assert_eq!(outcome.credentials, sample_credentials());
        assert_eq!(fx.api.count("get_service"), 3);
        assert_eq!(fx.api.count("get_service_credentials"), 1);
        assert_eq!(fx.api.count("cancel_service"), 0);
        assert!(started.elapsed() >= DEFAULT_POLL_INTERVAL * 2);

        let calls = fx.api.calls();
        assert!(calls.last().unwrap().starts_with("get_service_credentials"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_persists_record_and_sends_email() {
        let fx = fixture().await;
        fx.api.script_statuses([ServiceStatus::Active]);
        let outcome = fx.orchestrator.provision_hosting(1).await.unwrap();
        assert!(outcome.email_sent);

        let record = fx.orchestrator.provisioning_record(1).await.unwrap();
        assert!(record.processed);
        assert_eq!(record.status, Some(ServiceStatus::Active));
        assert_eq!(record.service_id, Some(outcome.service_id.clone()));
        assert_eq!(record.remote_account_id, Some(outcome.account_id.clone()));
        assert!(record.processed_date.is_some());
        let sealed = record.credentials_encrypted.unwrap();
        assert!(!sealed.contains("Tr0ub4dor"));

        let messages = fx.mailer.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to, "a@x.com");
        assert_eq!(
            messages[0].subject,
            "Your WordPress Hosting Credentials - Acme Hosting"
        );
        assert!(messages[0].html_body.contains("https://x.com/wp-admin"));
        assert!(messages[0].html_body.contains("Tr0ub4dor&amp;3"));
        assert!(messages[0].html_body.contains("Order #101"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_exactly_once() {
        let fx = fixture().await;
        let err = fx.orchestrator.provision_hosting(1).await.unwrap_err();

        assert!(matches!(err, ProvisioningError::Timeout { waited_secs: 60, .. }));
        assert_eq!(fx.api.count("get_service"), 6);
        assert_eq!(fx.api.count("cancel_service"), 1);
        assert_eq!(fx.api.count("get_service_credentials"), 0);

        let record = ProvisioningRecord::load(fx.store.as_ref(), 1).await.unwrap();
        assert!(!record.processed);
        assert_eq!(record.status, Some(ServiceStatus::Failed));
        assert!(record.service_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_cancels_and_reports() {
        let fx = fixture().await;
        fx.api
            .script_statuses([ServiceStatus::Provisioning, ServiceStatus::Failed]);
        fx.api
            .fail_next("cancel_service", ProvisioningError::Transport("gone".into()));

        let err = fx.orchestrator.provision_hosting(1).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::ProvisioningFailed { .. }));
        assert_eq!(fx.api.count("cancel_service"), 1);

        let cancel_failures = fx.log.count(&LogFilter {
            status: Some("cancel_failed".into()),
            ..LogFilter::default()
        });
        assert_eq!(cancel_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_error_also_rolls_back() {
        let fx = fixture().await;
        fx.api.fail_next(
            "get_service",
            ProvisioningError::Api {
                status: 500,
                message: "boom".into(),
                raw_body: "{}".into(),
            },
        );
        let err = fx.orchestrator.provision_hosting(1).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Api { status: 500, .. }));
        assert_eq!(fx.api.count("cancel_service"), 1);
    }

    struct SealingFails;

    impl CredentialCipher for SealingFails {
        fn encrypt(&self, _plaintext: &str) -> ProvisioningResult<String> {
            Err(ProvisioningError::Crypto("key unavailable".into()))
        }

        fn decrypt(&self, _ciphertext: &str) -> ProvisioningResult<String> {
            Err(ProvisioningError::Crypto("key unavailable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sealing_failure_cancels_the_service() {
        let fx = fixture_with_cipher(Arc::new(SealingFails)).await;
        fx.api.script_statuses([ServiceStatus::Active]);

        let err = fx.orchestrator.provision_hosting(1).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Crypto(_)));
        assert!(!err.is_retryable());
        assert_eq!(fx.api.count("cancel_service"), 1);
        assert!(fx.mailer.messages().is_empty());

        let record = ProvisioningRecord::load(fx.store.as_ref(), 1).await.unwrap();
        assert!(!record.processed);
        assert!(!record.has_credentials);
        assert_eq!(record.status, Some(ServiceStatus::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn email_failure_still_completes() {
        let fx = fixture().await;
        fx.mailer.set_rejecting(true);
        fx.api.script_statuses([ServiceStatus::Active]);

        let outcome = fx.orchestrator.provision_hosting(1).await.unwrap();
        assert!(!outcome.email_sent);
        assert!(
            ProvisioningRecord::load(fx.store.as_ref(), 1)
                .await
                .unwrap()
                .processed
        );
        assert_eq!(
            fx.log.count(&LogFilter {
                status: Some("email_failed".into()),
                ..LogFilter::default()
            }),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unmapped_and_undomained_orders_are_rejected() {
        let fx = fixture().await;
        fx.store.insert_order(order(2, "b@y.com", vec![999]));
        let err = fx.orchestrator.provision_hosting(2).await.unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::validation("product not mapped to a hosting plan")
        );

        fx.config
            .save_product_mapping(
                200,
                ProductMapping {
                    plan_id: "Q".into(),
                    auto_provision: false,
                },
            )
            .await
            .unwrap();
        fx.store.insert_order(order(3, "c@z.com", vec![200]));
        assert!(fx.orchestrator.provision_hosting(3).await.is_err());

        fx.store.insert_order(order(4, "no-at-sign", vec![100]));
        let err = fx.orchestrator.provision_hosting(4).await.unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::validation("domain not specified in order")
        );
        assert_eq!(fx.api.count("create_service"), 0);

        assert_eq!(
            fx.orchestrator.provision_hosting(77).await.unwrap_err(),
            ProvisioningError::validation("order not found")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_mapped_item_wins() {
        let fx = fixture().await;
        fx.config
            .save_product_mapping(
                300,
                ProductMapping {
                    plan_id: "R".into(),
                    auto_provision: true,
                },
            )
            .await
            .unwrap();
        fx.store.insert_order(order(5, "a@x.com", vec![999, 300, 100]));
        fx.api.script_statuses([ServiceStatus::Active]);

        let outcome = fx.orchestrator.provision_hosting(5).await.unwrap();
        assert_eq!(outcome.plan_id, "R");
    }

    #[tokio::test(start_paused = true)]
    async fn reveal_is_audited_and_admin_only() {
        let fx = fixture().await;
        fx.api.script_statuses([ServiceStatus::Active]);
        fx.orchestrator.provision_hosting(1).await.unwrap();

        let viewer = Actor {
            id: "9".into(),
            role: "user".into(),
        };
        assert_eq!(
            fx.orchestrator
                .reveal_credentials(1, &viewer)
                .await
                .unwrap_err(),
            ProvisioningError::Unauthorized
        );
        let denied = fx.log.query(&LogFilter {
            event_type: Some("credentials_revealed".into()),
            status: Some("denied".into()),
            ..LogFilter::default()
        });
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].level, LogLevel::Warning);
        assert_eq!(denied[0].context["actor"], "9");

        let credentials = fx
            .orchestrator
            .reveal_credentials(1, &Actor::admin("1"))
            .await
            .unwrap();
        assert_eq!(credentials.password, "Tr0ub4dor&3");
        assert_eq!(
            fx.log.count(&LogFilter {
                event_type: Some("credentials_revealed".into()),
                status: Some("success".into()),
                ..LogFilter::default()
            }),
            1
        );

        fx.store.insert_order(order(6, "a@x.com", vec![100]));
        assert!(matches!(
            fx.orchestrator
                .reveal_credentials(6, &Actor::admin("1"))
                .await,
            Err(ProvisioningError::NotFound(_))
        ));
        fx.store
            .set_meta(
                Entity::Order(6),
                meta::CREDENTIALS,
                Value::String("garbage".into()),
            )
            .await
            .unwrap();
        assert!(matches!(
            fx.orchestrator
                .reveal_credentials(6, &Actor::admin("1"))
                .await,
            Err(ProvisioningError::Crypto(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_allows_a_second_run() {
        let fx = fixture().await;
        fx.api
            .script_statuses([ServiceStatus::Active, ServiceStatus::Active]);
        fx.orchestrator.provision_hosting(1).await.unwrap();

        fx.orchestrator.reset_for_retry(1).await.unwrap();
        fx.orchestrator.provision_hosting(1).await.unwrap();
        assert_eq!(fx.api.count("create_service"), 2);
        assert!(fx.orchestrator.reset_for_retry(404).await.is_err());
    }

    #[test]
    fn domains_are_validated() {
        assert_eq!(normalize_domain(" X.com "), Some("x.com".into()));
        assert_eq!(normalize_domain("shop.example.co.uk."), Some("shop.example.co.uk".into()));
        assert_eq!(normalize_domain(""), None);
        assert_eq!(normalize_domain("localhost"), None);
        assert_eq!(normalize_domain("bad domain.com"), None);
        assert_eq!(normalize_domain("-bad.com"), None);
        assert_eq!(normalize_domain("<script>.com"), None);
    }
}
