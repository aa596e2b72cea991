use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config_store::ConfigStore;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::models::{
    ConnectionCheck, NewService, NewUser, Plan, RemoteId, RemoteUser, Service, ServiceCredentials,
    UserUpdate,
};
use crate::rate_limiter::RateLimiter;
use crate::telemetry::{LogContext, LogLevel, LogSink};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API_PREFIX: &str = "/api/admin";

/// Operations against the remote hosting panel.
#[async_trait]
pub trait HostingApi: Send + Sync {
    /// Never fails; the outcome is reported in the returned summary.
    async fn test_connection(&self) -> ConnectionCheck;

    async fn create_user(&self, user: &NewUser) -> ProvisioningResult<RemoteUser>;

    /// `NotFound` when no remote user has this email.
    async fn get_user_by_email(&self, email: &str) -> ProvisioningResult<RemoteUser>;

    async fn update_user(&self, user_id: &RemoteId, update: &UserUpdate) -> ProvisioningResult<()>;

    async fn create_service(&self, service: &NewService) -> ProvisioningResult<Service>;

    async fn get_service(&self, service_id: &RemoteId) -> ProvisioningResult<Service>;

    async fn get_service_credentials(
        &self,
        service_id: &RemoteId,
    ) -> ProvisioningResult<ServiceCredentials>;

    async fn suspend_service(&self, service_id: &RemoteId) -> ProvisioningResult<()>;

    async fn unsuspend_service(&self, service_id: &RemoteId) -> ProvisioningResult<()>;

    async fn cancel_service(&self, service_id: &RemoteId) -> ProvisioningResult<()>;

    async fn get_plan(&self, plan_id: &str) -> ProvisioningResult<Plan>;
}

/// `HostingApi` over HTTP. Credentials are read from the config store on every
/// call so admin updates apply without a restart.
pub struct HttpHostingApi {
    client: reqwest::Client,
    config: Arc<dyn ConfigStore>,
    limiter: RateLimiter,
    log: Arc<dyn LogSink>,
}

impl HttpHostingApi {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        limiter: RateLimiter,
        log: Arc<dyn LogSink>,
    ) -> ProvisioningResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ProvisioningError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            config,
            limiter,
            log,
        })
    }

    /// Single request path: rate-limit admission, authenticated JSON call,
    /// outcome classification. Returns the decoded response document.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> ProvisioningResult<Value> {
        let credentials = self
            .config
            .credentials()
            .await?
            .ok_or_else(|| ProvisioningError::validation("API credentials not configured"))?;

        let waited = self.limiter.acquire().await;
        if !waited.is_zero() {
            self.log.debug(
                &format!("Rate limit: waited {} seconds", waited.as_secs()),
                LogContext::event("rate_limit").field("path", path),
            );
        }

        let url = format!("{}{API_PREFIX}{path}", credentials.api_url);
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&credentials.api_token)
            .header(reqwest::header::ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ProvisioningError::Transport(err.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProvisioningError::Transport(err.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|doc| doc.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "Unknown API error".to_string());
            return Err(ProvisioningError::Api {
                status: status.as_u16(),
                message,
                raw_body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| ProvisioningError::Decode(err.to_string()))
    }

    fn log_failure(
        &self,
        level: LogLevel,
        message: &str,
        context: LogContext,
        err: &ProvisioningError,
    ) {
        let mut context = context
            .status("failed")
            .field("error", err.to_string())
            .field("error_kind", err.kind());
        if let ProvisioningError::Api { raw_body, .. } = err {
            context = context.field("response", raw_body.as_str());
        }
        self.log.log(level, message, context);
    }
}

fn to_body<T: serde::Serialize>(payload: &T) -> ProvisioningResult<Value> {
    serde_json::to_value(payload)
        .map_err(|err| ProvisioningError::validation(format!("unserializable payload: {err}")))
}

/// Unwraps the `{ "data": ... }` envelope.
fn data<T: DeserializeOwned>(document: Value) -> ProvisioningResult<T> {
    let Value::Object(mut fields) = document else {
        return Err(ProvisioningError::Decode("expected a JSON object".into()));
    };
    let payload = fields
        .remove("data")
        .ok_or_else(|| ProvisioningError::Decode("response has no data field".into()))?;
    serde_json::from_value(payload).map_err(|err| ProvisioningError::Decode(err.to_string()))
}

#[async_trait]
impl HostingApi for HttpHostingApi {
    async fn test_connection(&self) -> ConnectionCheck {
        self.log.debug(
            "Testing hosting panel API connection",
            LogContext::event("api_test"),
        );
        match self
            .request(Method::GET, "/plans", &[("limit", "1")], None)
            .await
        {
            Ok(_) => {
                self.log.info(
                    "API connection test successful",
                    LogContext::event("api_test").status("success"),
                );
                ConnectionCheck {
                    success: true,
                    message: "Successfully connected to the hosting panel API".to_string(),
                }
            }
            Err(err) => {
                self.log_failure(
                    LogLevel::Error,
                    "API connection test failed",
                    LogContext::event("api_test"),
                    &err,
                );
                ConnectionCheck {
                    success: false,
                    message: err.to_string(),
                }
            }
        }
    }

    async fn create_user(&self, user: &NewUser) -> ProvisioningResult<RemoteUser> {
        let context = LogContext::event("user_create").email(&user.email);
        self.log.debug("Creating remote user", context.clone());

        let result = async {
            let document = self
                .request(Method::POST, "/users", &[], Some(to_body(user)?))
                .await?;
            data::<RemoteUser>(document)
        }
        .await;

        match &result {
            Ok(created) => {
                self.log.info(
                    "Remote user created successfully",
                    context.status("success").field("user_id", &created.id),
                );
            }
            Err(err) => {
                self.log_failure(LogLevel::Error, "Failed to create remote user", context, err)
            }
        }
        result
    }

    async fn get_user_by_email(&self, email: &str) -> ProvisioningResult<RemoteUser> {
        let context = LogContext::event("user_get").email(email);
        self.log.debug("Looking up remote user by email", context.clone());

        let document = match self
            .request(Method::GET, "/users", &[("email", email)], None)
            .await
        {
            Ok(document) => document,
            Err(err) => {
                self.log_failure(LogLevel::Warning, "Failed to get remote user", context, &err);
                return Err(err);
            }
        };

        let is_list = matches!(document.get("data"), Some(Value::Array(_)));
        let users: Vec<RemoteUser> = if is_list { data(document)? } else { Vec::new() };
        users
            .into_iter()
            .next()
            .ok_or_else(|| ProvisioningError::NotFound(format!("no remote user for {email}")))
    }

    async fn update_user(&self, user_id: &RemoteId, update: &UserUpdate) -> ProvisioningResult<()> {
        let context = LogContext::event("user_update").field("user_id", user_id);
        self.log.debug("Updating remote user", context.clone());

        let path = format!("/users/{user_id}");
        let result = async {
            self.request(Method::PUT, &path, &[], Some(to_body(update)?))
                .await
                .map(|_| ())
        }
        .await;

        match &result {
            Ok(()) => {
                self.log
                    .info("Remote user updated successfully", context.status("success"));
            }
            Err(err) => {
                self.log_failure(LogLevel::Error, "Failed to update remote user", context, err)
            }
        }
        result
    }

    async fn create_service(&self, service: &NewService) -> ProvisioningResult<Service> {
        let context = LogContext::event("service_create")
            .field("user_id", &service.user_id)
            .field("plan_id", service.plan_id.as_str())
            .field("domain", service.domain.as_str());
        self.log.debug("Creating remote service", context.clone());

        let result = async {
            let document = self
                .request(Method::POST, "/services", &[], Some(to_body(service)?))
                .await?;
            data::<Service>(document)
        }
        .await;

        match &result {
            Ok(created) => {
                self.log.info(
                    "Remote service created successfully",
                    context.status("success").field("service_id", &created.id),
                );
            }
            Err(err) => self.log_failure(
                LogLevel::Error,
                "Failed to create remote service",
                context,
                err,
            ),
        }
        result
    }

    async fn get_service(&self, service_id: &RemoteId) -> ProvisioningResult<Service> {
        let context = LogContext::event("service_get").field("service_id", service_id);
        self.log.debug("Getting remote service", context.clone());

        let path = format!("/services/{service_id}");
        let result = async { data::<Service>(self.request(Method::GET, &path, &[], None).await?) }
            .await;
        match &result {
            Ok(service) => {
                self.log.info(
                    "Remote service retrieved",
                    context
                        .status("success")
                        .field("service_status", service.status.as_str()),
                );
            }
            Err(err) => {
                self.log_failure(LogLevel::Warning, "Failed to get remote service", context, err)
            }
        }
        result
    }

    async fn get_service_credentials(
        &self,
        service_id: &RemoteId,
    ) -> ProvisioningResult<ServiceCredentials> {
        let context = LogContext::event("credentials_get").field("service_id", service_id);
        self.log.debug("Getting service credentials", context.clone());

        let path = format!("/services/{service_id}/credentials");
        let result = async {
            data::<ServiceCredentials>(self.request(Method::GET, &path, &[], None).await?)
        }
        .await;

        match &result {
            Ok(_) => {
                self.log.info(
                    "Service credentials retrieved successfully",
                    context.status("success").field("credentials_present", true),
                );
            }
            Err(err) => self.log_failure(
                LogLevel::Error,
                "Failed to get service credentials",
                context,
                err,
            ),
        }
        result
    }

    async fn suspend_service(&self, service_id: &RemoteId) -> ProvisioningResult<()> {
        self.service_action(
            Method::POST,
            format!("/services/{service_id}/suspend"),
            service_id,
            ServiceAction::Suspend,
        )
        .await
    }

    async fn unsuspend_service(&self, service_id: &RemoteId) -> ProvisioningResult<()> {
        self.service_action(
            Method::POST,
            format!("/services/{service_id}/unsuspend"),
            service_id,
            ServiceAction::Unsuspend,
        )
        .await
    }

    async fn cancel_service(&self, service_id: &RemoteId) -> ProvisioningResult<()> {
        self.service_action(
            Method::DELETE,
            format!("/services/{service_id}"),
            service_id,
            ServiceAction::Cancel,
        )
        .await
    }

    async fn get_plan(&self, plan_id: &str) -> ProvisioningResult<Plan> {
        let context = LogContext::event("plan_get").field("plan_id", plan_id);
        self.log.debug("Getting remote plan", context.clone());

        let path = format!("/plans/{plan_id}");
        let result =
            async { data::<Plan>(self.request(Method::GET, &path, &[], None).await?) }.await;
        match &result {
            Ok(_) => {
                self.log
                    .info("Remote plan retrieved", context.status("success"));
            }
            Err(err) => self.log_failure(LogLevel::Warning, "Failed to get plan", context, err),
        }
        result
    }
}

#[derive(Clone, Copy)]
enum ServiceAction {
    Suspend,
    Unsuspend,
    Cancel,
}

impl ServiceAction {
    fn event_type(self) -> &'static str {
        match self {
            ServiceAction::Suspend => "service_suspend",
            ServiceAction::Unsuspend => "service_unsuspend",
            ServiceAction::Cancel => "service_cancel",
        }
    }

    fn verb(self) -> &'static str {
        match self {
            ServiceAction::Suspend => "suspend",
            ServiceAction::Unsuspend => "unsuspend",
            ServiceAction::Cancel => "cancel",
        }
    }
}

impl HttpHostingApi {
    async fn service_action(
        &self,
        method: Method,
        path: String,
        service_id: &RemoteId,
        action: ServiceAction,
    ) -> ProvisioningResult<()> {
        let context = LogContext::event(action.event_type()).field("service_id", service_id);
        self.log.debug(
            &format!("Requesting service {}", action.verb()),
            context.clone(),
        );

        match self.request(method, &path, &[], None).await {
            Ok(_) => {
                self.log.info(
                    &format!("Service {} succeeded", action.verb()),
                    context.status("success"),
                );
                Ok(())
            }
            Err(err) => {
                self.log_failure(
                    LogLevel::Error,
                    &format!("Failed to {} service", action.verb()),
                    context,
                    &err,
                );
                Err(err)
            }
        }
    }
}
