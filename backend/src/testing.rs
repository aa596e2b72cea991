//! Scripted `HostingApi` for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Map;

use crate::client::HostingApi;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::models::{
    ConnectionCheck, NewService, NewUser, Plan, RemoteId, RemoteUser, Service, ServiceCredentials,
    ServiceStatus, UserUpdate,
};

#[derive(Default)]
pub struct FakeHostingApi {
    calls: Mutex<Vec<String>>,
    users: Mutex<HashMap<String, RemoteId>>,
    created_users: Mutex<Vec<NewUser>>,
    created_services: Mutex<Vec<NewService>>,
    updates: Mutex<Vec<(RemoteId, UserUpdate)>>,
    statuses: Mutex<VecDeque<ServiceStatus>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ProvisioningError>>>,
    next_id: AtomicU64,
}

impl FakeHostingApi {
    pub fn add_user(&self, email: &str, id: &str) {
        self.users
            .lock()
            .unwrap()
            .insert(email.to_string(), RemoteId::from(id));
    }

    /// Statuses returned by successive `get_service` calls. Once exhausted the
    /// service stays `provisioning`.
    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = ServiceStatus>) {
        self.statuses.lock().unwrap().extend(statuses);
    }

    pub fn fail_next(&self, operation: &'static str, err: ProvisioningError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split(':').next() == Some(operation))
            .count()
    }

    pub fn created_users(&self) -> Vec<NewUser> {
        self.created_users.lock().unwrap().clone()
    }

    pub fn created_services(&self) -> Vec<NewService> {
        self.created_services.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(RemoteId, UserUpdate)> {
        self.updates.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, detail: String) -> ProvisioningResult<()> {
        let call = if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{operation}:{detail}")
        };
        self.calls.lock().unwrap().push(call);
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> RemoteId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        RemoteId::new(format!("{prefix}-{n}"))
    }
}

pub fn sample_credentials() -> ServiceCredentials {
    ServiceCredentials {
        username: "siteadmin".into(),
        password: "Tr0ub4dor&3".into(),
        email: Some("a@x.com".into()),
        login_url: None,
        extra: Map::new(),
    }
}

#[async_trait]
impl HostingApi for FakeHostingApi {
    async fn test_connection(&self) -> ConnectionCheck {
        match self.record("test_connection", String::new()) {
            Ok(()) => ConnectionCheck {
                success: true,
                message: "connected".into(),
            },
            Err(err) => ConnectionCheck {
                success: false,
                message: err.to_string(),
            },
        }
    }

    async fn create_user(&self, user: &NewUser) -> ProvisioningResult<RemoteUser> {
        self.record("create_user", user.email.clone())?;
        self.created_users.lock().unwrap().push(user.clone());
        let id = self.next_id("u");
        self.users
            .lock()
            .unwrap()
            .insert(user.email.clone(), id.clone());
        Ok(RemoteUser {
            id,
            email: user.email.clone(),
            first_name: Some(user.first_name.clone()),
            last_name: Some(user.last_name.clone()),
            company: user.company.clone(),
        })
    }

    async fn get_user_by_email(&self, email: &str) -> ProvisioningResult<RemoteUser> {
        self.record("get_user_by_email", email.to_string())?;
        let id = self
            .users
            .lock()
            .unwrap()
            .get(email)
            .cloned()
            .ok_or_else(|| ProvisioningError::NotFound(email.to_string()))?;
        Ok(RemoteUser {
            id,
            email: email.to_string(),
            first_name: None,
            last_name: None,
            company: None,
        })
    }

    async fn update_user(&self, user_id: &RemoteId, update: &UserUpdate) -> ProvisioningResult<()> {
        self.record("update_user", user_id.to_string())?;
        self.updates
            .lock()
            .unwrap()
            .push((user_id.clone(), update.clone()));
        Ok(())
    }

    async fn create_service(&self, service: &NewService) -> ProvisioningResult<Service> {
        self.record(
            "create_service",
            format!("{}:{}:{}", service.user_id, service.plan_id, service.domain),
        )?;
        self.created_services.lock().unwrap().push(service.clone());
        Ok(Service {
            id: self.next_id("svc"),
            user_id: Some(service.user_id.clone()),
            plan_id: Some(RemoteId::new(service.plan_id.clone())),
            domain: Some(service.domain.clone()),
            status: ServiceStatus::Provisioning,
        })
    }

    async fn get_service(&self, service_id: &RemoteId) -> ProvisioningResult<Service> {
        self.record("get_service", service_id.to_string())?;
        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ServiceStatus::Provisioning);
        Ok(Service {
            id: service_id.clone(),
            user_id: None,
            plan_id: None,
            domain: None,
            status,
        })
    }

    async fn get_service_credentials(
        &self,
        service_id: &RemoteId,
    ) -> ProvisioningResult<ServiceCredentials> {
        self.record("get_service_credentials", service_id.to_string())?;
        Ok(sample_credentials())
    }

    async fn suspend_service(&self, service_id: &RemoteId) -> ProvisioningResult<()> {
        self.record("suspend_service", service_id.to_string())
    }

    async fn unsuspend_service(&self, service_id: &RemoteId) -> ProvisioningResult<()> {
        self.record("unsuspend_service", service_id.to_string())
    }

    async fn cancel_service(&self, service_id: &RemoteId) -> ProvisioningResult<()> {
        self.record("cancel_service", service_id.to_string())
    }

    async fn get_plan(&self, plan_id: &str) -> ProvisioningResult<Plan> {
        self.record("get_plan", plan_id.to_string())?;
        Ok(Plan {
            id: RemoteId::from(plan_id),
            name: None,
            extra: Map::new(),
        })
    }
}
