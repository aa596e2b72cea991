use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::CredentialCipher;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::store::ProductId;

pub const MIN_PROVISIONING_TIMEOUT_SECS: u64 = 60;
pub const MAX_PROVISIONING_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Requests per minute allowed against the remote API.
    pub rate_limit: u32,
    pub provisioning_timeout: u64,
    pub retry_attempts: u32,
    pub log_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rate_limit: 55,
            provisioning_timeout: 300,
            retry_attempts: 5,
            log_retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub rate_limit: Option<u32>,
    pub provisioning_timeout: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub log_retention_days: Option<u32>,
}

impl Settings {
    pub fn apply(self, update: &SettingsUpdate) -> Settings {
        Settings {
            rate_limit: update.rate_limit.unwrap_or(self.rate_limit).max(1),
            provisioning_timeout: update
                .provisioning_timeout
                .unwrap_or(self.provisioning_timeout)
                .clamp(MIN_PROVISIONING_TIMEOUT_SECS, MAX_PROVISIONING_TIMEOUT_SECS),
            retry_attempts: update.retry_attempts.unwrap_or(self.retry_attempts),
            log_retention_days: update.log_retention_days.unwrap_or(self.log_retention_days),
        }
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout.clamp(
            MIN_PROVISIONING_TIMEOUT_SECS,
            MAX_PROVISIONING_TIMEOUT_SECS,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMapping {
    pub plan_id: String,
    #[serde(default = "default_auto_provision")]
    pub auto_provision: bool,
}

fn default_auto_provision() -> bool {
    true
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ApiCredentials {
    pub api_url: String,
    pub api_token: String,
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_url", &self.api_url)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// Persistent key-value configuration: remote API credentials, product mappings, settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn save_credentials(&self, credentials: &ApiCredentials) -> ProvisioningResult<()>;

    /// `None` when unset or when the stored token cannot be decrypted.
    async fn credentials(&self) -> ProvisioningResult<Option<ApiCredentials>>;

    async fn save_product_mapping(
        &self,
        product_id: ProductId,
        mapping: ProductMapping,
    ) -> ProvisioningResult<()>;

    async fn product_mapping(&self, product_id: ProductId)
        -> ProvisioningResult<Option<ProductMapping>>;

    async fn product_mappings(&self) -> ProvisioningResult<BTreeMap<ProductId, ProductMapping>>;

    async fn delete_product_mapping(&self, product_id: ProductId) -> ProvisioningResult<bool>;

    async fn settings(&self) -> ProvisioningResult<Settings>;

    async fn update_settings(&self, update: &SettingsUpdate) -> ProvisioningResult<Settings>;
}

/// Normalized URL and encrypted token ready to be persisted.
#[derive(Serialize, Deserialize)]
pub(crate) struct SealedCredentials {
    pub api_url: String,
    pub api_token_encrypted: String,
}

pub(crate) fn seal_credentials(
    cipher: &dyn CredentialCipher,
    credentials: &ApiCredentials,
) -> ProvisioningResult<SealedCredentials> {
    let api_url = normalize_api_url(&credentials.api_url)?;
    if credentials.api_token.trim().is_empty() {
        return Err(ProvisioningError::validation("API token is required"));
    }
    Ok(SealedCredentials {
        api_url,
        api_token_encrypted: cipher.encrypt(credentials.api_token.trim())?,
    })
}

pub(crate) fn open_credentials(
    cipher: &dyn CredentialCipher,
    api_url: String,
    api_token_encrypted: &str,
) -> Option<ApiCredentials> {
    match cipher.decrypt(api_token_encrypted) {
        Ok(api_token) => Some(ApiCredentials { api_url, api_token }),
        Err(err) => {
            tracing::error!(?err, "stored API token could not be decrypted");
            None
        }
    }
}

pub(crate) fn validate_mapping(mapping: ProductMapping) -> ProvisioningResult<ProductMapping> {
    let plan_id = mapping.plan_id.trim().to_string();
    if plan_id.is_empty() {
        return Err(ProvisioningError::validation("plan id is required"));
    }
    Ok(ProductMapping {
        plan_id,
        auto_provision: mapping.auto_provision,
    })
}

fn normalize_api_url(raw: &str) -> ProvisioningResult<String> {
    let parsed = Url::parse(raw.trim())
        .map_err(|err| ProvisioningError::validation(format!("invalid API URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ProvisioningError::validation(
            "API URL must use http or https",
        ));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Process-local configuration used by tests and the route fixtures.
pub struct InMemoryConfigStore {
    cipher: Arc<dyn CredentialCipher>,
    sealed: RwLock<Option<SealedCredentials>>,
    mappings: DashMap<ProductId, ProductMapping>,
    settings: RwLock<Settings>,
}

impl InMemoryConfigStore {
    pub fn new(cipher: Arc<dyn CredentialCipher>) -> Self {
        Self {
            cipher,
            sealed: RwLock::new(None),
            mappings: DashMap::new(),
            settings: RwLock::new(Settings::default()),
        }
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn save_credentials(&self, credentials: &ApiCredentials) -> ProvisioningResult<()> {
        let sealed = seal_credentials(self.cipher.as_ref(), credentials)?;
        *self.sealed.write().unwrap_or_else(|e| e.into_inner()) = Some(sealed);
        Ok(())
    }

    async fn credentials(&self) -> ProvisioningResult<Option<ApiCredentials>> {
        let sealed = self.sealed.read().unwrap_or_else(|e| e.into_inner());
        Ok(sealed.as_ref().and_then(|sealed| {
            open_credentials(
                self.cipher.as_ref(),
                sealed.api_url.clone(),
                &sealed.api_token_encrypted,
            )
        }))
    }

    async fn save_product_mapping(
        &self,
        product_id: ProductId,
        mapping: ProductMapping,
    ) -> ProvisioningResult<()> {
        self.mappings.insert(product_id, validate_mapping(mapping)?);
        Ok(())
    }

    async fn product_mapping(
        &self,
        product_id: ProductId,
    ) -> ProvisioningResult<Option<ProductMapping>> {
        Ok(self.mappings.get(&product_id).map(|entry| entry.clone()))
    }

    async fn product_mappings(&self) -> ProvisioningResult<BTreeMap<ProductId, ProductMapping>> {
        Ok(self
            .mappings
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }

    async fn delete_product_mapping(&self, product_id: ProductId) -> ProvisioningResult<bool> {
        Ok(self.mappings.remove(&product_id).is_some())
    }

    async fn settings(&self) -> ProvisioningResult<Settings> {
        Ok(*self.settings.read().unwrap_or_else(|e| e.into_inner()))
    }

    async fn update_settings(&self, update: &SettingsUpdate) -> ProvisioningResult<Settings> {
        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        *settings = settings.apply(update);
        Ok(*settings)
    }
}
