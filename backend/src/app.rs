use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPool;

use crate::client::{HostingApi, HttpHostingApi};
use crate::config;
use crate::config_store::{ApiCredentials, ConfigStore, InMemoryConfigStore, Settings, SettingsUpdate};
use crate::crypto::{AesGcmCipher, CredentialCipher};
use crate::db::{self, PgCommerceStore, PgConfigStore, PgIntegrationLog, PgJobStore};
use crate::error::ProvisioningResult;
use crate::events::EventRouter;
use crate::job_queue::{spawn_worker, InMemoryJobStore, JobDispatcher, JobQueue, JobStore};
use crate::linker::CustomerLinker;
use crate::mail::{HttpMailer, Mailer, OutboxMailer};
use crate::orchestrator::Orchestrator;
use crate::rate_limiter::RateLimiter;
use crate::store::{CommerceStore, InMemoryCommerceStore};
use crate::telemetry::{IntegrationLog, LogSink, LogStore};

/// Storage and delivery backends the service runs against.
pub struct Backends {
    pub config: Arc<dyn ConfigStore>,
    pub store: Arc<dyn CommerceStore>,
    pub cipher: Arc<dyn CredentialCipher>,
    pub mailer: Arc<dyn Mailer>,
    pub jobs: Arc<dyn JobStore>,
    pub log: Arc<dyn LogSink>,
    pub log_store: Arc<dyn LogStore>,
}

impl Backends {
    /// Process-local backends. Nothing survives a restart.
    pub fn in_memory(credential_key: &str, debug: bool) -> ProvisioningResult<Self> {
        let cipher: Arc<dyn CredentialCipher> = Arc::new(AesGcmCipher::from_secret(credential_key)?);
        let log = Arc::new(IntegrationLog::new(debug));
        Ok(Self {
            config: Arc::new(InMemoryConfigStore::new(cipher.clone())),
            store: Arc::new(InMemoryCommerceStore::new()),
            cipher,
            mailer: Arc::new(OutboxMailer::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            log: log.clone(),
            log_store: log,
        })
    }

    /// Postgres-backed stores and the HTTP mail relay. Must be called from
    /// within a tokio runtime.
    pub fn postgres(pool: PgPool, credential_key: &str, debug: bool) -> ProvisioningResult<Self> {
        let cipher: Arc<dyn CredentialCipher> = Arc::new(AesGcmCipher::from_secret(credential_key)?);
        let log = Arc::new(PgIntegrationLog::spawn(pool.clone(), debug));
        let mailer = HttpMailer::new(
            config::MAIL_RELAY_URL.clone(),
            config::MAIL_RELAY_TOKEN.clone(),
            config::MAIL_FROM.as_str(),
        )?;
        Ok(Self {
            config: Arc::new(PgConfigStore::new(pool.clone(), cipher.clone())),
            store: Arc::new(PgCommerceStore::new(pool.clone())),
            cipher,
            mailer: Arc::new(mailer),
            jobs: Arc::new(PgJobStore::new(pool)),
            log: log.clone(),
            log_store: log,
        })
    }
}

/// Every long-lived component, built once at start-up and shared by handle.
pub struct AppContext {
    pub config: Arc<dyn ConfigStore>,
    pub store: Arc<dyn CommerceStore>,
    pub log: Arc<dyn LogSink>,
    pub log_store: Arc<dyn LogStore>,
    pub api: Arc<dyn HostingApi>,
    pub linker: Arc<CustomerLinker>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<JobQueue>,
    pub dispatcher: Arc<JobDispatcher>,
    pub router: Arc<EventRouter>,
    pub rate_limiter: RateLimiter,
}

impl AppContext {
    /// Connects to Postgres, applies migrations and builds the context from
    /// the environment. Jobs left in flight by a previous process are put
    /// back on the queue.
    pub async fn from_env() -> anyhow::Result<Self> {
        let pool = db::connect(config::DATABASE_URL.as_str(), *config::DATABASE_MAX_CONNECTIONS).await?;
        if let Err(error) = sqlx::migrate!().run(&pool).await {
            if *config::ALLOW_MIGRATION_FAILURE {
                tracing::warn!(
                    ?error,
                    "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                );
            } else {
                return Err(error.into());
            }
        }

        let backends = Backends::postgres(pool, config::CREDENTIAL_KEY.as_str(), *config::DEBUG_MODE)?;
        if let (Some(api_url), Some(api_token)) = (
            config::PANEL_API_URL.as_ref(),
            config::PANEL_API_TOKEN.as_ref(),
        ) {
            backends
                .config
                .save_credentials(&ApiCredentials {
                    api_url: api_url.clone(),
                    api_token: api_token.clone(),
                })
                .await?;
            tracing::info!(%api_url, "remote API credentials loaded from environment");
        }
        let ctx = Self::build(backends, config::SITE_NAME.as_str()).await?;
        ctx.queue.recover().await?;
        Ok(ctx)
    }

    /// Wires the HTTP API client against `backends`.
    pub async fn build(backends: Backends, site_name: &str) -> ProvisioningResult<Self> {
        let rate_limiter = RateLimiter::new(backends.config.settings().await?.rate_limit);
        let api = Arc::new(HttpHostingApi::new(
            backends.config.clone(),
            rate_limiter.clone(),
            backends.log.clone(),
        )?);
        Ok(Self::with_api(backends, api, rate_limiter, site_name))
    }

    pub fn with_api(
        backends: Backends,
        api: Arc<dyn HostingApi>,
        rate_limiter: RateLimiter,
        site_name: &str,
    ) -> Self {
        let Backends {
            config,
            store,
            cipher,
            mailer,
            jobs,
            log,
            log_store,
        } = backends;

        let linker = Arc::new(CustomerLinker::new(api.clone(), store.clone(), log.clone()));
        let orchestrator = Arc::new(
            Orchestrator::new(
                api.clone(),
                linker.clone(),
                config.clone(),
                store.clone(),
                cipher,
                mailer,
                log.clone(),
            )
            .with_site_name(site_name),
        );
        let queue = Arc::new(JobQueue::new(jobs, config.clone(), log.clone()));
        let dispatcher = Arc::new(JobDispatcher::new(
            orchestrator.clone(),
            api.clone(),
            store.clone(),
            log.clone(),
        ));
        let router = Arc::new(EventRouter::new(
            queue.clone(),
            linker.clone(),
            config.clone(),
            store.clone(),
            log.clone(),
        ));

        Self {
            config,
            store,
            log,
            log_store,
            api,
            linker,
            orchestrator,
            queue,
            dispatcher,
            router,
            rate_limiter,
        }
    }

    /// Persists the update and applies a changed rate limit to the live bucket.
    pub async fn update_settings(&self, update: &SettingsUpdate) -> ProvisioningResult<Settings> {
        let previous = self.config.settings().await?;
        let settings = self.config.update_settings(update).await?;
        if settings.rate_limit != previous.rate_limit {
            self.rate_limiter.set_rate(settings.rate_limit);
            tracing::info!(rate_limit = settings.rate_limit, "rate limit updated");
        }
        Ok(settings)
    }

    pub fn spawn_worker(&self, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        spawn_worker(self.queue.clone(), self.dispatcher.clone(), poll_interval)
    }
}
