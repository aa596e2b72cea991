use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::client::HostingApi;
use crate::config_store::ConfigStore;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::models::{RemoteId, ServiceStatus};
use crate::orchestrator::Orchestrator;
use crate::store::{set_order_status, CommerceStore, OrderId};
use crate::telemetry::{LogContext, LogSink};

pub type JobId = Uuid;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Provision,
    Suspend,
    Unsuspend,
    Cancel,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Provision => "provision",
            JobKind::Suspend => "suspend",
            JobKind::Unsuspend => "unsuspend",
            JobKind::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Provision {
        order_id: OrderId,
    },
    Suspend {
        order_id: OrderId,
        service_id: RemoteId,
    },
    Unsuspend {
        order_id: OrderId,
        service_id: RemoteId,
    },
    Cancel {
        order_id: OrderId,
        service_id: RemoteId,
    },
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::Provision { .. } => JobKind::Provision,
            Job::Suspend { .. } => JobKind::Suspend,
            Job::Unsuspend { .. } => JobKind::Unsuspend,
            Job::Cancel { .. } => JobKind::Cancel,
        }
    }

    pub fn order_id(&self) -> OrderId {
        match self {
            Job::Provision { order_id }
            | Job::Suspend { order_id, .. }
            | Job::Unsuspend { order_id, .. }
            | Job::Cancel { order_id, .. } => *order_id,
        }
    }

    pub fn service_id(&self) -> Option<&RemoteId> {
        match self {
            Job::Provision { .. } => None,
            Job::Suspend { service_id, .. }
            | Job::Unsuspend { service_id, .. }
            | Job::Cancel { service_id, .. } => Some(service_id),
        }
    }

    /// At most one job per key may be pending or in flight.
    pub fn dedup_key(&self) -> (JobKind, OrderId) {
        (self.kind(), self.order_id())
    }

    fn log_context(&self) -> LogContext {
        let context = LogContext::event("queue")
            .order(self.order_id())
            .field("job_kind", self.kind().as_str());
        match self.service_id() {
            Some(service_id) => context.field("service_id", service_id),
            None => context,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobState::Pending),
            "in_flight" => Some(JobState::InFlight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub job: Job,
    pub state: JobState,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { attempt: u32, delay: Duration },
    Abandoned,
}

/// Storage behind the queue. Implementations make the duplicate check and
/// the insert one atomic step, and hand each ready job to exactly one claimer.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Returns `None` when a job with the same [`Job::dedup_key`] is pending or
    /// in flight.
    async fn insert(&self, job: &Job) -> ProvisioningResult<Option<QueuedJob>>;

    /// Marks the oldest ready pending job in flight, bumps its attempt count
    /// and returns it.
    async fn claim_next(&self) -> ProvisioningResult<Option<QueuedJob>>;

    async fn remove(&self, id: JobId) -> ProvisioningResult<bool>;

    /// Returns a failed job to pending, ready again after `delay`.
    async fn reschedule(&self, id: JobId, delay: Duration, error: &str) -> ProvisioningResult<()>;

    async fn list(&self) -> ProvisioningResult<Vec<QueuedJob>>;

    /// Puts jobs left in flight by a stopped worker back to pending.
    async fn release_in_flight(&self) -> ProvisioningResult<u64>;
}

struct StoredJob {
    queued: QueuedJob,
    ready_at: Instant,
}

/// Process-local [`JobStore`]. One lock covers the dedup check, the insert
/// and the claim.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<VecDeque<StoredJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<StoredJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> ProvisioningResult<Option<QueuedJob>> {
        let mut jobs = self.lock();
        if jobs
            .iter()
            .any(|stored| stored.queued.job.dedup_key() == job.dedup_key())
        {
            return Ok(None);
        }
        let queued = QueuedJob {
            id: Uuid::new_v4(),
            job: job.clone(),
            state: JobState::Pending,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        };
        jobs.push_back(StoredJob {
            queued: queued.clone(),
            ready_at: Instant::now(),
        });
        Ok(Some(queued))
    }

    async fn claim_next(&self) -> ProvisioningResult<Option<QueuedJob>> {
        let now = Instant::now();
        let mut jobs = self.lock();
        let Some(stored) = jobs
            .iter_mut()
            .find(|stored| stored.queued.state == JobState::Pending && stored.ready_at <= now)
        else {
            return Ok(None);
        };
        stored.queued.state = JobState::InFlight;
        stored.queued.attempts += 1;
        Ok(Some(stored.queued.clone()))
    }

    async fn remove(&self, id: JobId) -> ProvisioningResult<bool> {
        let mut jobs = self.lock();
        let index = jobs.iter().position(|stored| stored.queued.id == id);
        Ok(index.and_then(|index| jobs.remove(index)).is_some())
    }

    async fn reschedule(&self, id: JobId, delay: Duration, error: &str) -> ProvisioningResult<()> {
        let mut jobs = self.lock();
        if let Some(stored) = jobs.iter_mut().find(|stored| stored.queued.id == id) {
            stored.queued.state = JobState::Pending;
            stored.queued.last_error = Some(error.to_string());
            stored.ready_at = Instant::now() + delay;
        }
        Ok(())
    }

    async fn list(&self) -> ProvisioningResult<Vec<QueuedJob>> {
        Ok(self.lock().iter().map(|stored| stored.queued.clone()).collect())
    }

    async fn release_in_flight(&self) -> ProvisioningResult<u64> {
        let mut released = 0;
        for stored in self.lock().iter_mut() {
            if stored.queued.state == JobState::InFlight {
                stored.queued.state = JobState::Pending;
                released += 1;
            }
        }
        Ok(released)
    }
}

/// Executes claimed jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> ProvisioningResult<()>;
}

/// Queue with `(kind, order_id)` deduplication and linear retry backoff over
/// a [`JobStore`].
pub struct JobQueue {
    jobs: Arc<dyn JobStore>,
    config: Arc<dyn ConfigStore>,
    log: Arc<dyn LogSink>,
    retry_base_delay: Duration,
}

impl JobQueue {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        config: Arc<dyn ConfigStore>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            jobs,
            config,
            log,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Refused with `Duplicate` while a job with the same kind and order is
    /// pending or in flight.
    pub async fn enqueue(&self, job: Job) -> ProvisioningResult<JobId> {
        let context = job.log_context();
        let kind = job.kind();
        let Some(queued) = self.jobs.insert(&job).await? else {
            self.log
                .warning("Job already queued", context.status("duplicate"));
            return Err(ProvisioningError::duplicate(format!(
                "{} job already queued for order {}",
                kind.as_str(),
                job.order_id()
            )));
        };

        self.log.info(
            &format!("{} job queued", kind.as_str()),
            context.status("queued").field("job_id", queued.id.to_string()),
        );
        Ok(queued.id)
    }

    pub async fn claim_next(&self) -> ProvisioningResult<Option<QueuedJob>> {
        self.jobs.claim_next().await
    }

    pub async fn complete(&self, queued: &QueuedJob) -> ProvisioningResult<()> {
        if self.jobs.remove(queued.id).await? {
            self.log.info(
                &format!("{} job completed", queued.job.kind().as_str()),
                queued
                    .job
                    .log_context()
                    .status("completed")
                    .field("job_id", queued.id.to_string())
                    .field("attempts", queued.attempts),
            );
        }
        Ok(())
    }

    /// Schedules a retry or abandons the job, depending on the error and the
    /// configured attempt ceiling.
    pub async fn fail(
        &self,
        queued: &QueuedJob,
        err: &ProvisioningError,
    ) -> ProvisioningResult<FailureOutcome> {
        let max_attempts = self.config.settings().await?.retry_attempts;
        let attempts = queued.attempts;
        let outcome = if !err.is_retryable() || attempts >= max_attempts {
            self.jobs.remove(queued.id).await?;
            FailureOutcome::Abandoned
        } else {
            let delay = self.retry_base_delay * attempts.max(1);
            self.jobs
                .reschedule(queued.id, delay, &err.to_string())
                .await?;
            FailureOutcome::Retrying {
                attempt: attempts,
                delay,
            }
        };

        let context = queued
            .job
            .log_context()
            .field("job_id", queued.id.to_string())
            .field("attempts", attempts)
            .field("error", err.to_string())
            .field("error_kind", err.kind());
        match outcome {
            FailureOutcome::Retrying { delay, .. } => self.log.warning(
                &format!("{} job failed, retry scheduled", queued.job.kind().as_str()),
                context
                    .status("retrying")
                    .field("retry_in_secs", delay.as_secs()),
            ),
            FailureOutcome::Abandoned => self.log.error(
                &format!("{} job abandoned", queued.job.kind().as_str()),
                context.status("abandoned"),
            ),
        };
        Ok(outcome)
    }

    pub async fn pending_jobs(&self) -> ProvisioningResult<Vec<QueuedJob>> {
        self.jobs.list().await
    }

    /// Called once at start-up, before any worker claims.
    pub async fn recover(&self) -> ProvisioningResult<u64> {
        let released = self.jobs.release_in_flight().await?;
        if released > 0 {
            self.log.warning(
                "Interrupted jobs returned to the queue",
                LogContext::event("queue")
                    .status("recovered")
                    .field("released", released),
            );
        }
        Ok(released)
    }

    /// Runs ready jobs one after another until none is ready. Returns how many ran.
    pub async fn run_pending(&self, handler: &dyn JobHandler) -> ProvisioningResult<usize> {
        let mut ran = 0;
        while let Some(queued) = self.claim_next().await? {
            self.execute(handler, queued).await;
            ran += 1;
        }
        Ok(ran)
    }

    async fn execute(&self, handler: &dyn JobHandler, queued: QueuedJob) {
        let bookkeeping = match handler.handle(&queued.job).await {
            Ok(()) => self.complete(&queued).await,
            Err(err) => self.fail(&queued, &err).await.map(|_| ()),
        };
        if let Err(err) = bookkeeping {
            tracing::error!(?err, job_id = %queued.id, "could not record job result");
        }
    }
}

/// Polls the queue and runs each ready job on its own task.
pub fn spawn_worker(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            loop {
                let queued = match queue.claim_next().await {
                    Ok(Some(queued)) => queued,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(?err, "job claim failed");
                        break;
                    }
                };
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    queue.execute(handler.as_ref(), queued).await;
                });
            }
            sleep(poll_interval).await;
        }
    })
}

/// Routes jobs to the orchestrator or straight to the API client.
pub struct JobDispatcher {
    orchestrator: Arc<Orchestrator>,
    api: Arc<dyn HostingApi>,
    store: Arc<dyn CommerceStore>,
    log: Arc<dyn LogSink>,
}

impl JobDispatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        api: Arc<dyn HostingApi>,
        store: Arc<dyn CommerceStore>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            orchestrator,
            api,
            store,
            log,
        }
    }

    pub async fn dispatch(&self, job: &Job) -> ProvisioningResult<()> {
        let kind = job.kind().as_str();
        self.log.info(
            &format!("Processing {kind} job"),
            job.log_context().status("processing"),
        );

        let result = match job {
            Job::Provision { order_id } => self
                .orchestrator
                .provision_hosting(*order_id)
                .await
                .map(|_| ()),
            Job::Suspend {
                order_id,
                service_id,
            } => {
                self.run_action(
                    self.api.suspend_service(service_id),
                    *order_id,
                    ServiceStatus::Suspended,
                )
                .await
            }
            Job::Unsuspend {
                order_id,
                service_id,
            } => {
                self.run_action(
                    self.api.unsuspend_service(service_id),
                    *order_id,
                    ServiceStatus::Active,
                )
                .await
            }
            Job::Cancel {
                order_id,
                service_id,
            } => {
                self.run_action(
                    self.api.cancel_service(service_id),
                    *order_id,
                    ServiceStatus::Cancelled,
                )
                .await
            }
        };

        if let Err(err) = &result {
            self.log.error(
                &format!("{kind} job failed"),
                job.log_context()
                    .status("failed")
                    .field("error", err.to_string()),
            );
        }
        result
    }

    async fn run_action(
        &self,
        action: impl std::future::Future<Output = ProvisioningResult<()>>,
        order_id: OrderId,
        status: ServiceStatus,
    ) -> ProvisioningResult<()> {
        action.await?;
        set_order_status(self.store.as_ref(), order_id, &status).await
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn handle(&self, job: &Job) -> ProvisioningResult<()> {
        self.dispatch(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{InMemoryConfigStore, SettingsUpdate};
    use crate::crypto::AesGcmCipher;
    use crate::linker::CustomerLinker;
    use crate::mail::OutboxMailer;
    use crate::store::{InMemoryCommerceStore, ProvisioningRecord};
    use crate::telemetry::{IntegrationLog, LogFilter, LogLevel};
    use crate::testing::FakeHostingApi;

    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<Job>>,
        failures: Mutex<VecDeque<ProvisioningError>>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &Job) -> ProvisioningResult<()> {
            self.seen.lock().unwrap().push(job.clone());
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn config() -> Arc<InMemoryConfigStore> {
        Arc::new(InMemoryConfigStore::new(Arc::new(
            AesGcmCipher::from_secret("queue-test").unwrap(),
        )))
    }

    fn queue_with(config: Arc<InMemoryConfigStore>) -> JobQueue {
        JobQueue::new(
            Arc::new(InMemoryJobStore::new()),
            config,
            Arc::new(IntegrationLog::new(false)),
        )
    }

    fn suspend(order_id: OrderId) -> Job {
        Job::Suspend {
            order_id,
            service_id: RemoteId::from("svc-1"),
        }
    }

    #[tokio::test]
    async fn duplicate_provision_for_same_order_is_refused() {
        let queue = queue_with(config());
        queue.enqueue(Job::Provision { order_id: 5 }).await.unwrap();
        let err = queue
            .enqueue(Job::Provision { order_id: 5 })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Duplicate(_)));

        queue.enqueue(Job::Provision { order_id: 6 }).await.unwrap();
        queue.enqueue(suspend(5)).await.unwrap();
        assert!(queue.enqueue(suspend(5)).await.is_err());
        assert_eq!(queue.pending_jobs().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn queues_sharing_a_store_share_dedup() {
        let jobs: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let log = Arc::new(IntegrationLog::new(false));
        let first = JobQueue::new(jobs.clone(), config(), log.clone());
        let second = JobQueue::new(jobs, config(), log);

        first.enqueue(Job::Provision { order_id: 5 }).await.unwrap();
        assert!(second
            .enqueue(Job::Provision { order_id: 5 })
            .await
            .is_err());
        assert!(second.claim_next().await.unwrap().is_some());
        assert!(first.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_flight_jobs_still_block_duplicates() {
        let queue = queue_with(config());
        let id = queue.enqueue(Job::Provision { order_id: 5 }).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, JobState::InFlight);
        assert_eq!(claimed.attempts, 1);
        assert!(queue.claim_next().await.unwrap().is_none());
        assert!(queue.enqueue(Job::Provision { order_id: 5 }).await.is_err());

        queue.complete(&claimed).await.unwrap();
        assert!(queue.pending_jobs().await.unwrap().is_empty());
        assert!(queue.enqueue(Job::Provision { order_id: 5 }).await.is_ok());
    }

    #[tokio::test]
    async fn interrupted_jobs_are_recovered() {
        let queue = queue_with(config());
        queue.enqueue(Job::Provision { order_id: 5 }).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        assert!(queue.claim_next().await.unwrap().is_none());

        assert_eq!(queue.recover().await.unwrap(), 1);
        let reclaimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(queue.recover().await.unwrap(), 1);
        queue.complete(&reclaimed).await.unwrap();
        assert_eq!(queue.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn jobs_are_claimed_oldest_first() {
        let queue = queue_with(config());
        let first = queue.enqueue(Job::Provision { order_id: 1 }).await.unwrap();
        let second = queue.enqueue(Job::Provision { order_id: 2 }).await.unwrap();
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, first);
        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, second);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_back_off_linearly_then_are_abandoned() {
        let config = config();
        config
            .update_settings(&SettingsUpdate {
                retry_attempts: Some(3),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap();
        let queue = queue_with(config);
        let handler = ScriptedHandler::default();
        for _ in 0..3 {
            handler
                .failures
                .lock()
                .unwrap()
                .push_back(ProvisioningError::Transport("refused".into()));
        }
        queue.enqueue(Job::Provision { order_id: 5 }).await.unwrap();

        assert_eq!(queue.run_pending(&handler).await.unwrap(), 1);
        let pending = queue.pending_jobs().await.unwrap();
        assert_eq!(pending[0].state, JobState::Pending);
        assert_eq!(
            pending[0].last_error.as_deref(),
            Some("API request failed: refused")
        );
        assert_eq!(queue.run_pending(&handler).await.unwrap(), 0);
        assert!(queue.enqueue(Job::Provision { order_id: 5 }).await.is_err());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(queue.run_pending(&handler).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(queue.run_pending(&handler).await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(queue.run_pending(&handler).await.unwrap(), 1);

        assert!(queue.pending_jobs().await.unwrap().is_empty());
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_and_crypto_failures_are_not_retried() {
        let queue = queue_with(config());
        for (order_id, err) in [
            (9, ProvisioningError::validation("no mapping")),
            (10, ProvisioningError::Crypto("cipher unavailable".into())),
        ] {
            queue.enqueue(Job::Provision { order_id }).await.unwrap();
            let claimed = queue.claim_next().await.unwrap().unwrap();
            let outcome = queue.fail(&claimed, &err).await.unwrap();
            assert_eq!(outcome, FailureOutcome::Abandoned);
        }
        assert!(queue.pending_jobs().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_grows_with_attempts() {
        let queue = queue_with(config()).with_retry_base_delay(Duration::from_secs(10));
        queue.enqueue(Job::Provision { order_id: 1 }).await.unwrap();
        let err = ProvisioningError::Transport("reset".into());

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&claimed, &err).await.unwrap(),
            FailureOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&claimed, &err).await.unwrap(),
            FailureOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_secs(20)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_queue_in_background() {
        let queue = Arc::new(queue_with(config()));
        let handler = Arc::new(ScriptedHandler::default());
        queue.enqueue(Job::Provision { order_id: 1 }).await.unwrap();
        queue.enqueue(suspend(2)).await.unwrap();

        let worker = spawn_worker(queue.clone(), handler.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(handler.seen.lock().unwrap().len(), 2);
        assert!(queue.pending_jobs().await.unwrap().is_empty());
        worker.abort();
    }

    struct DispatchFixture {
        api: Arc<FakeHostingApi>,
        store: Arc<InMemoryCommerceStore>,
        log: Arc<IntegrationLog>,
        dispatcher: JobDispatcher,
    }

    fn dispatch_fixture() -> DispatchFixture {
        let api = Arc::new(FakeHostingApi::default());
        let store = Arc::new(InMemoryCommerceStore::new());
        let log = Arc::new(IntegrationLog::new(false));
        let cipher = Arc::new(AesGcmCipher::from_secret("dispatch-test").unwrap());
        let linker = Arc::new(CustomerLinker::new(api.clone(), store.clone(), log.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            api.clone(),
            linker,
            config(),
            store.clone(),
            cipher,
            Arc::new(OutboxMailer::new()),
            log.clone(),
        ));
        let dispatcher = JobDispatcher::new(orchestrator, api.clone(), store.clone(), log.clone());
        DispatchFixture {
            api,
            store,
            log,
            dispatcher,
        }
    }

    async fn status_of(store: &InMemoryCommerceStore, order_id: OrderId) -> Option<ServiceStatus> {
        ProvisioningRecord::load(store, order_id)
            .await
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn service_actions_update_order_status() {
        let fx = dispatch_fixture();
        fx.dispatcher.dispatch(&suspend(3)).await.unwrap();
        assert_eq!(
            status_of(&fx.store, 3).await,
            Some(ServiceStatus::Suspended)
        );

        let unsuspend = Job::Unsuspend {
            order_id: 3,
            service_id: RemoteId::from("svc-1"),
        };
        fx.dispatcher.dispatch(&unsuspend).await.unwrap();
        assert_eq!(status_of(&fx.store, 3).await, Some(ServiceStatus::Active));

        let cancel = Job::Cancel {
            order_id: 3,
            service_id: RemoteId::from("svc-1"),
        };
        fx.dispatcher.dispatch(&cancel).await.unwrap();
        assert_eq!(
            status_of(&fx.store, 3).await,
            Some(ServiceStatus::Cancelled)
        );
        assert_eq!(
            fx.api.calls(),
            vec![
                "suspend_service:svc-1".to_string(),
                "unsuspend_service:svc-1".to_string(),
                "cancel_service:svc-1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn handler_failures_are_returned() {
        let fx = dispatch_fixture();
        fx.api.fail_next(
            "suspend_service",
            ProvisioningError::Api {
                status: 503,
                message: "maintenance".into(),
                raw_body: String::new(),
            },
        );
        let err = fx.dispatcher.dispatch(&suspend(3)).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Api { status: 503, .. }));
        assert!(status_of(&fx.store, 3).await.is_none());

        let err = fx
            .dispatcher
            .dispatch(&Job::Provision { order_id: 404 })
            .await
            .unwrap_err();
        assert_eq!(err, ProvisioningError::validation("order not found"));
    }

    #[tokio::test]
    async fn handler_failure_is_logged_once() {
        let fx = dispatch_fixture();
        fx.api
            .fail_next("cancel_service", ProvisioningError::Transport("reset".into()));
        let cancel = Job::Cancel {
            order_id: 4,
            service_id: RemoteId::from("svc-4"),
        };
        fx.dispatcher.dispatch(&cancel).await.unwrap_err();

        let failures = fx.log.query(&LogFilter {
            event_type: Some("queue".into()),
            level: Some(LogLevel::Error),
            ..LogFilter::default()
        });
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, "failed");
        assert_eq!(failures[0].order_id, Some(4));
        assert_eq!(failures[0].context["error"], "API request failed: reset");
    }
}
