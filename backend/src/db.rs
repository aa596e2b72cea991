//! Postgres implementations of the storage seams: storefront snapshots and
//! metadata, configuration, the job queue and the integration log.

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::{ProvisioningError, ProvisioningResult};

pub mod commerce;
pub mod config;
pub mod jobs;
pub mod logs;

pub use commerce::PgCommerceStore;
pub use config::PgConfigStore;
pub use jobs::PgJobStore;
pub use logs::PgIntegrationLog;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Storefront ids are unsigned; Postgres keeps them in `BIGINT`.
pub(crate) fn db_id(id: u64) -> ProvisioningResult<i64> {
    i64::try_from(id).map_err(|_| ProvisioningError::validation(format!("id {id} is out of range")))
}

pub(crate) fn app_id(id: i64) -> ProvisioningResult<u64> {
    u64::try_from(id).map_err(|_| ProvisioningError::Storage(format!("negative id {id} in storage")))
}

pub(crate) fn corrupt(what: &str, err: impl std::fmt::Display) -> ProvisioningError {
    ProvisioningError::Storage(format!("corrupt {what}: {err}"))
}
