//! Admin operations: remote API credentials, settings, product mappings,
//! per-order provisioning state, integration log and queue views.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::app::AppContext;
use crate::config_store::{ApiCredentials, ProductMapping, Settings, SettingsUpdate};
use crate::error::{AppError, AppResult};
use crate::extractor::AdminUser;
use crate::job_queue::{Job, QueuedJob};
use crate::models::{ConnectionCheck, ServiceCredentials};
use crate::store::{OrderId, ProductId, ProvisioningRecord};
use crate::telemetry::{LogContext, LogEntry, LogFilter, LogSink, LogStore};

pub async fn test_connection(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Json<ConnectionCheck> {
    Json(ctx.api.test_connection().await)
}

pub async fn save_credentials(
    admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(credentials): Json<ApiCredentials>,
) -> AppResult<StatusCode> {
    ctx.config.save_credentials(&credentials).await?;
    ctx.log.info(
        "API credentials updated",
        LogContext::event("settings")
            .status("success")
            .field("actor", admin.user_id.as_str()),
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_settings(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> AppResult<Json<Settings>> {
    Ok(Json(ctx.config.settings().await?))
}

pub async fn update_settings(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(update): Json<SettingsUpdate>,
) -> AppResult<Json<Settings>> {
    Ok(Json(ctx.update_settings(&update).await?))
}

pub async fn list_mappings(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> AppResult<Json<BTreeMap<ProductId, ProductMapping>>> {
    Ok(Json(ctx.config.product_mappings().await?))
}

pub async fn save_mapping(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(product_id): Path<ProductId>,
    Json(mapping): Json<ProductMapping>,
) -> AppResult<StatusCode> {
    ctx.config.save_product_mapping(product_id, mapping).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_mapping(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(product_id): Path<ProductId>,
) -> AppResult<StatusCode> {
    if ctx.config.delete_product_mapping(product_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound)
    }
}

pub async fn get_order(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(order_id): Path<OrderId>,
) -> AppResult<Json<ProvisioningRecord>> {
    Ok(Json(ctx.orchestrator.provisioning_record(order_id).await?))
}

/// Clears the processed latch and queues provisioning again.
pub async fn retry_order(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(order_id): Path<OrderId>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    ctx.orchestrator.reset_for_retry(order_id).await?;
    let job_id = ctx.queue.enqueue(Job::Provision { order_id }).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

pub async fn reveal_credentials(
    admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Path(order_id): Path<OrderId>,
) -> AppResult<Json<ServiceCredentials>> {
    let credentials = ctx
        .orchestrator
        .reveal_credentials(order_id, &admin.actor())
        .await?;
    Ok(Json(credentials))
}

#[derive(Serialize)]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub total: u64,
}

pub async fn list_logs(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(filter): Query<LogFilter>,
) -> AppResult<Json<LogPage>> {
    Ok(Json(LogPage {
        entries: ctx.log_store.query(&filter).await?,
        total: ctx.log_store.count(&filter).await?,
    }))
}

/// Applies the configured retention window.
pub async fn purge_logs(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> AppResult<Json<serde_json::Value>> {
    let retention_days = ctx.config.settings().await?.log_retention_days;
    let deleted = ctx
        .log_store
        .purge_older_than(retention_days, Utc::now())
        .await?;
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn list_jobs(
    _admin: AdminUser,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> AppResult<Json<Vec<QueuedJob>>> {
    Ok(Json(ctx.queue.pending_jobs().await?))
}
