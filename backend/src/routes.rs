use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Extension, Router,
};

use crate::app::AppContext;
use crate::{admin, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/events", post(webhooks::billing_webhook))
        .route("/api/admin/connection", get(admin::test_connection))
        .route("/api/admin/credentials", put(admin::save_credentials))
        .route(
            "/api/admin/settings",
            get(admin::get_settings).put(admin::update_settings),
        )
        .route("/api/admin/mappings", get(admin::list_mappings))
        .route(
            "/api/admin/mappings/:product_id",
            put(admin::save_mapping).delete(admin::delete_mapping),
        )
        .route("/api/admin/orders/:id", get(admin::get_order))
        .route("/api/admin/orders/:id/retry", post(admin::retry_order))
        .route(
            "/api/admin/orders/:id/credentials",
            post(admin::reveal_credentials),
        )
        .route("/api/admin/logs", get(admin::list_logs))
        .route("/api/admin/logs/purge", post(admin::purge_logs))
        .route("/api/admin/jobs", get(admin::list_jobs))
}

pub async fn root() -> &'static str {
    "Hosting Provisioner API"
}

/// Liveness route plus [`api_routes`], with the shared context attached.
pub fn app(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(ctx))
}
