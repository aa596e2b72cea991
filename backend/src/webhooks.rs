use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::error;

use crate::app::AppContext;
use crate::config;
use crate::error::{AppError, AppResult};
use crate::events::{BillingEvent, RouteOutcome};

pub const SIGNATURE_HEADER: &str = "x-signature";

/// `sha256=<hex>` HMAC of `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can use any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn verify_signature(secret: &[u8], headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
    let sig = headers
        .get(SIGNATURE_HEADER)
        .ok_or(AppError::BadRequest("Missing signature".into()))?
        .to_str()
        .map_err(|e| {
            error!(?e, "Signature parse error");
            AppError::BadRequest("Bad signature".into())
        })?;
    let digest = sig
        .strip_prefix("sha256=")
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(AppError::Unauthorized)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can use any key length");
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| AppError::Unauthorized)
}

/// key: webhooks-billing -> event router entrypoint
pub async fn billing_webhook(
    Extension(ctx): Extension<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<(StatusCode, Json<RouteOutcome>)> {
    verify_signature(config::WEBHOOK_SECRET.as_bytes(), &headers, &body)?;
    let event: BillingEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid event payload: {e}")))?;

    let outcome = ctx.router.route(&event).await?;
    let status = match outcome {
        RouteOutcome::Enqueued(_) => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    tracing::info!(?event, ?outcome, "billing event routed");
    Ok((status, Json(outcome)))
}
