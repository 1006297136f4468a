use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::middleware::RequestContext;

/// `GET /health` - 200 when the store answers a trivial probe, 503 otherwise.
/// Unhealthy storage does not take down the other endpoints.
pub async fn health(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> axum::response::Response {
    match services.reports.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok" })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "health probe failed");
            errors::json_error(&ctx, StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}
