//! Consistent error responses.
//!
//! Every error body carries the same five fields so clients and log
//! pipelines can rely on the shape regardless of which layer failed.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use reportd_infra::service::ServiceError;

use crate::middleware::RequestContext;

pub fn json_error(
    ctx: &RequestContext,
    status: StatusCode,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "statusCode": status.as_u16(),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "path": ctx.path,
            "correlationId": ctx.correlation_id,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn service_error_to_response(
    ctx: &RequestContext,
    err: ServiceError,
) -> axum::response::Response {
    match err {
        ServiceError::NotFound => json_error(ctx, StatusCode::NOT_FOUND, "report not found"),
        ServiceError::Conflict(state) => json_error(
            ctx,
            StatusCode::CONFLICT,
            format!("report is {state}, artifact not available yet"),
        ),
        ServiceError::Validation(msg) => json_error(ctx, StatusCode::BAD_REQUEST, msg),
        ServiceError::Store(e) => {
            tracing::error!(error = %e, "store error while handling request");
            json_error(ctx, StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
