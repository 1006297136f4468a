use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use reportd_core::{ReportId, TenantId};
use reportd_infra::store::NewReport;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::middleware::RequestContext;

/// Longest accepted `Idempotency-Key` value.
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// `POST /reports` - submit a report request.
///
/// 201 when this submission created the job, 200 when an existing job (key
/// hit or semantic hit) is returned.
pub async fn submit_report(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    body: Result<Json<dto::SubmitReportRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(&ctx, StatusCode::BAD_REQUEST, rejection.body_text())
        }
    };

    if body.tenant.trim().is_empty() {
        return errors::json_error(&ctx, StatusCode::BAD_REQUEST, "tenant must not be empty");
    }

    let idempotency_key = match headers.get("idempotency-key") {
        None => None,
        Some(value) => match value.to_str() {
            Ok(key) if key.is_empty() => None,
            Ok(key) if key.len() <= MAX_IDEMPOTENCY_KEY_LEN => Some(key.to_string()),
            Ok(_) => {
                return errors::json_error(
                    &ctx,
                    StatusCode::BAD_REQUEST,
                    format!("Idempotency-Key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"),
                )
            }
            Err(_) => {
                return errors::json_error(
                    &ctx,
                    StatusCode::BAD_REQUEST,
                    "Idempotency-Key must be valid UTF-8",
                )
            }
        },
    };

    let submission = NewReport {
        tenant_id: TenantId::new(body.tenant),
        kind: body.kind,
        params: body.params,
        idempotency_key,
    };

    let resolution = match services.broker.resolve(submission).await {
        Ok(resolution) => resolution,
        Err(e) => return errors::service_error_to_response(&ctx, e),
    };

    // Re-read for the canonical row plus artifact metadata (a semantic hit
    // on a completed report carries its artifact).
    let (report, artifact) = match services.reports.get(resolution.report.id).await {
        Ok(found) => found,
        Err(e) => return errors::service_error_to_response(&ctx, e),
    };

    let status = if resolution.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(dto::ReportResponse::from_report(report, artifact))).into_response()
}

/// `GET /reports/:id` - report representation; 404 when unknown.
pub async fn get_report(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: ReportId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(&ctx, StatusCode::BAD_REQUEST, "invalid report id"),
    };

    match services.reports.get(id).await {
        Ok((report, artifact)) => (
            StatusCode::OK,
            Json(dto::ReportResponse::from_report(report, artifact)),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(&ctx, e),
    }
}

/// `GET /reports/:id/download` - stream the artifact bytes.
///
/// 409 while the report is not `COMPLETED`, 404 when report or artifact is
/// missing.
pub async fn download_artifact(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: ReportId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(&ctx, StatusCode::BAD_REQUEST, "invalid report id"),
    };

    match services.reports.artifact(id).await {
        Ok((content, content_type)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"report-{id}\""),
                ),
            ],
            content,
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(&ctx, e),
    }
}
