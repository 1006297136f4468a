use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use reportd_core::{ReportId, ReportState, ReportType, TenantId};
use reportd_infra::store::ListFilter;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::middleware::RequestContext;

/// `GET /tenants/:tenant/reports` - page through a tenant's reports, newest
/// first. Query: `state`, `type`, `limit`, `cursor`.
pub async fn list_reports(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(tenant): Path<String>,
    query: Result<Query<dto::ListReportsQuery>, QueryRejection>,
) -> axum::response::Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return errors::json_error(&ctx, StatusCode::BAD_REQUEST, rejection.body_text())
        }
    };

    let state = match query.state.as_deref().map(ReportState::parse).transpose() {
        Ok(state) => state,
        Err(e) => return errors::json_error(&ctx, StatusCode::BAD_REQUEST, e.to_string()),
    };
    let kind = match query.kind.as_deref().map(ReportType::parse).transpose() {
        Ok(kind) => kind,
        Err(e) => return errors::json_error(&ctx, StatusCode::BAD_REQUEST, e.to_string()),
    };
    let cursor: Option<ReportId> = match query.cursor.as_deref().map(str::parse).transpose() {
        Ok(cursor) => cursor,
        Err(_) => return errors::json_error(&ctx, StatusCode::BAD_REQUEST, "invalid cursor"),
    };

    let tenant = TenantId::new(tenant);
    let filter = ListFilter { state, kind };

    match services
        .reports
        .list(&tenant, &filter, query.limit, cursor)
        .await
    {
        Ok(page) => {
            let response = dto::ListReportsResponse {
                reports: page
                    .reports
                    .into_iter()
                    .map(|r| dto::ReportResponse::from_report(r, None))
                    .collect(),
                next_cursor: page.next_cursor.map(|id| id.to_string()),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => errors::service_error_to_response(&ctx, e),
    }
}
