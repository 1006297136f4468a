use axum::{
    routing::{get, post},
    Router,
};

pub mod reports;
pub mod system;
pub mod tenants;

/// Router for the report resources (`/health` is wired separately).
pub fn router() -> Router {
    Router::new()
        .route("/reports", post(reports::submit_report))
        .route("/reports/:id", get(reports::get_report))
        .route("/reports/:id/download", get(reports::download_artifact))
        .route("/tenants/:tenant/reports", get(tenants::list_reports))
}
