//! Request/response DTOs and JSON mapping.

use serde::{Deserialize, Serialize};

use reportd_core::{
    ArtifactMeta, Report, ReportParams, ReportState, ReportType,
};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitReportRequest {
    pub tenant: String,
    #[serde(rename = "type")]
    pub kind: ReportType,
    pub params: ReportParams,
}

/// Query string for tenant listings. Enum values arrive as raw strings and
/// are parsed in the handler so that an unknown value maps to 400 with the
/// canonical error body.
#[derive(Debug, Default, Deserialize)]
pub struct ListReportsQuery {
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetaResponse {
    pub id: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: String,
}

impl From<ArtifactMeta> for ArtifactMetaResponse {
    fn from(meta: ArtifactMeta) -> Self {
        Self {
            id: meta.id.to_string(),
            content_type: meta.content_type,
            size_bytes: meta.size_bytes,
            checksum: meta.checksum,
            created_at: meta.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub id: String,
    pub tenant: String,
    #[serde(rename = "type")]
    pub kind: ReportType,
    pub params: ReportParams,
    pub state: ReportState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactMetaResponse>,
}

impl ReportResponse {
    pub fn from_report(report: Report, artifact: Option<ArtifactMeta>) -> Self {
        Self {
            id: report.id.to_string(),
            tenant: report.tenant_id.to_string(),
            kind: report.kind,
            params: report.params,
            state: report.state,
            attempts: report.attempts,
            idempotency_key: report.idempotency_key,
            created_at: report.created_at.to_rfc3339(),
            updated_at: report.updated_at.to_rfc3339(),
            artifact: artifact.map(ArtifactMetaResponse::from),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListReportsResponse {
    pub reports: Vec<ReportResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}
