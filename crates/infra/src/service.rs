//! Report service: create with semantic deduplication, status reads, tenant
//! listings, artifact retrieval.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use reportd_core::{ArtifactMeta, Report, ReportId, ReportState, TenantId};

use crate::store::{ListFilter, NewReport, Page, ReportStore, StoreError};

/// Default page size for tenant listings.
pub const DEFAULT_PAGE_SIZE: i64 = 20;
/// Upper bound a single page may request.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Service-level error; the HTTP layer maps these onto status codes.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("report not found")]
    NotFound,

    /// The report exists but is not `COMPLETED`; the client must poll.
    #[error("report is {0}, artifact not available")]
    Conflict(ReportState),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Application service over the report store. Cheap to clone; all instances
/// share the same store handle.
#[derive(Clone)]
pub struct ReportService {
    store: Arc<dyn ReportStore>,
}

impl ReportService {
    pub fn new(store: Arc<dyn ReportStore>) -> Self {
        Self { store }
    }

    /// Create operation with the semantic lookup in front: an existing
    /// `COMPLETED` or `RUNNING` report with identical `(tenant, type,
    /// params)` is reused instead of inserting a duplicate. Returns the
    /// report and whether a row was inserted.
    ///
    /// Two concurrent keyless submissions can still both insert; the worker
    /// convergence protocol keeps that safe, at the cost of wasted compute.
    pub async fn find_or_create(&self, new: NewReport) -> Result<(Report, bool), ServiceError> {
        new.params
            .validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;

        if let Some(existing) = self
            .store
            .find_equivalent(&new.tenant_id, new.kind, &new.params)
            .await?
        {
            debug!(report_id = %existing.id, state = %existing.state, "semantic hit");
            return Ok((existing, false));
        }

        let report = self.store.insert_report(new).await?;
        Ok((report, true))
    }

    /// Report plus artifact metadata (never the content).
    pub async fn get(&self, id: ReportId) -> Result<(Report, Option<ArtifactMeta>), ServiceError> {
        let report = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound)?;
        let artifact = self.store.find_artifact_meta(id).await?;
        Ok((report, artifact))
    }

    /// Tenant listing, newest first. `limit` defaults to
    /// [`DEFAULT_PAGE_SIZE`] and must stay within `1..=MAX_PAGE_SIZE`.
    pub async fn list(
        &self,
        tenant_id: &TenantId,
        filter: &ListFilter,
        limit: Option<i64>,
        cursor: Option<ReportId>,
    ) -> Result<Page, ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ServiceError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        match self.store.list_by_tenant(tenant_id, filter, limit, cursor).await {
            Ok(page) => Ok(page),
            Err(StoreError::InvalidCursor(id)) => Err(ServiceError::Validation(format!(
                "unknown cursor: {id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Artifact content for a completed report: 404 when the report or the
    /// artifact row is missing, 409 while the report is not `COMPLETED`.
    pub async fn artifact(&self, id: ReportId) -> Result<(Vec<u8>, String), ServiceError> {
        let report = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound)?;

        if report.state != ReportState::Completed {
            return Err(ServiceError::Conflict(report.state));
        }

        let artifact = self
            .store
            .find_artifact(id)
            .await?
            .ok_or(ServiceError::NotFound)?;

        Ok((artifact.content, artifact.content_type))
    }

    /// Store liveness, used by the health endpoint.
    pub async fn ping(&self) -> Result<(), ServiceError> {
        Ok(self.store.ping().await?)
    }
}
