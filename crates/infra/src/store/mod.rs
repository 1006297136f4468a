//! Report storage: the transactional adapter the kernel coordinates through.
//!
//! All cross-worker coordination flows through this interface. The two
//! signals the exactly-once protocol depends on - a colliding idempotency
//! key and a colliding artifact row - are first-class variants of
//! [`StoreError`], distinguishable from generic failure; everything else is
//! surfaced unchanged as `Backend`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use reportd_core::{
    Artifact, ArtifactMeta, Execution, ExecutionId, Report, ReportId, ReportParams, ReportState,
    ReportType, TenantId, WorkerId,
};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryReportStore;
pub use postgres::PostgresReportStore;

/// Insert payload for a new report row. The store assigns the id and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewReport {
    pub tenant_id: TenantId,
    pub kind: ReportType,
    pub params: ReportParams,
    pub idempotency_key: Option<String>,
}

/// Insert payload for an artifact row. `size_bytes` is derived from the
/// content length.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub report_id: ReportId,
    pub content_type: String,
    pub content: Vec<u8>,
    pub checksum: String,
}

/// Optional filters for tenant listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<ReportState>,
    pub kind: Option<ReportType>,
}

/// One page of a tenant listing, newest first. `next_cursor` is present iff
/// another page exists; pass it back to continue.
#[derive(Debug, Clone)]
pub struct Page {
    pub reports: Vec<Report>,
    pub next_cursor: Option<ReportId>,
}

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The idempotency key is already attached to another report.
    #[error("idempotency key already in use")]
    DuplicateIdempotencyKey,

    /// The report already has an artifact row (the convergence signal).
    #[error("report already has an artifact")]
    DuplicateArtifact,

    #[error("report not found: {0}")]
    NotFound(ReportId),

    /// A list cursor referencing a report this store has never seen.
    #[error("unknown cursor: {0}")]
    InvalidCursor(ReportId),

    /// Transient or fatal backend failure, surfaced unchanged.
    #[error("storage error: {0}")]
    Backend(String),
}

/// Transactional CRUD over the three report tables plus the SKIP-LOCKED
/// claim query. Object-safe so the API, broker and worker can share one
/// `Arc<dyn ReportStore>` handle.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Insert a new `PENDING` report, assigning its id.
    async fn insert_report(&self, new: NewReport) -> Result<Report, StoreError>;

    async fn find_by_id(&self, id: ReportId) -> Result<Option<Report>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Report>, StoreError>;

    /// Find an existing report with identical `(tenant, type, params)` in
    /// `COMPLETED` or `RUNNING`, preferring `COMPLETED`, then most recent
    /// `created_at`.
    async fn find_equivalent(
        &self,
        tenant_id: &TenantId,
        kind: ReportType,
        params: &ReportParams,
    ) -> Result<Option<Report>, StoreError>;

    /// Attach an idempotency key to a report that currently has none.
    /// A no-op if a concurrent writer got there first with another key.
    async fn backfill_idempotency_key(&self, id: ReportId, key: &str) -> Result<(), StoreError>;

    /// Atomically claim the oldest eligible `PENDING` report: rows locked by
    /// concurrent claim transactions are skipped, the winner is transitioned
    /// to `RUNNING` with a fresh lease before the transaction commits.
    async fn claim_next_pending(
        &self,
        stale_cutoff: DateTime<Utc>,
        worker: &WorkerId,
    ) -> Result<Option<Report>, StoreError>;

    /// Insert the artifact for a report. At most one ever succeeds per
    /// report; later attempts observe `DuplicateArtifact`.
    async fn insert_artifact(&self, new: NewArtifact) -> Result<Artifact, StoreError>;

    async fn find_artifact(&self, report_id: ReportId) -> Result<Option<Artifact>, StoreError>;

    async fn find_artifact_meta(
        &self,
        report_id: ReportId,
    ) -> Result<Option<ArtifactMeta>, StoreError>;

    /// Transition to `COMPLETED`, clearing the lease and writing the
    /// caller-computed attempts value.
    async fn mark_completed(&self, id: ReportId, attempts: u32) -> Result<(), StoreError>;

    /// Transition to `PENDING` (retry) or `FAILED`, clearing the lease and
    /// writing the caller-computed attempts value.
    async fn mark_failed_or_retry(
        &self,
        id: ReportId,
        attempts: u32,
        state: ReportState,
    ) -> Result<(), StoreError>;

    /// Bulk-reset `RUNNING` rows whose lease predates `cutoff` back to
    /// `PENDING` with the lease cleared. Attempts are untouched. Returns the
    /// number of recovered rows.
    async fn recover_stale_leases(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Page through a tenant's reports, `created_at DESC` with id as the
    /// tie-breaker; `cursor` is the last id of the previous page.
    async fn list_by_tenant(
        &self,
        tenant_id: &TenantId,
        filter: &ListFilter,
        limit: i64,
        cursor: Option<ReportId>,
    ) -> Result<Page, StoreError>;

    /// Open an execution audit row for an attempt (1-based ordinal).
    async fn create_execution(
        &self,
        report_id: ReportId,
        attempt: u32,
    ) -> Result<ExecutionId, StoreError>;

    /// Close an execution row, recording the error if the attempt failed.
    async fn close_execution(
        &self,
        id: ExecutionId,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Execution history for a report, oldest attempt first.
    async fn list_executions(&self, report_id: ReportId) -> Result<Vec<Execution>, StoreError>;

    /// Trivial liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
