//! The report entity: submission params, lifecycle states, lease fields.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ReportId, TenantId, WorkerId};

/// The closed set of report kinds the service produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportType {
    UsageSummary,
    BillingExport,
    AuditSnapshot,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::UsageSummary => "USAGE_SUMMARY",
            ReportType::BillingExport => "BILLING_EXPORT",
            ReportType::AuditSnapshot => "AUDIT_SNAPSHOT",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "USAGE_SUMMARY" => Ok(ReportType::UsageSummary),
            "BILLING_EXPORT" => Ok(ReportType::BillingExport),
            "AUDIT_SNAPSHOT" => Ok(ReportType::AuditSnapshot),
            other => Err(DomainError::validation(format!(
                "unknown report type: {other}"
            ))),
        }
    }
}

impl core::fmt::Display for ReportType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format of the produced artifact. Fully determines the MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "CSV",
            OutputFormat::Json => "JSON",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "text/csv",
            OutputFormat::Json => "application/json",
        }
    }
}

/// Report lifecycle state.
///
/// `Completed` and `Failed` are terminal; nothing transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReportState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ReportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportState::Pending => "PENDING",
            ReportState::Running => "RUNNING",
            ReportState::Completed => "COMPLETED",
            ReportState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "PENDING" => Ok(ReportState::Pending),
            "RUNNING" => Ok(ReportState::Running),
            "COMPLETED" => Ok(ReportState::Completed),
            "FAILED" => Ok(ReportState::Failed),
            other => Err(DomainError::validation(format!(
                "unknown report state: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportState::Completed | ReportState::Failed)
    }
}

impl core::fmt::Display for ReportState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured submission payload: the date range to cover and the output
/// format. Two submissions are semantically equivalent when tenant, type and
/// params all match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportParams {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub format: OutputFormat,
}

impl ReportParams {
    pub fn validate(&self) -> DomainResult<()> {
        if self.from > self.to {
            return Err(DomainError::validation(format!(
                "date range is inverted: {} > {}",
                self.from, self.to
            )));
        }
        Ok(())
    }
}

/// A submission's lifecycle record.
///
/// While `state == Running` the report carries a lease (`locked_at`,
/// `locked_by`); in every other state both lease fields are absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub tenant_id: TenantId,
    pub kind: ReportType,
    pub params: ReportParams,
    pub state: ReportState,
    pub attempts: u32,
    pub idempotency_key: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    /// Create a fresh `PENDING` report.
    pub fn new(
        tenant_id: TenantId,
        kind: ReportType,
        params: ReportParams,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReportId::new(),
            tenant_id,
            kind,
            params,
            state: ReportState::Pending,
            attempts: 0,
            idempotency_key,
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_lease(&self) -> bool {
        self.locked_at.is_some() && self.locked_by.is_some()
    }

    /// Whether this report's lease predates `cutoff` (presumed crashed holder).
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        matches!(self.locked_at, Some(at) if at < cutoff)
    }

    /// Claim transition: `PENDING -> RUNNING` with a fresh lease.
    pub fn mark_running(&mut self, worker: &WorkerId, now: DateTime<Utc>) {
        self.state = ReportState::Running;
        self.locked_at = Some(now);
        self.locked_by = Some(worker.clone());
        self.updated_at = now;
    }

    /// Terminal success. `attempts` is the value the worker computed; the
    /// convergence branch passes the old count through unchanged.
    pub fn mark_completed(&mut self, attempts: u32, now: DateTime<Utc>) {
        self.state = ReportState::Completed;
        self.attempts = attempts;
        self.clear_lease(now);
    }

    /// Failed attempt with budget left: back to `PENDING` for a retry.
    pub fn mark_retrying(&mut self, attempts: u32, now: DateTime<Utc>) {
        self.state = ReportState::Pending;
        self.attempts = attempts;
        self.clear_lease(now);
    }

    /// Failed attempt with the budget exhausted. Terminal.
    pub fn mark_failed(&mut self, attempts: u32, now: DateTime<Utc>) {
        self.state = ReportState::Failed;
        self.attempts = attempts;
        self.clear_lease(now);
    }

    /// Stale-lease recovery: back to `PENDING`, attempts untouched (the
    /// crashed holder never closed its attempt).
    pub fn release_lease(&mut self, now: DateTime<Utc>) {
        self.state = ReportState::Pending;
        self.clear_lease(now);
    }

    fn clear_lease(&mut self, now: DateTime<Utc>) {
        self.locked_at = None;
        self.locked_by = None;
        self.updated_at = now;
    }
}
