//! PostgreSQL-backed report store.
//!
//! All coordination between API instances and workers happens through this
//! schema: the `UNIQUE` constraints on `reports.idempotency_key` and
//! `report_artifacts.report_id` carry the exactly-once guarantees, and the
//! claim query relies on `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! serialize against each other on unrelated rows.
//!
//! ## Error mapping
//!
//! | SQLx error | PostgreSQL code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation on insert_report / backfill) | `23505` | `DuplicateIdempotencyKey` |
//! | Database (unique violation on insert_artifact) | `23505` | `DuplicateArtifact` |
//! | anything else | any | `Backend` (surfaced unchanged) |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use reportd_core::{
    Artifact, ArtifactId, ArtifactMeta, Execution, ExecutionId, Report, ReportId, ReportParams,
    ReportState, ReportType, TenantId, WorkerId,
};

use super::{ListFilter, NewArtifact, NewReport, Page, ReportStore, StoreError};

/// Production store over a shared [`PgPool`].
#[derive(Debug, Clone)]
pub struct PostgresReportStore {
    pool: PgPool,
}

impl PostgresReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const REPORT_COLUMNS: &str = "id, tenant_id, type, params, state, attempts, idempotency_key, \
     locked_at, locked_by, created_at, updated_at";

#[async_trait]
impl ReportStore for PostgresReportStore {
    #[instrument(skip(self, new), fields(tenant_id = %new.tenant_id, kind = %new.kind), err)]
    async fn insert_report(&self, new: NewReport) -> Result<Report, StoreError> {
        let id = ReportId::new();
        let now = Utc::now();
        let params = params_json(&new.params)?;

        sqlx::query(
            r#"
            INSERT INTO reports (
                id, tenant_id, type, params, state, attempts, idempotency_key,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $7)
            "#,
        )
        .bind(id.as_uuid())
        .bind(new.tenant_id.as_str())
        .bind(new.kind.as_str())
        .bind(&params)
        .bind(ReportState::Pending.as_str())
        .bind(new.idempotency_key.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateIdempotencyKey
            } else {
                map_sqlx_error("insert_report", e)
            }
        })?;

        Ok(Report {
            id,
            tenant_id: new.tenant_id,
            kind: new.kind,
            params: new.params,
            state: ReportState::Pending,
            attempts: 0,
            idempotency_key: new.idempotency_key,
            locked_at: None,
            locked_by: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_id(&self, id: ReportId) -> Result<Option<Report>, StoreError> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(Report::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Report>, StoreError> {
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.map(Report::try_from).transpose()
    }

    async fn find_equivalent(
        &self,
        tenant_id: &TenantId,
        kind: ReportType,
        params: &ReportParams,
    ) -> Result<Option<Report>, StoreError> {
        let params = params_json(params)?;

        // COMPLETED beats RUNNING; among equals, the most recent submission.
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            r#"
            SELECT {REPORT_COLUMNS}
            FROM reports
            WHERE tenant_id = $1 AND type = $2 AND params = $3
              AND state IN ('COMPLETED', 'RUNNING')
            ORDER BY CASE WHEN state = 'COMPLETED' THEN 0 ELSE 1 END, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id.as_str())
        .bind(kind.as_str())
        .bind(&params)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_equivalent", e))?;

        row.map(Report::try_from).transpose()
    }

    async fn backfill_idempotency_key(&self, id: ReportId, key: &str) -> Result<(), StoreError> {
        // The IS NULL guard makes this a no-op when a concurrent writer
        // already keyed the row; the caller re-reads by key either way.
        sqlx::query(
            r#"
            UPDATE reports
            SET idempotency_key = $2, updated_at = $3
            WHERE id = $1 AND idempotency_key IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateIdempotencyKey
            } else {
                map_sqlx_error("backfill_idempotency_key", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn claim_next_pending(
        &self,
        stale_cutoff: DateTime<Utc>,
        worker: &WorkerId,
    ) -> Result<Option<Report>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_begin", e))?;

        // SKIP LOCKED: rows mid-claim by a concurrent transaction are
        // invisible here, so two workers never receive the same report.
        let row = sqlx::query_as::<_, ReportRow>(&format!(
            r#"
            SELECT {REPORT_COLUMNS}
            FROM reports
            WHERE state = 'PENDING' AND (locked_at IS NULL OR locked_at < $1)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(stale_cutoff)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_select", e))?;

        let Some(row) = row else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("claim_commit", e))?;
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE reports
            SET state = 'RUNNING', locked_at = $2, locked_by = $3, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(now)
        .bind(worker.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_commit", e))?;

        let mut report = Report::try_from(row)?;
        report.mark_running(worker, now);
        Ok(Some(report))
    }

    #[instrument(skip(self, new), fields(report_id = %new.report_id), err)]
    async fn insert_artifact(&self, new: NewArtifact) -> Result<Artifact, StoreError> {
        let id = ArtifactId::new();
        let now = Utc::now();
        let size_bytes = new.content.len() as i64;

        sqlx::query(
            r#"
            INSERT INTO report_artifacts (
                id, report_id, content_type, content, size_bytes, checksum, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id.as_uuid())
        .bind(new.report_id.as_uuid())
        .bind(&new.content_type)
        .bind(&new.content)
        .bind(size_bytes)
        .bind(&new.checksum)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // The UNIQUE(report_id) collision is the convergence signal.
            if is_unique_violation(&e) {
                StoreError::DuplicateArtifact
            } else {
                map_sqlx_error("insert_artifact", e)
            }
        })?;

        Ok(Artifact {
            id,
            report_id: new.report_id,
            content_type: new.content_type,
            content: new.content,
            size_bytes,
            checksum: new.checksum,
            created_at: now,
        })
    }

    async fn find_artifact(&self, report_id: ReportId) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT id, report_id, content_type, content, size_bytes, checksum, created_at
            FROM report_artifacts
            WHERE report_id = $1
            "#,
        )
        .bind(report_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_artifact", e))?;

        Ok(row.map(Artifact::from))
    }

    async fn find_artifact_meta(
        &self,
        report_id: ReportId,
    ) -> Result<Option<ArtifactMeta>, StoreError> {
        let row = sqlx::query_as::<_, ArtifactMetaRow>(
            r#"
            SELECT id, report_id, content_type, size_bytes, checksum, created_at
            FROM report_artifacts
            WHERE report_id = $1
            "#,
        )
        .bind(report_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_artifact_meta", e))?;

        Ok(row.map(ArtifactMeta::from))
    }

    async fn mark_completed(&self, id: ReportId, attempts: u32) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET state = 'COMPLETED', attempts = $2, locked_at = NULL, locked_by = NULL,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(attempts as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_failed_or_retry(
        &self,
        id: ReportId,
        attempts: u32,
        state: ReportState,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET state = $2, attempts = $3, locked_at = NULL, locked_by = NULL, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(state.as_str())
        .bind(attempts as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed_or_retry", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn recover_stale_leases(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // Attempts are untouched: the crashed holder never closed its attempt.
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET state = 'PENDING', locked_at = NULL, locked_by = NULL, updated_at = $2
            WHERE state = 'RUNNING' AND locked_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stale_leases", e))?;

        Ok(result.rows_affected())
    }

    async fn list_by_tenant(
        &self,
        tenant_id: &TenantId,
        filter: &ListFilter,
        limit: i64,
        cursor: Option<ReportId>,
    ) -> Result<Page, StoreError> {
        // Keyset pagination: resolve the cursor row's position first, then
        // continue strictly after it in (created_at DESC, id ASC) order.
        let cursor_position = match cursor {
            None => None,
            Some(cursor_id) => {
                let created_at: Option<(DateTime<Utc>,)> =
                    sqlx::query_as("SELECT created_at FROM reports WHERE id = $1")
                        .bind(cursor_id.as_uuid())
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| map_sqlx_error("list_cursor", e))?;
                match created_at {
                    Some((at,)) => Some((at, *cursor_id.as_uuid())),
                    None => return Err(StoreError::InvalidCursor(cursor_id)),
                }
            }
        };

        let rows = sqlx::query_as::<_, ReportRow>(&format!(
            r#"
            SELECT {REPORT_COLUMNS}
            FROM reports
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR state = $2)
              AND ($3::text IS NULL OR type = $3)
              AND ($4::timestamptz IS NULL
                   OR created_at < $4
                   OR (created_at = $4 AND id > $5))
            ORDER BY created_at DESC, id ASC
            LIMIT $6
            "#
        ))
        .bind(tenant_id.as_str())
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(cursor_position.map(|(at, _)| at))
        .bind(cursor_position.map(|(_, id)| id))
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_tenant", e))?;

        let mut reports = rows
            .into_iter()
            .map(Report::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = if reports.len() as i64 > limit {
            reports.truncate(limit as usize);
            reports.last().map(|r| r.id)
        } else {
            None
        };

        Ok(Page {
            reports,
            next_cursor,
        })
    }

    async fn create_execution(
        &self,
        report_id: ReportId,
        attempt: u32,
    ) -> Result<ExecutionId, StoreError> {
        let id = ExecutionId::new();

        sqlx::query(
            r#"
            INSERT INTO report_executions (id, report_id, attempt, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(report_id.as_uuid())
        .bind(attempt as i32)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_execution", e))?;

        Ok(id)
    }

    async fn close_execution(
        &self,
        id: ExecutionId,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE report_executions
            SET finished_at = $2, error = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("close_execution", e))?;

        Ok(())
    }

    async fn list_executions(&self, report_id: ReportId) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, report_id, attempt, started_at, finished_at, error
            FROM report_executions
            WHERE report_id = $1
            ORDER BY attempt ASC, started_at ASC
            "#,
        )
        .bind(report_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_executions", e))?;

        Ok(rows.into_iter().map(Execution::from).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

fn params_json(params: &ReportParams) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(params)
        .map_err(|e| StoreError::Backend(format!("failed to serialize params: {e}")))
}

/// Map SQLx errors to StoreError, keeping the failing operation visible.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    StoreError::Backend(format!("{operation}: {err}"))
}

/// Check if an error is a unique constraint violation (PostgreSQL `23505`).
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    tenant_id: String,
    #[sqlx(rename = "type")]
    kind: String,
    params: serde_json::Value,
    state: String,
    attempts: i32,
    idempotency_key: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ReportRow> for Report {
    type Error = StoreError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, detail: String| {
            StoreError::Backend(format!("corrupt report row ({what}): {detail}"))
        };

        Ok(Report {
            id: ReportId::from_uuid(row.id),
            tenant_id: TenantId::new(row.tenant_id),
            kind: ReportType::parse(&row.kind).map_err(|e| corrupt("type", e.to_string()))?,
            params: serde_json::from_value(row.params)
                .map_err(|e| corrupt("params", e.to_string()))?,
            state: ReportState::parse(&row.state)
                .map_err(|e| corrupt("state", e.to_string()))?,
            attempts: row.attempts.max(0) as u32,
            idempotency_key: row.idempotency_key,
            locked_at: row.locked_at,
            locked_by: row.locked_by.map(WorkerId::new),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ArtifactRow {
    id: Uuid,
    report_id: Uuid,
    content_type: String,
    content: Vec<u8>,
    size_bytes: i64,
    checksum: String,
    created_at: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Artifact {
            id: row.id.into(),
            report_id: ReportId::from_uuid(row.report_id),
            content_type: row.content_type,
            content: row.content,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ArtifactMetaRow {
    id: Uuid,
    report_id: Uuid,
    content_type: String,
    size_bytes: i64,
    checksum: String,
    created_at: DateTime<Utc>,
}

impl From<ArtifactMetaRow> for ArtifactMeta {
    fn from(row: ArtifactMetaRow) -> Self {
        ArtifactMeta {
            id: row.id.into(),
            report_id: ReportId::from_uuid(row.report_id),
            content_type: row.content_type,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    report_id: Uuid,
    attempt: i32,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Execution {
            id: row.id.into(),
            report_id: ReportId::from_uuid(row.report_id),
            attempt: row.attempt.max(0) as u32,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error: row.error,
        }
    }
}
