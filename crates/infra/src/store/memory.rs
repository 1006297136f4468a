//! In-memory report store for tests and local development.
//!
//! Mirrors the PostgreSQL semantics, including claim atomicity: every
//! operation runs under one mutex, which is the coarse equivalent of the
//! row-lock discipline the production store gets from the database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use reportd_core::{
    Artifact, ArtifactId, ArtifactMeta, Execution, ExecutionId, Report, ReportId, ReportParams,
    ReportState, ReportType, TenantId, WorkerId,
};

use super::{ListFilter, NewArtifact, NewReport, Page, ReportStore, StoreError};

#[derive(Debug, Default)]
struct State {
    reports: HashMap<ReportId, Report>,
    artifacts: HashMap<ReportId, Artifact>,
    executions: Vec<Execution>,
}

/// Test/dev store holding everything behind a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryReportStore {
    state: Mutex<State>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn insert_report(&self, new: NewReport) -> Result<Report, StoreError> {
        let mut state = self.state.lock().unwrap();

        if let Some(key) = new.idempotency_key.as_deref() {
            let taken = state
                .reports
                .values()
                .any(|r| r.idempotency_key.as_deref() == Some(key));
            if taken {
                return Err(StoreError::DuplicateIdempotencyKey);
            }
        }

        let report = Report::new(new.tenant_id, new.kind, new.params, new.idempotency_key);
        state.reports.insert(report.id, report.clone());
        Ok(report)
    }

    async fn find_by_id(&self, id: ReportId) -> Result<Option<Report>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.reports.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Report>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .reports
            .values()
            .find(|r| r.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn find_equivalent(
        &self,
        tenant_id: &TenantId,
        kind: ReportType,
        params: &ReportParams,
    ) -> Result<Option<Report>, StoreError> {
        let state = self.state.lock().unwrap();

        let mut candidates: Vec<&Report> = state
            .reports
            .values()
            .filter(|r| {
                r.tenant_id == *tenant_id
                    && r.kind == kind
                    && r.params == *params
                    && matches!(r.state, ReportState::Completed | ReportState::Running)
            })
            .collect();

        // COMPLETED beats RUNNING; within a state, most recent first.
        candidates.sort_by(|a, b| {
            let rank = |r: &Report| u8::from(r.state != ReportState::Completed);
            rank(a)
                .cmp(&rank(b))
                .then(b.created_at.cmp(&a.created_at))
        });

        Ok(candidates.first().map(|r| (*r).clone()))
    }

    async fn backfill_idempotency_key(&self, id: ReportId, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        let taken = state
            .reports
            .values()
            .any(|r| r.id != id && r.idempotency_key.as_deref() == Some(key));
        if taken {
            return Err(StoreError::DuplicateIdempotencyKey);
        }

        if let Some(report) = state.reports.get_mut(&id) {
            if report.idempotency_key.is_none() {
                report.idempotency_key = Some(key.to_string());
                report.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn claim_next_pending(
        &self,
        stale_cutoff: DateTime<Utc>,
        worker: &WorkerId,
    ) -> Result<Option<Report>, StoreError> {
        let mut state = self.state.lock().unwrap();

        let next = state
            .reports
            .values()
            .filter(|r| {
                r.state == ReportState::Pending
                    && (r.locked_at.is_none() || r.lease_expired(stale_cutoff))
            })
            .min_by_key(|r| (r.created_at, r.id))
            .map(|r| r.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let now = Utc::now();
        let report = state.reports.get_mut(&id).expect("claimed id exists");
        report.mark_running(worker, now);
        Ok(Some(report.clone()))
    }

    async fn insert_artifact(&self, new: NewArtifact) -> Result<Artifact, StoreError> {
        let mut state = self.state.lock().unwrap();

        if !state.reports.contains_key(&new.report_id) {
            return Err(StoreError::NotFound(new.report_id));
        }
        if state.artifacts.contains_key(&new.report_id) {
            return Err(StoreError::DuplicateArtifact);
        }

        let size_bytes = new.content.len() as i64;
        let artifact = Artifact {
            id: ArtifactId::new(),
            report_id: new.report_id,
            content_type: new.content_type,
            content: new.content,
            size_bytes,
            checksum: new.checksum,
            created_at: Utc::now(),
        };
        state.artifacts.insert(new.report_id, artifact.clone());
        Ok(artifact)
    }

    async fn find_artifact(&self, report_id: ReportId) -> Result<Option<Artifact>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.artifacts.get(&report_id).cloned())
    }

    async fn find_artifact_meta(
        &self,
        report_id: ReportId,
    ) -> Result<Option<ArtifactMeta>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.artifacts.get(&report_id).map(Artifact::meta))
    }

    async fn mark_completed(&self, id: ReportId, attempts: u32) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let report = state
            .reports
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        report.mark_completed(attempts, Utc::now());
        Ok(())
    }

    async fn mark_failed_or_retry(
        &self,
        id: ReportId,
        attempts: u32,
        state_after: ReportState,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let report = state
            .reports
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        match state_after {
            ReportState::Pending => report.mark_retrying(attempts, Utc::now()),
            _ => report.mark_failed(attempts, Utc::now()),
        }
        Ok(())
    }

    async fn recover_stale_leases(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut recovered = 0;

        for report in state.reports.values_mut() {
            if report.state == ReportState::Running && report.lease_expired(cutoff) {
                report.release_lease(now);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn list_by_tenant(
        &self,
        tenant_id: &TenantId,
        filter: &ListFilter,
        limit: i64,
        cursor: Option<ReportId>,
    ) -> Result<Page, StoreError> {
        let state = self.state.lock().unwrap();

        let cursor_position = match cursor {
            None => None,
            Some(cursor_id) => match state.reports.get(&cursor_id) {
                Some(r) => Some((r.created_at, r.id)),
                None => return Err(StoreError::InvalidCursor(cursor_id)),
            },
        };

        let mut matching: Vec<&Report> = state
            .reports
            .values()
            .filter(|r| {
                r.tenant_id == *tenant_id
                    && filter.state.map_or(true, |s| r.state == s)
                    && filter.kind.map_or(true, |k| r.kind == k)
            })
            .filter(|r| match cursor_position {
                None => true,
                Some((at, id)) => r.created_at < at || (r.created_at == at && r.id > id),
            })
            .collect();

        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(a.id.cmp(&b.id))
        });

        let mut reports: Vec<Report> = matching
            .into_iter()
            .take(limit as usize + 1)
            .cloned()
            .collect();

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
        let mut state = self.state.lock().unwrap();
        if !state.reports.contains_key(&report_id) {
            return Err(StoreError::NotFound(report_id));
        }

        let execution = Execution {
            id: ExecutionId::new(),
            report_id,
            attempt,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        let id = execution.id;
        state.executions.push(execution);
        Ok(id)
    }

    async fn close_execution(
        &self,
        id: ExecutionId,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(execution) = state.executions.iter_mut().find(|e| e.id == id) {
            execution.finished_at = Some(Utc::now());
            execution.error = error.map(str::to_string);
        }
        Ok(())
    }

    async fn list_executions(&self, report_id: ReportId) -> Result<Vec<Execution>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut executions: Vec<Execution> = state
            .executions
            .iter()
            .filter(|e| e.report_id == report_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| (e.attempt, e.started_at));
        Ok(executions)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use reportd_core::OutputFormat;

    use super::*;

    fn submission(tenant: &str, key: Option<&str>) -> NewReport {
        NewReport {
            tenant_id: TenantId::from(tenant),
            kind: ReportType::UsageSummary,
            params: ReportParams {
                from: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                to: chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
                format: OutputFormat::Csv,
            },
            idempotency_key: key.map(str::to_string),
        }
    }

    fn artifact_for(report_id: ReportId) -> NewArtifact {
        NewArtifact {
            report_id,
            content_type: "text/csv".to_string(),
            content: b"a,b\n1,2\n".to_vec(),
            checksum: "abc123".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_and_claim_oldest_first() {
        let store = InMemoryReportStore::new();
        let first = store.insert_report(submission("acme", None)).await.unwrap();
        let _second = store.insert_report(submission("acme", None)).await.unwrap();

        let worker = WorkerId::from("w-1");
        let cutoff = Utc::now() - Duration::minutes(5);
        let claimed = store
            .claim_next_pending(cutoff, &worker)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, ReportState::Running);
        assert!(claimed.has_lease());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let store = InMemoryReportStore::new();
        store
            .insert_report(submission("acme", Some("K")))
            .await
            .unwrap();

        let err = store
            .insert_report(submission("acme", Some("K")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdempotencyKey));
    }

    #[tokio::test]
    async fn second_artifact_for_same_report_collides() {
        let store = InMemoryReportStore::new();
        let report = store.insert_report(submission("acme", None)).await.unwrap();

        store.insert_artifact(artifact_for(report.id)).await.unwrap();
        let err = store
            .insert_artifact(artifact_for(report.id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateArtifact));
    }

    #[tokio::test]
    async fn stale_recovery_resets_only_expired_leases() {
        let store = InMemoryReportStore::new();
        let stale = store.insert_report(submission("acme", None)).await.unwrap();
        let fresh = store.insert_report(submission("acme", None)).await.unwrap();

        {
            let mut state = store.state.lock().unwrap();
            let long_ago = Utc::now() - Duration::minutes(30);
            state
                .reports
                .get_mut(&stale.id)
                .unwrap()
                .mark_running(&WorkerId::from("w-dead"), long_ago);
            state
                .reports
                .get_mut(&fresh.id)
                .unwrap()
                .mark_running(&WorkerId::from("w-live"), Utc::now());
        }

        let cutoff = Utc::now() - Duration::minutes(5);
        let recovered = store.recover_stale_leases(cutoff).await.unwrap();
        assert_eq!(recovered, 1);

        let stale = store.find_by_id(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.state, ReportState::Pending);
        assert!(!stale.has_lease());
        assert_eq!(stale.attempts, 0);

        let fresh = store.find_by_id(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.state, ReportState::Running);
    }

    #[tokio::test]
    async fn equivalent_lookup_prefers_completed() {
        let store = InMemoryReportStore::new();
        let completed = store.insert_report(submission("acme", None)).await.unwrap();
        let running = store.insert_report(submission("acme", None)).await.unwrap();

        {
            let mut state = store.state.lock().unwrap();
            let r = state.reports.get_mut(&completed.id).unwrap();
            r.mark_running(&WorkerId::from("w-1"), Utc::now());
            r.mark_completed(1, Utc::now());
            state
                .reports
                .get_mut(&running.id)
                .unwrap()
                .mark_running(&WorkerId::from("w-2"), Utc::now());
        }

        let hit = store
            .find_equivalent(
                &TenantId::from("acme"),
                ReportType::UsageSummary,
                &submission("acme", None).params,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, completed.id);
    }

    #[tokio::test]
    async fn pending_reports_are_not_semantic_matches() {
        let store = InMemoryReportStore::new();
        store.insert_report(submission("acme", None)).await.unwrap();

        let hit = store
            .find_equivalent(
                &TenantId::from("acme"),
                ReportType::UsageSummary,
                &submission("acme", None).params,
            )
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn listing_pages_newest_first_with_cursor() {
        let store = InMemoryReportStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.insert_report(submission("acme", None)).await.unwrap().id);
        }
        // Unrelated tenant must not leak into the listing.
        store.insert_report(submission("other", None)).await.unwrap();

        let tenant = TenantId::from("acme");
        let first = store
            .list_by_tenant(&tenant, &ListFilter::default(), 2, None)
            .await
            .unwrap();
        assert_eq!(first.reports.len(), 2);
        let cursor = first.next_cursor.expect("more pages");

        let second = store
            .list_by_tenant(&tenant, &ListFilter::default(), 2, Some(cursor))
            .await
            .unwrap();
        assert_eq!(second.reports.len(), 2);

        let third = store
            .list_by_tenant(&tenant, &ListFilter::default(), 2, second.next_cursor)
            .await
            .unwrap();
        assert_eq!(third.reports.len(), 1);
        assert!(third.next_cursor.is_none());

        let mut seen: Vec<ReportId> = first
            .reports
            .iter()
            .chain(&second.reports)
            .chain(&third.reports)
            .map(|r| r.id)
            .collect();
        // Pages are created_at DESC and cover every report exactly once.
        for window in first
            .reports
            .iter()
            .chain(&second.reports)
            .chain(&third.reports)
            .collect::<Vec<_>>()
            .windows(2)
        {
            assert!(window[0].created_at >= window[1].created_at);
        }
        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn unknown_cursor_is_rejected() {
        let store = InMemoryReportStore::new();
        let err = store
            .list_by_tenant(
                &TenantId::from("acme"),
                &ListFilter::default(),
                20,
                Some(ReportId::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidCursor(_)));
    }

    #[tokio::test]
    async fn executions_record_attempt_history() {
        let store = InMemoryReportStore::new();
        let report = store.insert_report(submission("acme", None)).await.unwrap();

        let first = store.create_execution(report.id, 1).await.unwrap();
        store.close_execution(first, Some("boom")).await.unwrap();
        let second = store.create_execution(report.id, 2).await.unwrap();
        store.close_execution(second, None).await.unwrap();

        let history = store.list_executions(report.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[0].error.as_deref(), Some("boom"));
        assert_eq!(history[1].attempt, 2);
        assert!(history[1].error.is_none());
        assert!(history.iter().all(|e| e.finished_at.is_some()));
    }
}
