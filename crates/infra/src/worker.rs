//! Worker engine: claim, execute, converge.
//!
//! Workers are independent agents coordinating only through the store's
//! row locks and uniqueness constraints - no leader election, no shared
//! memory. Each tick claims at most one report, runs the producer, and
//! writes the artifact. The artifact insert is the convergence point: a
//! `DuplicateArtifact` collision means a peer already produced the output,
//! and the job is completed without a second artifact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use reportd_core::{ExecutionId, Report, ReportId, ReportState, WorkerId};

use crate::producer::ArtifactProducer;
use crate::store::{NewArtifact, ReportStore, StoreError};

/// Stale-lease recovery runs on the first tick and then every
/// `RECOVERY_TICK_INTERVAL`-th tick, bounding expected recovery latency to
/// `O(RECOVERY_TICK_INTERVAL * poll_interval)`.
const RECOVERY_TICK_INTERVAL: u64 = 10;

/// Worker engine configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Unique identity of this worker instance (`locked_by` lease value).
    pub instance_id: WorkerId,
    /// Sleep between idle ticks.
    pub poll_interval: Duration,
    /// Leases older than this are presumed abandoned and reclaimed.
    pub stale_lock_timeout: Duration,
    /// Total attempts before a report is marked `FAILED`.
    pub max_attempts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            instance_id: WorkerId::generate(),
            poll_interval: Duration::from_millis(5_000),
            stale_lock_timeout: Duration::from_millis(300_000),
            max_attempts: 3,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing claimable.
    Idle,
    /// Produced the artifact and completed the report.
    Completed(ReportId),
    /// A peer had already produced the artifact; completed without one.
    Converged(ReportId),
    /// Attempt failed, retry budget left, report back to `PENDING`.
    Retrying(ReportId),
    /// Attempt failed and exhausted the budget; report is `FAILED`.
    Failed(ReportId),
}

/// One worker's engine. Run several instances (or several processes) for
/// parallelism; a single engine executes one attempt at a time.
pub struct WorkerEngine {
    store: Arc<dyn ReportStore>,
    producer: Arc<dyn ArtifactProducer>,
    settings: WorkerSettings,
    ticks: AtomicU64,
}

impl WorkerEngine {
    pub fn new(
        store: Arc<dyn ReportStore>,
        producer: Arc<dyn ArtifactProducer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            producer,
            settings,
            ticks: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Reset every expired `RUNNING` lease back to `PENDING`. Attempts are
    /// untouched: the crashed holder never closed its attempt.
    pub async fn recover_stale(&self) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.settings.stale_lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let recovered = self.store.recover_stale_leases(cutoff).await?;
        if recovered > 0 {
            info!(
                worker = %self.settings.instance_id,
                recovered,
                "reset stale leases to pending"
            );
        }
        Ok(recovered)
    }

    /// One cooperative cycle: claim at most one report and execute it, then
    /// run stale-lease recovery when due. Recovery runs after the attempt,
    /// so a just-recovered report is claimed no earlier than the next tick.
    pub async fn tick(&self) -> Result<TickOutcome, StoreError> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);

        let cutoff = Utc::now() - chrono::Duration::from_std(self.settings.stale_lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let outcome = match self
            .store
            .claim_next_pending(cutoff, &self.settings.instance_id)
            .await?
        {
            None => TickOutcome::Idle,
            Some(report) => self.execute(report).await?,
        };

        if tick % RECOVERY_TICK_INTERVAL == 0 {
            if let Err(e) = self.recover_stale().await {
                warn!(worker = %self.settings.instance_id, error = %e, "stale lease recovery failed");
            }
        }

        Ok(outcome)
    }

    /// Poll loop: tick, then sleep one interval when idle. Shutdown lets the
    /// in-flight tick finish; an abandoned attempt is reclaimed by peers via
    /// the stale-lease path.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            worker = %self.settings.instance_id,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            stale_lock_timeout_ms = self.settings.stale_lock_timeout.as_millis() as u64,
            max_attempts = self.settings.max_attempts,
            "report worker started"
        );

        loop {
            let wait = match self.tick().await {
                Ok(TickOutcome::Idle) => self.settings.poll_interval,
                Ok(outcome) => {
                    debug!(worker = %self.settings.instance_id, ?outcome, "tick finished");
                    // More work may be queued; yield without a full sleep.
                    Duration::ZERO
                }
                Err(e) => {
                    error!(worker = %self.settings.instance_id, error = %e, "tick failed");
                    self.settings.poll_interval
                }
            };

            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    info!(worker = %self.settings.instance_id, "worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(worker = %self.settings.instance_id, "report worker stopped");
    }

    /// Execute one claimed report through the convergence protocol.
    async fn execute(&self, report: Report) -> Result<TickOutcome, StoreError> {
        let attempt = report.attempts + 1;
        let execution = self.store.create_execution(report.id, attempt).await?;

        debug!(
            worker = %self.settings.instance_id,
            report_id = %report.id,
            attempt,
            "executing report"
        );

        let produced = match self.producer.produce(report.kind, &report.params) {
            Ok(produced) => produced,
            Err(e) => return self.fail_attempt(&report, execution, e.to_string()).await,
        };

        match self
            .store
            .insert_artifact(NewArtifact {
                report_id: report.id,
                content_type: produced.content_type,
                content: produced.content,
                checksum: produced.checksum,
            })
            .await
        {
            Ok(artifact) => {
                self.store.mark_completed(report.id, attempt).await?;
                self.store.close_execution(execution, None).await?;
                info!(
                    worker = %self.settings.instance_id,
                    report_id = %report.id,
                    artifact_id = %artifact.id,
                    attempt,
                    "report completed"
                );
                Ok(TickOutcome::Completed(report.id))
            }
            Err(StoreError::DuplicateArtifact) => {
                // A peer produced the artifact first. This attempt was a
                // no-op, so the attempts counter stays as it was.
                self.store.mark_completed(report.id, report.attempts).await?;
                self.store.close_execution(execution, None).await?;
                info!(
                    worker = %self.settings.instance_id,
                    report_id = %report.id,
                    "converged on artifact produced by a peer"
                );
                Ok(TickOutcome::Converged(report.id))
            }
            Err(e) => self.fail_attempt(&report, execution, e.to_string()).await,
        }
    }

    async fn fail_attempt(
        &self,
        report: &Report,
        execution: ExecutionId,
        error: String,
    ) -> Result<TickOutcome, StoreError> {
        let attempts = report.attempts + 1;
        let (state, outcome) = if attempts < self.settings.max_attempts {
            (ReportState::Pending, TickOutcome::Retrying(report.id))
        } else {
            (ReportState::Failed, TickOutcome::Failed(report.id))
        };

        self.store
            .mark_failed_or_retry(report.id, attempts, state)
            .await?;
        self.store
            .close_execution(execution, Some(&error))
            .await?;

        warn!(
            worker = %self.settings.instance_id,
            report_id = %report.id,
            attempts,
            max_attempts = self.settings.max_attempts,
            state = %state,
            error = %error,
            "report attempt failed"
        );
        Ok(outcome)
    }
}
