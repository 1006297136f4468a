//! Idempotency broker: resolves a submission to the single report that
//! should represent it.
//!
//! Resolution order: client-key hit, then semantic hit / fresh insert via
//! the service, then key backfill. Every uniqueness violation along the way
//! is converted into a re-read of the canonical row - duplicates are
//! expected outcomes here, not failures. All three deduplication paths are
//! advisory; the hard exactly-once guarantee lives in the worker's
//! convergence protocol.

use std::sync::Arc;

use tracing::debug;

use reportd_core::Report;

use crate::service::{ReportService, ServiceError};
use crate::store::{NewReport, ReportStore, StoreError};

/// How the returned report came to be.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub report: Report,
    /// True iff this submission inserted the row.
    pub created: bool,
}

/// Bounded number of re-resolution rounds. Each retry only happens when a
/// concurrent submitter won a uniqueness race, so the key-hit lookup of the
/// next round is guaranteed to find their row.
const MAX_ROUNDS: usize = 3;

#[derive(Clone)]
pub struct IdempotencyBroker {
    store: Arc<dyn ReportStore>,
    service: ReportService,
}

impl IdempotencyBroker {
    pub fn new(store: Arc<dyn ReportStore>, service: ReportService) -> Self {
        Self { store, service }
    }

    /// Resolve a submission, creating a report iff no eligible existing one
    /// is found.
    pub async fn resolve(&self, submission: NewReport) -> Result<Resolution, ServiceError> {
        for _ in 0..MAX_ROUNDS {
            // Step 1: request-key hit.
            if let Some(key) = submission.idempotency_key.as_deref() {
                if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                    debug!(report_id = %existing.id, "idempotency key hit");
                    return Ok(Resolution {
                        report: existing,
                        created: false,
                    });
                }
            }

            // Steps 2-3: semantic hit or fresh insert.
            let (mut report, created) = match self.service.find_or_create(submission.clone()).await
            {
                Ok(outcome) => outcome,
                // A concurrent submission with the same key inserted first;
                // their row is the canonical one.
                Err(ServiceError::Store(StoreError::DuplicateIdempotencyKey)) => continue,
                Err(e) => return Err(e),
            };

            // Step 4: backfill the key onto a keyless semantic hit.
            if let Some(key) = submission.idempotency_key.as_deref() {
                if report.idempotency_key.is_none() {
                    match self.store.backfill_idempotency_key(report.id, key).await {
                        Ok(()) => report.idempotency_key = Some(key.to_string()),
                        Err(StoreError::DuplicateIdempotencyKey) => {
                            debug!(report_id = %report.id, "lost key backfill race, re-resolving");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            return Ok(Resolution { report, created });
        }

        // Rounds only repeat after losing a race to a same-key submitter, so
        // the key must resolve by now.
        if let Some(key) = submission.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                return Ok(Resolution {
                    report: existing,
                    created: false,
                });
            }
        }

        Err(ServiceError::Store(StoreError::Backend(
            "idempotency resolution did not converge".to_string(),
        )))
    }
}
