//! Execution audit records: one row per attempt at producing an artifact.
//!
//! Executions are opened by the worker that begins an attempt and closed by
//! the same worker. A worker crash leaves the row dangling; that is accepted
//! audit residue, not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ExecutionId, ReportId};

/// One attempt's audit record. `attempt` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub report_id: ReportId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
