//! Produced artifacts: at most one per report, written exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ArtifactId, ReportId};

/// Artifact metadata, safe to embed in report representations (no content).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: ArtifactId,
    pub report_id: ReportId,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// A produced artifact including its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub report_id: ReportId,
    pub content_type: String,
    pub content: Vec<u8>,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn meta(&self) -> ArtifactMeta {
        ArtifactMeta {
            id: self.id,
            report_id: self.report_id,
            content_type: self.content_type.clone(),
            size_bytes: self.size_bytes,
            checksum: self.checksum.clone(),
            created_at: self.created_at,
        }
    }
}
