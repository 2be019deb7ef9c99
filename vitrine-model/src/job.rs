use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ids::{CollectionId, JobId, LibraryId};

/// The pipeline stages tracked by the ledger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum JobKind {
    LibraryScan,
    CollectionScan,
    Thumbnail,
    Cache,
    BulkOperation,
    Metadata,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::LibraryScan => "library-scan",
            JobKind::CollectionScan => "collection-scan",
            JobKind::Thumbnail => "thumbnail",
            JobKind::Cache => "cache",
            JobKind::BulkOperation => "bulk-operation",
            JobKind::Metadata => "metadata",
        };
        write!(f, "{name}")
    }
}

/// Ledger-visible job states. Terminal states are immutable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Outcome of one unit of work within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Completed,
    Failed,
    Skipped,
}

/// Progress counters; `total = completed + failed + skipped + pending`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub current_item: Option<String>,
}

impl JobProgress {
    pub fn pending(&self) -> u64 {
        self.total
            .saturating_sub(self.completed + self.failed + self.skipped)
    }

    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Per-stage counters aggregated onto scan jobs by derivative workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageCounters {
    pub thumbnails_done: u64,
    pub cache_done: u64,
}

/// Persistent record of one pipeline job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub parent_job_id: Option<JobId>,
    pub correlation_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub timeout_ms: u64,
    /// Opaque stage-specific parameters (library id, collection id, preset...).
    pub parameters: Map<String, Value>,
    pub progress: JobProgress,
    pub stage_counters: StageCounters,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(kind: JobKind, correlation_id: Uuid, timeout_ms: u64) -> Self {
        Self {
            id: JobId::new(),
            kind,
            parent_job_id: None,
            correlation_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            timeout_ms,
            parameters: Map::new(),
            progress: JobProgress::default(),
            stage_counters: StageCounters::default(),
            error: None,
        }
    }

    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.parent_job_id = Some(parent);
        self
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// The library this job targets, when recorded in its parameters.
    pub fn target_library(&self) -> Option<LibraryId> {
        self.parameter_str("library_id")
            .and_then(|raw| LibraryId::parse(raw).ok())
    }

    /// The collection this job targets, when recorded in its parameters.
    pub fn target_collection(&self) -> Option<CollectionId> {
        self.parameter_str("collection_id")
            .and_then(|raw| CollectionId::parse(raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_balances_total_against_settled_and_pending() {
        let mut progress = JobProgress {
            total: 5,
            ..JobProgress::default()
        };
        progress.record(ItemOutcome::Completed);
        progress.record(ItemOutcome::Failed);
        progress.record(ItemOutcome::Skipped);
        assert_eq!(progress.pending(), 2);
        assert_eq!(
            progress.total,
            progress.completed
                + progress.failed
                + progress.skipped
                + progress.pending()
        );
    }

    #[test]
    fn target_parameters_round_trip() {
        let library = LibraryId::new();
        let job = JobRecord::new(JobKind::LibraryScan, Uuid::now_v7(), 1000)
            .with_parameter("library_id", Value::String(library.to_string()));
        assert_eq!(job.target_library(), Some(library));
        assert_eq!(job.target_collection(), None);
    }
}
