//! The job ledger: authoritative progress source for every pipeline job.
//!
//! Terminal records are immutable; attempts to mutate them are ignored so
//! late at-least-once deliveries cannot corrupt history. `record_item`
//! returns the updated record, letting exactly one caller observe the
//! transition to fully-settled and finish the job.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use async_trait::async_trait;
use vitrine_model::ids::{CollectionId, JobId, LibraryId};
use vitrine_model::job::{ItemOutcome, JobKind, JobRecord, JobStatus};

use crate::error::Result;

pub use memory::MemoryLedger;
#[cfg(feature = "database")]
pub use postgres::PostgresLedger;

/// Cross-stage counter bumped on scan jobs by derivative workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCounter {
    Thumbnails,
    Cache,
}

#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn create_job(&self, job: &JobRecord) -> Result<()>;

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>>;

    async fn children(&self, parent: JobId) -> Result<Vec<JobRecord>>;

    /// The most recent non-terminal job of `kind` targeting the given
    /// library/collection, used to coalesce duplicate requests.
    async fn find_active(
        &self,
        kind: JobKind,
        library: Option<LibraryId>,
        collection: Option<CollectionId>,
    ) -> Result<Option<JobRecord>>;

    /// Transition to Running, bumping `attempts`; retries re-enter Running.
    async fn mark_running(&self, id: JobId) -> Result<()>;

    /// Transition to a terminal status. A no-op when already terminal.
    async fn finish(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<()>;

    /// Grow `progress.total`; totals never shrink.
    async fn add_total(&self, id: JobId, delta: u64) -> Result<()>;

    /// Record one item outcome and return the updated record.
    async fn record_item(
        &self,
        id: JobId,
        outcome: ItemOutcome,
        current_item: Option<String>,
    ) -> Result<JobRecord>;

    async fn increment_stage(
        &self,
        id: JobId,
        counter: StageCounter,
    ) -> Result<()>;

    /// Cancel a job and all of its non-terminal descendants; returns the
    /// ids that were transitioned.
    async fn cancel_tree(&self, id: JobId) -> Result<Vec<JobId>>;
}

/// True when every item of a running job has settled and it can finish.
pub fn is_fully_settled(job: &JobRecord) -> bool {
    job.status == JobStatus::Running && job.progress.pending() == 0
}

/// Terminal status implied by a settled progress snapshot: failures win.
pub fn settled_status(job: &JobRecord) -> JobStatus {
    if job.progress.failed > 0 {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    }
}
