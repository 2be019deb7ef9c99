use thiserror::Error;

/// How a failed operation should be handled by the worker substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Requeue with backoff up to the attempt budget.
    Retryable,
    /// Settle the item immediately; do not requeue.
    Fatal,
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },

    #[error("decode failed for {0}")]
    DecodeFailed(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("no cache folder has room for {needed_bytes} bytes")]
    NoCacheSpace { needed_bytes: u64 },

    #[error("corrupt source: {0}")]
    CorruptSource(String),

    #[error("archive entry {entry} not found in {archive}")]
    EntryNotFound { archive: String, entry: String },

    #[error("archive entry name {0} is ambiguous after repair")]
    AmbiguousEntry(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("queue {0} is unavailable")]
    QueueUnavailable(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CatalogError {
    /// Classification used by workers to decide requeue vs per-item outcome.
    pub fn retryability(&self) -> Retryability {
        match self {
            CatalogError::Io(_)
            | CatalogError::Storage(_)
            | CatalogError::Index(_)
            | CatalogError::QueueUnavailable(_)
            | CatalogError::Timeout(_)
            | CatalogError::NoCacheSpace { .. }
            | CatalogError::VersionConflict { .. } => Retryability::Retryable,
            CatalogError::DecodeFailed(_)
            | CatalogError::EncodeFailed(_)
            | CatalogError::CorruptSource(_)
            | CatalogError::EntryNotFound { .. }
            | CatalogError::AmbiguousEntry(_)
            | CatalogError::UnsupportedArchive(_) => Retryability::Fatal,
            CatalogError::Validation(_)
            | CatalogError::NotFound(_)
            | CatalogError::Serialization(_)
            | CatalogError::Cancelled(_)
            | CatalogError::Internal(_) => Retryability::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryability() == Retryability::Retryable
    }

    /// Item outcome once the retry budget is spent: capacity exhaustion
    /// skips the item, everything else fails it.
    pub fn exhausted_outcome(&self) -> vitrine_model::job::ItemOutcome {
        match self {
            CatalogError::NoCacheSpace { .. } => {
                vitrine_model::job::ItemOutcome::Skipped
            }
            _ => vitrine_model::job::ItemOutcome::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_retry_then_skip() {
        let err = CatalogError::NoCacheSpace { needed_bytes: 42 };
        assert_eq!(err.retryability(), Retryability::Retryable);
        assert_eq!(
            err.exhausted_outcome(),
            vitrine_model::job::ItemOutcome::Skipped
        );
    }

    #[test]
    fn io_and_conflicts_are_retryable() {
        let io = CatalogError::Io(std::io::Error::other("disk"));
        assert!(io.is_retryable());
        let conflict = CatalogError::VersionConflict {
            entity: "collection",
            id: "x".into(),
        };
        assert!(conflict.is_retryable());
    }

    #[test]
    fn corrupt_sources_are_fatal_per_item() {
        let err = CatalogError::DecodeFailed("a.jpg".into());
        assert_eq!(err.retryability(), Retryability::Fatal);
    }
}
