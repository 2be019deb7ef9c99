use serde::{Deserialize, Serialize};
use vitrine_model::message::Topic;

/// Global knobs that tune pipeline behaviour.
///
/// All fields carry defaults so deployments can adopt individual settings
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    /// Worker pool sizes and queue bounds.
    pub workers: WorkerConfig,
    /// Retry/backoff policy shared by all queues.
    pub retry: RetryConfig,
    /// Cache-folder selection policy.
    pub allocation: AllocationConfig,
    /// Scheduler behaviour.
    pub scheduler: SchedulerConfig,
    /// Ordered-index maintenance.
    pub index: IndexConfig,
    /// Archive reader behaviour.
    pub archive: ArchiveConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub library_scan_concurrency: usize,
    pub collection_scan_concurrency: usize,
    pub thumbnail_concurrency: usize,
    pub cache_concurrency: usize,
    pub metadata_concurrency: usize,
    pub bulk_concurrency: usize,
    /// Primary queue bound per topic; overflow dead-letters.
    pub queue_capacity: usize,
    /// The coordinator pauses fan-out above this queue depth...
    pub fanout_high_watermark: usize,
    /// ...and resumes below this one.
    pub fanout_low_watermark: usize,
    /// Default job timeout in milliseconds.
    pub job_timeout_ms: u64,
    /// Re-read budget when a version-conditional write conflicts.
    pub conflict_retry_budget: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(2);
        Self {
            library_scan_concurrency: 1,
            collection_scan_concurrency: 2,
            thumbnail_concurrency: cores,
            cache_concurrency: cores.div_ceil(2),
            metadata_concurrency: 2,
            bulk_concurrency: 1,
            queue_capacity: 10_000,
            fanout_high_watermark: 8_000,
            fanout_low_watermark: 4_000,
            job_timeout_ms: 10 * 60 * 1000,
            conflict_retry_budget: 3,
        }
    }
}

impl WorkerConfig {
    pub fn concurrency_for(&self, topic: Topic) -> usize {
        let configured = match topic {
            Topic::LibraryScan => self.library_scan_concurrency,
            Topic::CollectionScan => self.collection_scan_concurrency,
            Topic::ThumbnailGenerate => self.thumbnail_concurrency,
            Topic::CacheGenerate => self.cache_concurrency,
            Topic::ImageProcess => self.metadata_concurrency,
            Topic::BulkOperation => self.bulk_concurrency,
        };
        configured.max(1)
    }
}

/// Retry/backoff policy: exponential between the two bounds, with jitter.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_min_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Backoff before the given delivery attempt (1-based), without jitter.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        let raw = self.backoff_min_ms.saturating_mul(1u64 << shift);
        raw.clamp(self.backoff_min_ms, self.backoff_max_ms)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Highest priority first; lowest fill ratio breaks ties.
    #[default]
    PriorityThenLowestFill,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default)]
pub struct AllocationConfig {
    pub policy: AllocationPolicy,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Skip firing when an equivalent job is already running.
    pub coalesce_duplicates: bool,
    /// Poll cadence for due triggers, in milliseconds.
    pub tick_interval_ms: u64,
    /// TTL of the firing lease taken around each trigger.
    pub firing_lease_ttl_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coalesce_duplicates: true,
            tick_interval_ms: 1_000,
            firing_lease_ttl_ms: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// A background rebuild starts when |index count - catalog count|
    /// exceeds this fraction of the catalog size.
    pub rebuild_threshold_ratio: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rebuild_threshold_ratio: 0.10,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Attempt prefix/suffix repair for entry names that match no entry.
    pub path_repair: bool,
    /// Concurrent readers allowed per archive file.
    pub readers_per_archive: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path_repair: true,
            readers_per_archive: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_bounds() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_ms(1), 1_000);
        assert_eq!(retry.backoff_ms(2), 2_000);
        assert_eq!(retry.backoff_ms(3), 4_000);
        assert_eq!(retry.backoff_ms(30), 60_000);
    }

    #[test]
    fn every_topic_has_a_nonzero_concurrency() {
        let workers = WorkerConfig::default();
        for topic in Topic::ALL {
            assert!(workers.concurrency_for(topic) >= 1);
        }
    }
}
