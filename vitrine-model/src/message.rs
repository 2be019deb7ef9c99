use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collection::SourceLocator;
use crate::ids::{CollectionId, JobId, LibraryId, MediaItemId};
use crate::preset::DerivativePreset;

/// Message-bus topics, one per pipeline stage. Each topic has a primary
/// queue and a dead-letter queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Topic {
    LibraryScan,
    CollectionScan,
    ThumbnailGenerate,
    CacheGenerate,
    BulkOperation,
    ImageProcess,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::LibraryScan,
        Topic::CollectionScan,
        Topic::ThumbnailGenerate,
        Topic::CacheGenerate,
        Topic::BulkOperation,
        Topic::ImageProcess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::LibraryScan => "library.scan",
            Topic::CollectionScan => "collection.scan",
            Topic::ThumbnailGenerate => "thumbnail.generate",
            Topic::CacheGenerate => "cache.generate",
            Topic::BulkOperation => "bulk.operation",
            Topic::ImageProcess => "image.process",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maintenance operations handled by the bulk worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BulkOperation {
    RegenerateThumbnails { collection_id: CollectionId },
    RegenerateCache { collection_id: CollectionId },
    /// Delete derivative files and embedded references for a collection and
    /// release the cache-folder bytes they held.
    EvictDerivatives { collection_id: CollectionId },
}

impl BulkOperation {
    pub fn collection_id(&self) -> CollectionId {
        match self {
            BulkOperation::RegenerateThumbnails { collection_id }
            | BulkOperation::RegenerateCache { collection_id }
            | BulkOperation::EvictDerivatives { collection_id } => {
                *collection_id
            }
        }
    }
}

/// Stage-specific message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", content = "fields", rename_all = "snake_case")]
pub enum StagePayload {
    LibraryScan {
        library_id: LibraryId,
        force: bool,
    },
    CollectionScan {
        collection_id: CollectionId,
        force: bool,
        use_direct_file_access: Option<bool>,
    },
    ThumbnailGenerate {
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        source: SourceLocator,
        preset: DerivativePreset,
    },
    CacheGenerate {
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        source: SourceLocator,
        preset: DerivativePreset,
    },
    BulkOperation {
        operation: BulkOperation,
    },
    /// Metadata extraction for one media item (dimensions, duration).
    ImageProcess {
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        source: SourceLocator,
    },
}

impl StagePayload {
    pub fn topic(&self) -> Topic {
        match self {
            StagePayload::LibraryScan { .. } => Topic::LibraryScan,
            StagePayload::CollectionScan { .. } => Topic::CollectionScan,
            StagePayload::ThumbnailGenerate { .. } => Topic::ThumbnailGenerate,
            StagePayload::CacheGenerate { .. } => Topic::CacheGenerate,
            StagePayload::BulkOperation { .. } => Topic::BulkOperation,
            StagePayload::ImageProcess { .. } => Topic::ImageProcess,
        }
    }
}

/// Envelope carried by every bus message.
///
/// `job_id` is the ledger record the message executes; `scan_job_id` is the
/// collection-scan job whose cross-stage counters the derivative stages
/// update. `attempt` is maintained by the bus on redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    pub job_id: JobId,
    pub parent_job_id: Option<JobId>,
    pub scan_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub attempt: u32,
    pub payload: StagePayload,
}

impl MessageEnvelope {
    pub fn new(
        correlation_id: Uuid,
        job_id: JobId,
        payload: StagePayload,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            correlation_id,
            job_id,
            parent_job_id: None,
            scan_job_id: None,
            created_at: Utc::now(),
            attempt: 0,
            payload,
        }
    }

    pub fn with_parent(mut self, parent: JobId) -> Self {
        self.parent_job_id = Some(parent);
        self
    }

    pub fn with_scan_job(mut self, scan_job: JobId) -> Self {
        self.scan_job_id = Some(scan_job);
        self
    }

    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn envelopes_round_trip_through_json() {
        let envelope = MessageEnvelope::new(
            Uuid::now_v7(),
            JobId::new(),
            StagePayload::ThumbnailGenerate {
                collection_id: CollectionId::new(),
                media_item_id: MediaItemId::new(),
                source: SourceLocator::ArchiveEntry {
                    archive_path: PathBuf::from("/data/bundle.zip"),
                    entry_name: "sub/y.jpg".to_string(),
                },
                preset: DerivativePreset::thumbnail_default(),
            },
        )
        .with_scan_job(JobId::new());

        let json = serde_json::to_string(&envelope).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, envelope.message_id);
        assert_eq!(back.scan_job_id, envelope.scan_job_id);
        assert_eq!(back.topic(), Topic::ThumbnailGenerate);
    }

    #[test]
    fn every_payload_maps_to_its_stage_topic() {
        let collection_id = CollectionId::new();
        let payload = StagePayload::BulkOperation {
            operation: BulkOperation::EvictDerivatives { collection_id },
        };
        assert_eq!(payload.topic(), Topic::BulkOperation);
        assert_eq!(payload.topic().as_str(), "bulk.operation");
    }
}
