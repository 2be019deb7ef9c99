//! Shared data model for the Vitrine media catalog.
//!
//! Everything in this crate is plain data: identifiers, the catalog
//! aggregates (libraries, collections with their embedded media and
//! derivative lists, cache folders), the job ledger records, scheduled
//! triggers, pipeline message payloads, and the ordered-index entry types.
//! Behavior lives in `vitrine-core`; this crate only guarantees stable
//! serialization for message payloads and stored documents.

pub mod cache_folder;
pub mod collection;
pub mod ids;
pub mod index;
pub mod job;
pub mod library;
pub mod message;
pub mod preset;
pub mod schedule;

pub mod prelude {
    pub use crate::cache_folder::CacheFolder;
    pub use crate::collection::{
        CacheImageRef, Collection, CollectionKind, CollectionSettings,
        CollectionStatistics, MediaItem, MediaKind, OriginSignature,
        SourceLocator, ThumbnailRef,
    };
    pub use crate::ids::{
        CacheFolderId, CollectionId, JobId, LibraryId, MediaItemId,
        ScheduledJobId,
    };
    pub use crate::index::{
        CollectionFilter, IndexEntry, SortDirection, SortKey,
    };
    pub use crate::job::{
        ItemOutcome, JobKind, JobProgress, JobRecord, JobStatus, StageCounters,
    };
    pub use crate::library::{Library, LibrarySettings, LibraryStatistics};
    pub use crate::message::{
        BulkOperation, MessageEnvelope, StagePayload, Topic,
    };
    pub use crate::preset::{DerivativeKind, DerivativePreset, ImageFormat};
    pub use crate::schedule::{
        ScheduleOutcome, ScheduleType, ScheduledJob, ScheduledJobRun,
    };
}
