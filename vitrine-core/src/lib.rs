//! # Vitrine Core
//!
//! The ingestion pipeline and coordinating substrate of the Vitrine media
//! catalog: filesystem and archive discovery, derivative generation,
//! quota-bound cache folders, the job ledger, the ordered navigation
//! index, schedule-driven rescans, and the worker pools tying them
//! together over a topic-per-stage message bus.
//!
//! ## Architecture
//!
//! - Authoritative state lives in the [`store`] ports (in-memory or
//!   Postgres); collections are documents with embedded media and
//!   derivative lists, written compare-and-set on a version counter.
//! - The [`index`] is derived state for paginated sorted browsing,
//!   rebuildable from the store at any time (Redis or in-process).
//! - The [`bus`] delivers stage messages at-least-once with per-topic
//!   dead-letter queues; [`workers`] hold every stage idempotent.
//! - The [`coordinator`] fans a library scan out into collection scans;
//!   the [`schedule`] module fires timed rescans with coalescing.

pub mod archive;
pub mod bus;
pub mod cache_folder;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod derivative;
pub mod error;
pub mod index;
pub mod ledger;
pub mod reconcile;
pub mod schedule;
pub mod service;
pub mod store;
pub mod walker;
pub mod workers;

pub use error::{CatalogError, Result};

pub mod prelude {
    pub use crate::archive::ArchiveStore;
    pub use crate::bus::{MemoryBus, MessageBus};
    pub use crate::cache_folder::CacheFolderAllocator;
    pub use crate::codec::CodecGateway;
    pub use crate::config::PipelineConfig;
    pub use crate::coordinator::ScanCoordinator;
    pub use crate::derivative::DerivativeEngine;
    pub use crate::error::{CatalogError, Result};
    pub use crate::index::{
        CollectionIndex, IndexMaintainer, MemoryIndex, Page,
    };
    pub use crate::ledger::{JobLedger, MemoryLedger};
    pub use crate::schedule::{MemoryLease, Scheduler};
    pub use crate::service::{CatalogService, ScheduledJobSpec};
    pub use crate::store::{CatalogStore, MemoryCatalog};
    pub use crate::walker::{FileSystem, InMemoryFs, RealFs, Walker};
    pub use crate::workers::{
        BulkWorker, CollectionScanWorker, DerivativeWorker, LibraryScanWorker,
        MetadataWorker, StageWorker, WorkerContext, spawn_stage,
    };
}
