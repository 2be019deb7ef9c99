//! Shared end-to-end harness: in-memory backends, the real filesystem
//! walker, and live worker pools over a scratch directory.

// Each integration test binary compiles its own copy; not every binary
// touches every helper.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use vitrine_core::archive::ArchiveStore;
use vitrine_core::bus::{MemoryBus, MessageBus};
use vitrine_core::cache_folder::CacheFolderAllocator;
use vitrine_core::codec::CodecGateway;
use vitrine_core::config::{PipelineConfig, RetryConfig};
use vitrine_core::coordinator::ScanCoordinator;
use vitrine_core::derivative::DerivativeEngine;
use vitrine_core::index::{CollectionIndex, IndexMaintainer, MemoryIndex};
use vitrine_core::ledger::{JobLedger, MemoryLedger};
use vitrine_core::service::CatalogService;
use vitrine_core::store::CatalogStore;
use vitrine_core::walker::{FileSystem, RealFs, Walker};
use vitrine_core::workers::{
    BulkWorker, CollectionScanWorker, DerivativeWorker, LibraryScanWorker,
    MetadataWorker, WorkerContext, spawn_stage,
};
use vitrine_model::cache_folder::CacheFolder;
use vitrine_model::ids::JobId;
use vitrine_model::job::JobRecord;
use vitrine_model::library::Library;

pub struct TestPipeline {
    pub service: CatalogService,
    pub coordinator: ScanCoordinator,
    pub catalog: CatalogStore,
    pub ledger: Arc<dyn JobLedger>,
    pub bus: Arc<dyn MessageBus>,
    pub index: Arc<dyn CollectionIndex>,
    pub cache_root: PathBuf,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TestPipeline {
    /// Memory-backed pipeline with live workers over the real filesystem.
    pub async fn start(library_root: &Path, cache_root: &Path) -> Self {
        Self::start_with_workers(library_root, cache_root, true).await
    }

    /// Same wiring, but with no consumers running: messages stay queued.
    pub async fn start_paused(library_root: &Path, cache_root: &Path) -> Self {
        Self::start_with_workers(library_root, cache_root, false).await
    }

    async fn start_with_workers(
        library_root: &Path,
        cache_root: &Path,
        spawn_workers: bool,
    ) -> Self {
        let mut pipeline = PipelineConfig::default();
        pipeline.retry = RetryConfig {
            max_attempts: 3,
            backoff_min_ms: 5,
            backoff_max_ms: 50,
        };
        pipeline.workers.job_timeout_ms = 30_000;
        let pipeline = Arc::new(pipeline);

        let catalog = CatalogStore::in_memory();
        let ledger: Arc<dyn JobLedger> = Arc::new(MemoryLedger::new());
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new(
            pipeline.workers.queue_capacity,
            pipeline.retry,
        ));
        let index: Arc<dyn CollectionIndex> = Arc::new(MemoryIndex::new());
        let fs: Arc<dyn FileSystem> = Arc::new(RealFs::new());

        tokio::fs::create_dir_all(cache_root).await.unwrap();
        let folder =
            CacheFolder::new("test-cache", cache_root.to_path_buf(), 1 << 30, 0);
        catalog.cache_folders.insert_cache_folder(&folder).await.unwrap();

        let library = Library::new("test-library", library_root.to_path_buf());
        catalog.libraries.insert_library(&library).await.unwrap();

        let engine = DerivativeEngine::new(CodecGateway::new());
        let coordinator = ScanCoordinator::new(
            catalog.clone(),
            ledger.clone(),
            bus.clone(),
            index.clone(),
            fs.clone(),
            pipeline.clone(),
        );
        let maintainer = Arc::new(IndexMaintainer::new(
            catalog.clone(),
            index.clone(),
            engine,
            pipeline.index.rebuild_threshold_ratio,
        ));
        let service = CatalogService::new(
            catalog.clone(),
            ledger.clone(),
            bus.clone(),
            index.clone(),
            maintainer,
            coordinator.clone(),
            pipeline.clone(),
        );

        let ctx = Arc::new(WorkerContext {
            catalog: catalog.clone(),
            ledger: ledger.clone(),
            bus: bus.clone(),
            index: index.clone(),
            archives: ArchiveStore::new(pipeline.archive),
            engine,
            allocator: CacheFolderAllocator::new(
                catalog.cache_folders.clone(),
            ),
            walker: Arc::new(Walker::new(fs)),
            config: pipeline.clone(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        if spawn_workers {
            handles.extend(spawn_stage(
                ctx.clone(),
                Arc::new(LibraryScanWorker::new(coordinator.clone())),
                shutdown_rx.clone(),
            ));
            handles.extend(spawn_stage(
                ctx.clone(),
                Arc::new(CollectionScanWorker::new()),
                shutdown_rx.clone(),
            ));
            handles.extend(spawn_stage(
                ctx.clone(),
                Arc::new(DerivativeWorker::thumbnails()),
                shutdown_rx.clone(),
            ));
            handles.extend(spawn_stage(
                ctx.clone(),
                Arc::new(DerivativeWorker::cache_images()),
                shutdown_rx.clone(),
            ));
            handles.extend(spawn_stage(
                ctx.clone(),
                Arc::new(MetadataWorker::new()),
                shutdown_rx.clone(),
            ));
            handles.extend(spawn_stage(
                ctx.clone(),
                Arc::new(BulkWorker::new()),
                shutdown_rx,
            ));
        }

        Self {
            service,
            coordinator,
            catalog,
            ledger,
            bus,
            index,
            cache_root: cache_root.to_path_buf(),
            shutdown,
            handles,
        }
    }

    pub async fn library(&self) -> Library {
        self.catalog
            .libraries
            .list_libraries()
            .await
            .unwrap()
            .into_iter()
            .next()
            .expect("harness seeds one library")
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for_job(&self, job_id: JobId) -> JobRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let job = self
                .ledger
                .job(job_id)
                .await
                .unwrap()
                .expect("job exists");
            if job.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for job {job_id}: {job:?}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until every descendant of the job is terminal as well.
    pub async fn wait_for_tree(&self, job_id: JobId) -> JobRecord {
        let root = self.wait_for_job(job_id).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let mut all_terminal = true;
            let mut frontier = vec![job_id];
            while let Some(current) = frontier.pop() {
                for child in self.ledger.children(current).await.unwrap() {
                    if !child.is_terminal() {
                        all_terminal = false;
                    }
                    frontier.push(child.id);
                }
            }
            if all_terminal {
                return root;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for job tree {job_id}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Write a real encoded image fixture.
pub fn write_image(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let format = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => image::ImageFormat::Png,
        _ => image::ImageFormat::Jpeg,
    };
    let pixels = image::DynamicImage::new_rgb8(width, height);
    pixels.save_with_format(path, format).unwrap();
}

/// Encoded image bytes for archive fixtures.
pub fn image_bytes(width: u32, height: u32) -> Vec<u8> {
    let pixels = image::DynamicImage::new_rgb8(width, height);
    let mut bytes = Vec::new();
    pixels
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Jpeg,
        )
        .unwrap();
    bytes
}
