use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vitrine_core::archive::ArchiveStore;
use vitrine_core::bus::{MemoryBus, MessageBus, PostgresBus};
use vitrine_core::cache_folder::CacheFolderAllocator;
use vitrine_core::codec::CodecGateway;
use vitrine_core::config::PipelineConfig;
use vitrine_core::coordinator::ScanCoordinator;
use vitrine_core::derivative::DerivativeEngine;
use vitrine_core::index::{
    CollectionIndex, IndexMaintainer, MemoryIndex, RedisIndex,
};
use vitrine_core::ledger::{JobLedger, MemoryLedger, PostgresLedger};
use vitrine_core::schedule::lease::redis_lease::RedisLease;
use vitrine_core::schedule::{FiringLease, MemoryLease, Scheduler};
use vitrine_core::service::{CatalogService, ScheduledJobSpec};
use vitrine_core::store::{CatalogStore, PostgresCatalog};
use vitrine_core::walker::{FileSystem, RealFs, Walker};
use vitrine_core::workers::{
    BulkWorker, CollectionScanWorker, DerivativeWorker, LibraryScanWorker,
    MetadataWorker, WorkerContext, spawn_stage,
};
use vitrine_model::cache_folder::CacheFolder;
use vitrine_model::job::JobKind;
use vitrine_model::library::Library;
use vitrine_model::schedule::ScheduleType;

use crate::config::ServerConfig;

pub struct Runtime {
    pub service: CatalogService,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub async fn start(
        config: &ServerConfig,
        ephemeral: bool,
    ) -> anyhow::Result<Self> {
        let pipeline = Arc::new(config.pipeline.clone());

        let (catalog, ledger, bus, index, lease) =
            build_backends(config, ephemeral, &pipeline).await?;

        seed_cache_folders(&catalog, config).await?;
        let libraries = seed_libraries(&catalog, config).await?;

        let engine = DerivativeEngine::new(CodecGateway::new());
        let allocator = CacheFolderAllocator::new(catalog.cache_folders.clone());
        let archives = ArchiveStore::new(pipeline.archive);
        let fs: Arc<dyn FileSystem> = Arc::new(RealFs::new());

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
            maintainer.clone(),
            coordinator.clone(),
            pipeline.clone(),
        );

        seed_auto_scan_triggers(&service, &catalog, &libraries).await?;

        // Bring the derived index in line with the catalog before serving.
        if let Err(err) = maintainer.ensure_consistent().await {
            warn!(error = %err, "startup index consistency check failed");
        }

        let ctx = Arc::new(WorkerContext {
            catalog: catalog.clone(),
            ledger: ledger.clone(),
            bus: bus.clone(),
            index: index.clone(),
            archives,
            engine,
            allocator,
            walker: Arc::new(Walker::new(fs)),
            config: pipeline.clone(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
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
            shutdown_rx.clone(),
        ));

        let scheduler = Scheduler::new(
            catalog.schedules.clone(),
            ledger.clone(),
            coordinator,
            lease,
            pipeline.scheduler,
        );
        let scheduler_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run(scheduler_rx).await;
        }));

        info!(workers = handles.len(), "pipeline runtime started");
        Ok(Self {
            service,
            shutdown,
            handles,
        })
    }

    /// Signal every worker loop and wait for them to drain.
    pub async fn shutdown(self) {
        info!("shutting down pipeline runtime");
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

type Backends = (
    CatalogStore,
    Arc<dyn JobLedger>,
    Arc<dyn MessageBus>,
    Arc<dyn CollectionIndex>,
    Arc<dyn FiringLease>,
);

async fn build_backends(
    config: &ServerConfig,
    ephemeral: bool,
    pipeline: &Arc<PipelineConfig>,
) -> anyhow::Result<Backends> {
    if ephemeral || config.database_url.is_none() {
        info!("running with in-memory backends");
        return Ok((
            CatalogStore::in_memory(),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryBus::new(
                pipeline.workers.queue_capacity,
                pipeline.retry,
            )),
            Arc::new(MemoryIndex::new()),
            Arc::new(MemoryLease::new()),
        ));
    }

    let database_url = config
        .database_url
        .as_deref()
        .expect("checked above");
    let postgres = PostgresCatalog::connect(database_url)
        .await
        .context("connecting to Postgres")?;
    postgres.migrate().await.context("running migrations")?;
    let pool = postgres.pool().clone();

    let catalog = postgres.into_catalog_store();
    let ledger: Arc<dyn JobLedger> =
        Arc::new(PostgresLedger::new(pool.clone()));
    let bus: Arc<dyn MessageBus> = Arc::new(PostgresBus::new(
        pool,
        pipeline.workers.queue_capacity,
        pipeline.retry,
    ));

    let (index, lease): (Arc<dyn CollectionIndex>, Arc<dyn FiringLease>) =
        match config.redis_url.as_deref() {
            Some(redis_url) => (
                Arc::new(
                    RedisIndex::connect(redis_url)
                        .await
                        .context("connecting to Redis")?,
                ),
                Arc::new(
                    RedisLease::connect(redis_url)
                        .await
                        .context("connecting to Redis")?,
                ),
            ),
            None => {
                info!("no redis_url configured; using the in-process index");
                (Arc::new(MemoryIndex::new()), Arc::new(MemoryLease::new()))
            }
        };

    Ok((catalog, ledger, bus, index, lease))
}

async fn seed_cache_folders(
    catalog: &CatalogStore,
    config: &ServerConfig,
) -> anyhow::Result<()> {
    let existing = catalog.cache_folders.list_cache_folders().await?;
    for folder_config in &config.cache_folders {
        if existing.iter().any(|f| f.name == folder_config.name) {
            continue;
        }
        tokio::fs::create_dir_all(&folder_config.root_path)
            .await
            .with_context(|| {
                format!(
                    "creating cache folder {}",
                    folder_config.root_path.display()
                )
            })?;
        let folder = CacheFolder::new(
            folder_config.name.clone(),
            folder_config.root_path.clone(),
            folder_config.max_bytes,
            folder_config.priority,
        );
        catalog.cache_folders.insert_cache_folder(&folder).await?;
        info!(name = %folder.name, "registered cache folder");
    }
    Ok(())
}

async fn seed_libraries(
    catalog: &CatalogStore,
    config: &ServerConfig,
) -> anyhow::Result<Vec<Library>> {
    let mut known = catalog.libraries.list_libraries().await?;
    for library_config in &config.libraries {
        if known.iter().any(|l| l.root_path == library_config.root_path) {
            continue;
        }
        let mut library = Library::new(
            library_config.display_name.clone(),
            library_config.root_path.clone(),
        );
        library.settings.auto_scan = library_config.auto_scan;
        library.settings.scan_interval_seconds =
            library_config.scan_interval_seconds;
        catalog.libraries.insert_library(&library).await?;
        info!(name = %library.display_name, "registered library");
        known.push(library);
    }
    Ok(known)
}

async fn seed_auto_scan_triggers(
    service: &CatalogService,
    catalog: &CatalogStore,
    libraries: &[Library],
) -> anyhow::Result<()> {
    let existing = catalog.schedules.list_scheduled_jobs().await?;
    for library in libraries {
        if !library.settings.auto_scan {
            continue;
        }
        let trigger_name = format!("auto-scan {}", library.display_name);
        if existing.iter().any(|job| job.display_name == trigger_name) {
            continue;
        }
        let mut parameters = serde_json::Map::new();
        parameters.insert(
            "library_id".to_string(),
            serde_json::Value::String(library.id.to_string()),
        );
        service
            .create_scheduled_job(ScheduledJobSpec {
                display_name: trigger_name,
                target_kind: JobKind::LibraryScan,
                schedule: ScheduleType::Interval {
                    every_seconds: library.settings.scan_interval_seconds,
                },
                enabled: true,
                parameters,
            })
            .await?;
    }
    Ok(())
}
