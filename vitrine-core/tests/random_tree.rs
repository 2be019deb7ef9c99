//! Property-style ingest: a seeded random library tree (directories and a
//! zip archive, bounded depth and fan-out) goes through the full pipeline,
//! then every catalog invariant is checked.

mod common;

use std::io::Write;
use std::path::Path;

use common::{TestPipeline, image_bytes, write_image};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vitrine_model::collection::CollectionKind;
use vitrine_model::index::CollectionFilter;
use vitrine_model::job::JobStatus;

const MAX_DEPTH: usize = 3;
const MAX_FANOUT: usize = 4;

fn populate_directory(
    rng: &mut StdRng,
    dir: &Path,
    depth: usize,
    files_created: &mut usize,
) {
    let file_count = rng.random_range(1..=MAX_FANOUT);
    for index in 0..file_count {
        let extension = if rng.random_bool(0.5) { "jpg" } else { "png" };
        let edge = rng.random_range(8..=64);
        write_image(
            &dir.join(format!("img_{depth}_{index}.{extension}")),
            edge,
            edge,
        );
        *files_created += 1;
    }
    if depth < MAX_DEPTH && rng.random_bool(0.6) {
        let subdir = dir.join(format!("nested_{depth}"));
        std::fs::create_dir_all(&subdir).unwrap();
        populate_directory(rng, &subdir, depth + 1, files_created);
    }
}

fn write_random_zip(rng: &mut StdRng, path: &Path) -> usize {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    let entry_count = rng.random_range(1..=MAX_FANOUT);
    for index in 0..entry_count {
        let edge = rng.random_range(8..=32);
        writer
            .start_file(format!("entry_{index}.jpg"), options)
            .unwrap();
        writer.write_all(&image_bytes(edge, edge)).unwrap();
    }
    writer.finish().unwrap();
    entry_count
}

#[tokio::test]
async fn random_tree_ingest_preserves_every_invariant() {
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let collection_count = rng.random_range(2..=MAX_FANOUT);
    let mut total_files = 0usize;
    for index in 0..collection_count {
        let dir = root.path().join(format!("album_{index}"));
        std::fs::create_dir_all(&dir).unwrap();
        populate_directory(&mut rng, &dir, 0, &mut total_files);
    }
    total_files +=
        write_random_zip(&mut rng, &root.path().join("bundle.zip"));

    let pipeline = TestPipeline::start(root.path(), cache.path()).await;
    let library = pipeline.library().await;
    let job_id = pipeline
        .service
        .start_library_scan(library.id, false)
        .await
        .unwrap();
    let parent = pipeline.wait_for_tree(job_id).await;
    assert_eq!(parent.status, JobStatus::Completed);
    assert_eq!(parent.progress.completed, collection_count as u64 + 1);
    assert_eq!(parent.progress.failed, 0);

    let collections = pipeline
        .catalog
        .collections
        .active_collections()
        .await
        .unwrap();
    assert_eq!(collections.len(), collection_count + 1);

    let mut cataloged_files = 0usize;
    for collection in &collections {
        let stats = &collection.statistics;
        cataloged_files += collection.media_items.len();

        // mediaCount mirrors the embedded list; derivative counters never
        // exceed it.
        assert_eq!(stats.media_count, collection.media_items.len() as u64);
        assert!(stats.thumbnail_count <= stats.media_count);
        assert!(stats.cached_count <= stats.media_count);
        assert_eq!(
            stats.total_bytes,
            collection.media_items.iter().map(|i| i.byte_size).sum::<u64>()
        );

        // Insertion orders are dense and unique.
        let mut orders: Vec<u32> = collection
            .media_items
            .iter()
            .map(|item| item.insertion_order)
            .collect();
        orders.sort_unstable();
        let expected: Vec<u32> = (0..orders.len() as u32).collect();
        assert_eq!(orders, expected);

        // Every derivative points at a live media item; archives carry no
        // direct references.
        for derivative in collection
            .thumbnails
            .iter()
            .chain(collection.cache_images.iter())
        {
            assert!(
                collection
                    .media_items
                    .iter()
                    .any(|item| item.id == derivative.media_item_id)
            );
            if collection.kind != CollectionKind::Directory {
                assert!(!derivative.is_direct);
            }
        }
    }
    assert_eq!(cataloged_files, total_files);

    // Cache folder accounting: quota respected, counter matches disk.
    let folder = pipeline
        .catalog
        .cache_folders
        .list_cache_folders()
        .await
        .unwrap()
        .remove(0);
    assert!(folder.current_bytes <= folder.max_bytes);
    let mut on_disk = 0u64;
    let mut pending = vec![pipeline.cache_root.clone()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let meta = entry.metadata().unwrap();
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                on_disk += meta.len();
            }
        }
    }
    assert_eq!(folder.current_bytes, on_disk);

    // Job-tree accounting: totals balance and terminal states are settled.
    let mut frontier = vec![job_id];
    while let Some(current) = frontier.pop() {
        let job = pipeline.ledger.job(current).await.unwrap().unwrap();
        assert!(job.is_terminal());
        assert_eq!(
            job.progress.total,
            job.progress.completed
                + job.progress.failed
                + job.progress.skipped
                + job.progress.pending()
        );
        assert_eq!(job.progress.pending(), 0);
        for child in pipeline.ledger.children(current).await.unwrap() {
            frontier.push(child.id);
        }
    }

    // The index mirrors the catalog exactly.
    assert_eq!(
        pipeline.index.count(&CollectionFilter::any()).await.unwrap(),
        collections.len() as u64
    );
    for collection in &collections {
        let entry = pipeline
            .index
            .entry(collection.id)
            .await
            .unwrap()
            .expect("every active collection is indexed");
        assert_eq!(entry.image_count, collection.statistics.media_count);
    }

    pipeline.stop().await;
}
