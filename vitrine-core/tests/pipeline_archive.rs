//! End-to-end archive ingestion.

mod common;

use std::io::Write;
use std::path::Path;

use common::{TestPipeline, image_bytes};
use vitrine_model::collection::CollectionKind;
use vitrine_model::job::JobStatus;

fn write_zip(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

#[tokio::test]
async fn zip_ingest_filters_resource_forks_and_keeps_native_order() {
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_zip(
        &root.path().join("bundle.zip"),
        &[
            ("x.jpg", image_bytes(100, 100)),
            ("__MACOSX/._x.jpg", b"resource fork junk".to_vec()),
            ("sub/y.jpg", image_bytes(100, 100)),
        ],
    );

    let pipeline = TestPipeline::start(root.path(), cache.path()).await;
    let library = pipeline.library().await;
    let job_id = pipeline
        .service
        .start_library_scan(library.id, false)
        .await
        .unwrap();
    let parent = pipeline.wait_for_tree(job_id).await;
    assert_eq!(parent.status, JobStatus::Completed);

    let collections = pipeline
        .catalog
        .collections
        .active_collections()
        .await
        .unwrap();
    assert_eq!(collections.len(), 1);
    let collection = &collections[0];
    assert_eq!(collection.kind, CollectionKind::Zip);
    assert_eq!(collection.display_name, "bundle.zip");

    let paths: Vec<&str> = collection
        .media_items
        .iter()
        .map(|item| item.relative_path.as_str())
        .collect();
    assert_eq!(paths, vec!["x.jpg", "sub/y.jpg"]);

    // Archive collections never carry direct derivative references.
    assert!(!collection.settings.use_direct_file_access);
    assert!(
        collection
            .thumbnails
            .iter()
            .chain(collection.cache_images.iter())
            .all(|d| !d.is_direct)
    );
    // Derivatives were rendered from streamed archive bytes.
    assert_eq!(collection.statistics.thumbnail_count, 2);
    assert_eq!(collection.statistics.cached_count, 2);
    for derivative in &collection.thumbnails {
        assert!(derivative.path.exists());
    }
    // Metadata extraction decoded entries in place.
    assert_eq!(collection.media_items[0].width, 100);

    pipeline.stop().await;
}

#[tokio::test]
async fn corrupt_archive_entries_fail_per_item_and_the_scan_continues() {
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_zip(
        &root.path().join("bundle.zip"),
        &[
            ("good.jpg", image_bytes(50, 50)),
            ("broken.jpg", b"this is not a jpeg".to_vec()),
        ],
    );

    let pipeline = TestPipeline::start(root.path(), cache.path()).await;
    let library = pipeline.library().await;
    let job_id = pipeline
        .service
        .start_library_scan(library.id, false)
        .await
        .unwrap();
    pipeline.wait_for_tree(job_id).await;

    let collection = pipeline
        .catalog
        .collections
        .active_collections()
        .await
        .unwrap()
        .remove(0);
    // Both entries are cataloged; only the decodable one has derivatives.
    assert_eq!(collection.statistics.media_count, 2);
    assert_eq!(collection.statistics.thumbnail_count, 1);

    let children = pipeline.ledger.children(job_id).await.unwrap();
    let scan = &children[0];
    assert_eq!(scan.progress.completed + scan.progress.failed, 2);
    assert_eq!(scan.progress.failed, 1);
    // A failed item fails its scan, which the parent aggregates.
    assert_eq!(scan.status, JobStatus::Failed);
    let parent = pipeline.ledger.job(job_id).await.unwrap().unwrap();
    assert_eq!(parent.progress.failed, 1);

    pipeline.stop().await;
}
