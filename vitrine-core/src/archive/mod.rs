//! Random-access enumeration and per-entry byte retrieval for zip, 7z, rar
//! and tar archives.
//!
//! The format backends are blocking; every call runs under
//! `spawn_blocking`, bounded per archive path so a hot archive cannot
//! monopolize the blocking pool. Entry names are canonicalized before they
//! reach the rest of the pipeline, and names arriving from old messages can
//! be repaired against the archive's real entry list when unambiguous.

mod rar;
mod seven_zip;
mod tarball;
mod zip_file;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::debug;
use vitrine_model::collection::CollectionKind;

use crate::config::ArchiveConfig;
use crate::error::{CatalogError, Result};

/// One entry as stored in the archive, before canonicalization.
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub raw_name: String,
    pub uncompressed_size: u64,
    pub is_dir: bool,
}

/// One usable media entry of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Canonical `/`-separated name.
    pub name: String,
    /// Name exactly as stored in the archive; used for byte retrieval.
    pub raw_name: String,
    pub uncompressed_size: u64,
}

/// Canonicalize an archive entry name: forward slashes, no leading `/`,
/// `.` and `..` collapsed. Returns `None` for entries that must not surface
/// (directories, `__MACOSX/` resource forks, hidden dot segments, names
/// escaping the archive root).
pub fn canonicalize_entry_name(raw: &str) -> Option<String> {
    let normalized = raw.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                // Entries that climb out of the archive are hostile input.
                if segments.pop().is_none() {
                    return None;
                }
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return None;
    }
    if segments
        .iter()
        .any(|s| *s == "__MACOSX" || s.starts_with('.'))
    {
        return None;
    }
    Some(segments.join("/"))
}

/// Resolve a possibly-truncated entry name against the canonical names in
/// `entries`. Exact match wins; otherwise a unique prefix or suffix match is
/// accepted.
pub fn repair_entry_name<'a>(
    requested: &str,
    entries: impl IntoIterator<Item = &'a str>,
) -> Result<String> {
    let mut matches: Vec<&str> = Vec::new();
    for name in entries {
        if name == requested {
            return Ok(name.to_string());
        }
        if name.starts_with(requested) || name.ends_with(requested) {
            matches.push(name);
        }
    }
    match matches.as_slice() {
        [] => Err(CatalogError::EntryNotFound {
            archive: String::new(),
            entry: requested.to_string(),
        }),
        [unique] => Ok(unique.to_string()),
        _ => Err(CatalogError::AmbiguousEntry(requested.to_string())),
    }
}

fn backend_list(path: &Path, kind: CollectionKind) -> Result<Vec<RawEntry>> {
    match kind {
        CollectionKind::Zip => zip_file::list(path),
        CollectionKind::SevenZip => seven_zip::list(path),
        CollectionKind::Rar => rar::list(path),
        CollectionKind::Tar => tarball::list(path),
        CollectionKind::Directory => Err(CatalogError::UnsupportedArchive(
            "directory collections have no archive entries".to_string(),
        )),
    }
}

fn backend_read(
    path: &Path,
    kind: CollectionKind,
    raw_name: &str,
) -> Result<Vec<u8>> {
    match kind {
        CollectionKind::Zip => zip_file::read(path, raw_name),
        CollectionKind::SevenZip => seven_zip::read(path, raw_name),
        CollectionKind::Rar => rar::read(path, raw_name),
        CollectionKind::Tar => tarball::read(path, raw_name),
        CollectionKind::Directory => Err(CatalogError::UnsupportedArchive(
            "directory collections have no archive entries".to_string(),
        )),
    }
}

/// Shared archive reading facade with a bounded per-path reader pool.
#[derive(Clone)]
pub struct ArchiveStore {
    config: ArchiveConfig,
    pools: Arc<DashMap<PathBuf, Arc<Semaphore>>>,
}

impl std::fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("config", &self.config)
            .field("pooled_paths", &self.pools.len())
            .finish()
    }
}

impl ArchiveStore {
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            config,
            pools: Arc::new(DashMap::new()),
        }
    }

    fn pool_for(&self, path: &Path) -> Arc<Semaphore> {
        self.pools
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.readers_per_archive.max(1)))
            })
            .clone()
    }

    /// Enumerate the archive's media-usable entries in archive-native order,
    /// canonicalized and filtered.
    pub async fn list_entries(
        &self,
        path: &Path,
        kind: CollectionKind,
    ) -> Result<Vec<ArchiveEntry>> {
        let pool = self.pool_for(path);
        let _permit = pool
            .acquire_owned()
            .await
            .map_err(|_| CatalogError::Cancelled("archive pool closed".into()))?;

        let path = path.to_path_buf();
        let raw = tokio::task::spawn_blocking(move || backend_list(&path, kind))
            .await
            .map_err(|e| CatalogError::Internal(format!("archive task: {e}")))??;

        Ok(raw
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .filter_map(|entry| {
                canonicalize_entry_name(&entry.raw_name).map(|name| {
                    ArchiveEntry {
                        name,
                        raw_name: entry.raw_name,
                        uncompressed_size: entry.uncompressed_size,
                    }
                })
            })
            .collect())
    }

    /// Read one entry's bytes by canonical name. When the name matches no
    /// entry and path repair is enabled, a unique prefix/suffix match is
    /// accepted in its place.
    pub async fn read_entry(
        &self,
        path: &Path,
        kind: CollectionKind,
        entry_name: &str,
    ) -> Result<Vec<u8>> {
        let entries = self.list_entries(path, kind).await?;
        let resolved = match entries.iter().find(|e| e.name == entry_name) {
            Some(entry) => entry.clone(),
            None if self.config.path_repair => {
                let repaired = repair_entry_name(
                    entry_name,
                    entries.iter().map(|e| e.name.as_str()),
                )
                .map_err(|err| match err {
                    CatalogError::EntryNotFound { entry, .. } => {
                        CatalogError::EntryNotFound {
                            archive: path.display().to_string(),
                            entry,
                        }
                    }
                    other => other,
                })?;
                debug!(
                    target: "scan::archive",
                    archive = %path.display(),
                    requested = %entry_name,
                    repaired = %repaired,
                    "repaired archive entry name"
                );
                entries
                    .into_iter()
                    .find(|e| e.name == repaired)
                    .ok_or_else(|| {
                        CatalogError::Internal(format!(
                            "repaired entry {repaired} vanished from listing"
                        ))
                    })?
            }
            None => {
                return Err(CatalogError::EntryNotFound {
                    archive: path.display().to_string(),
                    entry: entry_name.to_string(),
                });
            }
        };

        let pool = self.pool_for(path);
        let _permit = pool
            .acquire_owned()
            .await
            .map_err(|_| CatalogError::Cancelled("archive pool closed".into()))?;

        let path = path.to_path_buf();
        let raw_name = resolved.raw_name;
        tokio::task::spawn_blocking(move || backend_read(&path, kind, &raw_name))
            .await
            .map_err(|e| CatalogError::Internal(format!("archive task: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn canonicalization_strips_and_collapses() {
        assert_eq!(
            canonicalize_entry_name("/a/b/../c.jpg").as_deref(),
            Some("a/c.jpg")
        );
        assert_eq!(
            canonicalize_entry_name("sub\\y.jpg").as_deref(),
            Some("sub/y.jpg")
        );
        assert_eq!(canonicalize_entry_name("__MACOSX/._x.jpg"), None);
        assert_eq!(canonicalize_entry_name("a/.hidden/x.jpg"), None);
        assert_eq!(canonicalize_entry_name("../escape.jpg"), None);
        assert_eq!(canonicalize_entry_name("dir/"), Some("dir".to_string()));
    }

    #[test]
    fn repair_accepts_unique_prefix_and_suffix() {
        let entries = ["photos/x.jpg", "photos/sub/y.jpg"];
        assert_eq!(
            repair_entry_name("photos/x", entries).unwrap(),
            "photos/x.jpg"
        );
        assert_eq!(
            repair_entry_name("sub/y.jpg", entries).unwrap(),
            "photos/sub/y.jpg"
        );
    }

    #[test]
    fn repair_rejects_ambiguity_and_misses() {
        let entries = ["a/img.jpg", "b/img.jpg"];
        assert!(matches!(
            repair_entry_name("img.jpg", entries),
            Err(CatalogError::AmbiguousEntry(_))
        ));
        assert!(matches!(
            repair_entry_name("missing.png", entries),
            Err(CatalogError::EntryNotFound { .. })
        ));
    }

    fn write_test_zip(dir: &Path) -> PathBuf {
        let path = dir.join("bundle.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, bytes) in [
            ("x.jpg", b"xx".as_slice()),
            ("__MACOSX/._x.jpg", b"junk".as_slice()),
            ("sub/y.jpg", b"yy".as_slice()),
        ] {
            writer.start_file(name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[tokio::test]
    async fn zip_round_trip_filters_resource_forks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_zip(dir.path());
        let store = ArchiveStore::new(ArchiveConfig::default());

        let entries = store
            .list_entries(&path, CollectionKind::Zip)
            .await
            .unwrap();
        let names: Vec<&str> =
            entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["x.jpg", "sub/y.jpg"]);

        let bytes = store
            .read_entry(&path, CollectionKind::Zip, "sub/y.jpg")
            .await
            .unwrap();
        assert_eq!(bytes, b"yy");
    }

    #[tokio::test]
    async fn truncated_names_are_repaired_when_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_zip(dir.path());
        let store = ArchiveStore::new(ArchiveConfig::default());

        let bytes = store
            .read_entry(&path, CollectionKind::Zip, "y.jpg")
            .await
            .unwrap();
        assert_eq!(bytes, b"yy");
    }

    #[tokio::test]
    async fn tar_entries_list_in_native_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tar");
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, bytes) in
            [("b.jpg", b"bb".as_slice()), ("a.jpg", b"aa".as_slice())]
        {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, bytes).unwrap();
        }
        builder.finish().unwrap();
        drop(builder);

        let store = ArchiveStore::new(ArchiveConfig::default());
        let entries = store
            .list_entries(&path, CollectionKind::Tar)
            .await
            .unwrap();
        let names: Vec<&str> =
            entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b.jpg", "a.jpg"]);
        let bytes = store
            .read_entry(&path, CollectionKind::Tar, "a.jpg")
            .await
            .unwrap();
        assert_eq!(bytes, b"aa");
    }
}
