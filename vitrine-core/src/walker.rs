use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;
use vitrine_model::collection::{CollectionKind, OriginSignature};

use crate::error::{CatalogError, Result};

/// Minimal, async-capable filesystem abstraction used by the walker.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Check whether a path exists.
    async fn path_exists(&self, path: &Path) -> bool;

    /// Open a directory for iteration.
    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>>;

    /// Fetch lightweight file metadata.
    async fn metadata(&self, path: &Path) -> Result<FsMetadata>;
}

#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn path_exists(&self, path: &Path) -> bool {
        (**self).path_exists(path).await
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>> {
        (**self).read_dir(path).await
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata> {
        (**self).metadata(path).await
    }
}

/// Lightweight metadata needed by the walker.
#[derive(Debug, Clone, Copy)]
pub struct FsMetadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub inode: Option<u64>,
}

impl FsMetadata {
    pub fn mtime_unix(&self) -> i64 {
        self.modified
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn signature(&self) -> OriginSignature {
        OriginSignature::FileStat {
            inode: self.inode,
            mtime_unix: self.mtime_unix(),
            size: self.len,
        }
    }
}

/// Async directory iterator.
#[async_trait]
pub trait ReadDirStream {
    /// Return next entry's path, or None when exhausted.
    async fn next_entry(&mut self) -> Result<Option<PathBuf>>;
}

/// Real filesystem implementation backed by tokio::fs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for RealFs {
    async fn path_exists(&self, path: &Path) -> bool {
        // try_exists reports false on permission errors instead of failing
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>> {
        let rd = tokio::fs::read_dir(path).await?;
        Ok(Box::new(RealReadDir { inner: rd }))
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata> {
        let md = tokio::fs::metadata(path).await?;
        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt;
            Some(md.ino())
        };
        #[cfg(not(unix))]
        let inode = None;
        Ok(FsMetadata {
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            len: md.len(),
            modified: md.modified().ok(),
            inode,
        })
    }
}

struct RealReadDir {
    inner: tokio::fs::ReadDir,
}

#[async_trait]
impl ReadDirStream for RealReadDir {
    async fn next_entry(&mut self) -> Result<Option<PathBuf>> {
        Ok(self.inner.next_entry().await?.map(|entry| entry.path()))
    }
}

/// In-memory filesystem for tests. Paths are treated literally; callers
/// should use consistent absolute paths.
#[derive(Debug, Default, Clone)]
pub struct InMemoryFs {
    nodes: HashMap<PathBuf, Node>,
}

#[derive(Debug, Clone)]
enum Node {
    Dir { children: Vec<PathBuf> },
    File { len: u64, mtime_unix: i64 },
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir<P: Into<PathBuf>>(&mut self, path: P) {
        let path = path.into();
        if self.nodes.contains_key(&path) {
            return;
        }
        self.ensure_parent_link(&path);
        self.nodes.insert(
            path,
            Node::Dir {
                children: Vec::new(),
            },
        );
    }

    pub fn add_file<P: Into<PathBuf>>(&mut self, path: P, len: u64) {
        self.add_file_with_mtime(path, len, 0);
    }

    pub fn add_file_with_mtime<P: Into<PathBuf>>(
        &mut self,
        path: P,
        len: u64,
        mtime_unix: i64,
    ) {
        let path = path.into();
        self.ensure_parent_link(&path);
        self.nodes.insert(path, Node::File { len, mtime_unix });
    }

    pub fn remove(&mut self, path: &Path) {
        self.nodes.remove(path);
        if let Some(parent) = path.parent()
            && let Some(Node::Dir { children }) = self.nodes.get_mut(parent)
        {
            children.retain(|child| child.as_path() != path);
        }
    }

    fn ensure_parent_link(&mut self, path: &Path) {
        if let Some(parent) = path.parent() {
            if !self.nodes.contains_key(parent) {
                self.nodes.insert(
                    parent.to_path_buf(),
                    Node::Dir {
                        children: Vec::new(),
                    },
                );
                self.ensure_parent_link(parent);
            }
            if let Some(Node::Dir { children }) = self.nodes.get_mut(parent)
                && !children.iter().any(|p| p.as_path() == path)
            {
                children.push(path.to_path_buf());
            }
        }
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn path_exists(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>> {
        match self.nodes.get(path) {
            Some(Node::Dir { children }) => Ok(Box::new(InMemReadDir {
                queue: children.clone().into(),
            })),
            Some(Node::File { .. }) => Err(CatalogError::Internal(format!(
                "read_dir on file: {}",
                path.display()
            ))),
            None => Err(CatalogError::NotFound(format!(
                "read_dir on missing path: {}",
                path.display()
            ))),
        }
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata> {
        match self.nodes.get(path) {
            Some(Node::Dir { .. }) => Ok(FsMetadata {
                is_dir: true,
                is_file: false,
                len: 0,
                modified: None,
                inode: None,
            }),
            Some(Node::File { len, mtime_unix }) => Ok(FsMetadata {
                is_dir: false,
                is_file: true,
                len: *len,
                modified: Some(
                    UNIX_EPOCH
                        + std::time::Duration::from_secs(
                            (*mtime_unix).max(0) as u64,
                        ),
                ),
                inode: None,
            }),
            None => Err(CatalogError::NotFound(format!(
                "metadata on missing path: {}",
                path.display()
            ))),
        }
    }
}

struct InMemReadDir {
    queue: VecDeque<PathBuf>,
}

#[async_trait]
impl ReadDirStream for InMemReadDir {
    async fn next_entry(&mut self) -> Result<Option<PathBuf>> {
        Ok(self.queue.pop_front())
    }
}

/// Filtering applied during media enumeration.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Lowercase extensions (no dot) accepted. Empty accepts nothing.
    pub allowed_formats: Vec<String>,
    /// Glob patterns (`*` and `?`) matched against the `/`-separated path
    /// relative to the enumeration root.
    pub excluded_paths: Vec<String>,
    /// Files larger than this are skipped; zero disables the limit.
    pub max_file_size: u64,
}

impl ScanFilter {
    fn exclusion_regexes(&self) -> Vec<Regex> {
        self.excluded_paths
            .iter()
            .filter_map(|pattern| match glob_to_regex(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(
                        target: "scan::walker",
                        pattern = %pattern,
                        error = %err,
                        "ignoring unparseable exclusion pattern"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Translate a shell-style glob (`*`, `?`) into an anchored regex that
/// matches anywhere along the relative path.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    for ch in pattern.chars() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    Regex::new(&format!("(^|/){translated}($|/)"))
}

/// A media file discovered during enumeration.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub absolute_path: PathBuf,
    /// `/`-separated path relative to the enumeration root.
    pub relative_path: String,
    pub filename: String,
    /// Lowercase extension without the dot.
    pub format: String,
    pub byte_size: u64,
    pub metadata: FsMetadata,
}

/// A first-level scan candidate: a subdirectory or an archive file.
#[derive(Debug, Clone)]
pub struct CandidateCollection {
    pub path: PathBuf,
    pub display_name: String,
    pub kind: CollectionKind,
    pub signature: OriginSignature,
}

/// Recursive directory traversal with format/size filtering and exclusion
/// globs, plus the one-level discovery mode used for collection
/// materialization.
pub struct Walker<F: FileSystem> {
    fs: F,
}

impl<F: FileSystem> std::fmt::Debug for Walker<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Walker")
            .field("fs", &std::any::type_name::<F>())
            .finish()
    }
}

impl<F: FileSystem> Walker<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Walk exactly one level below `root`, yielding subdirectories and
    /// archive files as collection candidates. Regular files that are not
    /// archives are ignored at this level.
    pub async fn discover_collections(
        &self,
        root: &Path,
    ) -> Result<Vec<CandidateCollection>> {
        if !self.fs.path_exists(root).await {
            return Err(CatalogError::NotFound(format!(
                "library root missing: {}",
                root.display()
            )));
        }

        let mut candidates = Vec::new();
        let mut dir = self.fs.read_dir(root).await?;
        while let Some(path) = dir.next_entry().await? {
            let meta = match self.fs.metadata(&path).await {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(
                        target: "scan::walker",
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable entry during discovery"
                    );
                    continue;
                }
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            if meta.is_dir {
                candidates.push(CandidateCollection {
                    path: path.clone(),
                    display_name: name.to_string(),
                    kind: CollectionKind::Directory,
                    signature: meta.signature(),
                });
            } else if meta.is_file
                && let Some(kind) = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .and_then(CollectionKind::from_extension)
            {
                candidates.push(CandidateCollection {
                    path: path.clone(),
                    display_name: name.to_string(),
                    kind,
                    signature: meta.signature(),
                });
            }
        }

        candidates.sort_by(|a, b| {
            fold_path(&a.display_name).cmp(&fold_path(&b.display_name))
        });
        Ok(candidates)
    }

    /// Recursively enumerate media files under `root`, honoring the filter.
    /// Results are ordered lexicographically on the case-folded relative
    /// path, locale-independent.
    pub async fn enumerate_media(
        &self,
        root: &Path,
        filter: &ScanFilter,
    ) -> Result<Vec<DiscoveredFile>> {
        if !self.fs.path_exists(root).await {
            return Err(CatalogError::NotFound(format!(
                "collection root missing: {}",
                root.display()
            )));
        }

        let exclusions = filter.exclusion_regexes();
        let mut found = Vec::new();
        let mut pending: VecDeque<PathBuf> = VecDeque::new();
        pending.push_back(root.to_path_buf());

        while let Some(dir_path) = pending.pop_front() {
            let mut dir = match self.fs.read_dir(&dir_path).await {
                Ok(dir) => dir,
                Err(err) => {
                    warn!(
                        target: "scan::walker",
                        path = %dir_path.display(),
                        error = %err,
                        "skipping unreadable directory"
                    );
                    continue;
                }
            };

            while let Some(path) = dir.next_entry().await? {
                let Some(name) = path.file_name().and_then(|n| n.to_str())
                else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let relative = relative_slash_path(root, &path);
                if exclusions.iter().any(|re| re.is_match(&relative)) {
                    continue;
                }

                let meta = match self.fs.metadata(&path).await {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!(
                            target: "scan::walker",
                            path = %path.display(),
                            error = %err,
                            "skipping unreadable entry"
                        );
                        continue;
                    }
                };

                if meta.is_dir {
                    pending.push_back(path);
                    continue;
                }
                if !meta.is_file {
                    continue;
                }
                let Some(format) = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
                else {
                    continue;
                };
                if !filter.allowed_formats.contains(&format) {
                    continue;
                }
                if filter.max_file_size > 0 && meta.len > filter.max_file_size {
                    continue;
                }

                let filename = name.to_string();
                found.push(DiscoveredFile {
                    absolute_path: path,
                    relative_path: relative,
                    filename,
                    format,
                    byte_size: meta.len,
                    metadata: meta,
                });
            }
        }

        found.sort_by(|a, b| {
            fold_path(&a.relative_path)
                .cmp(&fold_path(&b.relative_path))
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });
        Ok(found)
    }
}

/// `/`-separated path of `path` relative to `root`; falls back to the file
/// name when `path` is not under `root`.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut out = String::new();
    for component in relative.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Locale-independent case folding for ordering.
pub fn fold_path(path: &str) -> String {
    path.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(formats: &[&str]) -> ScanFilter {
        ScanFilter {
            allowed_formats: formats.iter().map(|s| s.to_string()).collect(),
            excluded_paths: Vec::new(),
            max_file_size: 0,
        }
    }

    fn sample_fs() -> InMemoryFs {
        let mut fs = InMemoryFs::new();
        fs.add_dir("/lib");
        fs.add_dir("/lib/albumA");
        fs.add_file("/lib/albumA/b.png", 10);
        fs.add_file("/lib/albumA/a.jpg", 10);
        fs.add_file("/lib/albumA/notes.txt", 10);
        fs.add_dir("/lib/albumA/sub");
        fs.add_file("/lib/albumA/sub/c.jpg", 10);
        fs.add_file("/lib/bundle.zip", 10);
        fs.add_file("/lib/loose.jpg", 10);
        fs.add_file("/lib/.hidden.zip", 10);
        fs
    }

    #[tokio::test]
    async fn discovery_finds_directories_and_archives_only() {
        let walker = Walker::new(sample_fs());
        let candidates =
            walker.discover_collections(Path::new("/lib")).await.unwrap();
        let names: Vec<&str> = candidates
            .iter()
            .map(|c| c.display_name.as_str())
            .collect();
        assert_eq!(names, vec!["albumA", "bundle.zip"]);
        assert_eq!(candidates[1].kind, CollectionKind::Zip);
    }

    #[tokio::test]
    async fn enumeration_recurses_filters_and_orders() {
        let walker = Walker::new(sample_fs());
        let files = walker
            .enumerate_media(Path::new("/lib/albumA"), &filter(&["jpg", "png"]))
            .await
            .unwrap();
        let paths: Vec<&str> =
            files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.jpg", "b.png", "sub/c.jpg"]);
    }

    #[tokio::test]
    async fn exclusion_globs_prune_subtrees() {
        let walker = Walker::new(sample_fs());
        let mut f = filter(&["jpg", "png"]);
        f.excluded_paths.push("sub".to_string());
        let files = walker
            .enumerate_media(Path::new("/lib/albumA"), &f)
            .await
            .unwrap();
        assert!(files.iter().all(|f| !f.relative_path.starts_with("sub/")));
    }

    #[tokio::test]
    async fn max_file_size_skips_oversized_files() {
        let mut fs = sample_fs();
        fs.add_file("/lib/albumA/huge.jpg", 1_000_000);
        let walker = Walker::new(fs);
        let mut f = filter(&["jpg", "png"]);
        f.max_file_size = 100;
        let files = walker
            .enumerate_media(Path::new("/lib/albumA"), &f)
            .await
            .unwrap();
        assert!(files.iter().all(|f| f.filename != "huge.jpg"));
    }

    #[tokio::test]
    async fn removed_files_disappear_from_the_next_enumeration() {
        let mut fs = sample_fs();
        fs.remove(Path::new("/lib/albumA/b.png"));
        let walker = Walker::new(fs);
        let files = walker
            .enumerate_media(Path::new("/lib/albumA"), &filter(&["jpg", "png"]))
            .await
            .unwrap();
        let paths: Vec<&str> =
            files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.jpg", "sub/c.jpg"]);
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let walker = Walker::new(InMemoryFs::new());
        let err = walker
            .discover_collections(Path::new("/nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[test]
    fn case_folded_ordering_is_locale_independent() {
        let mut paths = vec!["B.jpg", "a.jpg", "C.jpg"];
        paths.sort_by(|a, b| fold_path(a).cmp(&fold_path(b)));
        assert_eq!(paths, vec!["a.jpg", "B.jpg", "C.jpg"]);
    }
}
