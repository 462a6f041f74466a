//! Provides the static file cache.
//!
//! The public directory is walked recursively and every file is kept in memory along with
//! its content type and modification timestamp. Requests are then served without touching
//! the disk at all. A [refresh](FileCache::refresh) re-walks the directory but only
//! re-reads files whose modification timestamp changed, everything else is carried over
//! from the previous cache generation.
//!
//! Each refresh builds a complete new path table which is swapped in atomically. Requests
//! therefore either observe the old or the new cache, never a half filled one - and files
//! which vanished from disk drop out without any bookkeeping.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use fnv::FnvHashMap;

use crate::config::Config;
use crate::fmt::format_size;
use crate::platform::Platform;

pub mod mime;

/// Contains the request path which an empty path or `/` resolves to.
pub const INDEX_DOCUMENT: &str = "/index.html";

/// Represents a single cached file.
pub struct CachedFile {
    /// Contains the plain file name (e.g. `app.css`).
    pub name: String,
    /// Contains the content type derived from the file extension.
    pub content_type: &'static str,
    /// Contains the raw file contents.
    pub data: Bytes,
    /// Contains the modification timestamp the file had when it was read.
    pub last_modified: SystemTime,
}

/// Maps request paths (`/sub/dir/name.ext`) to cached files.
type PathTable = FnvHashMap<String, Arc<CachedFile>>;

/// Provides an in-memory cache of a public file directory.
///
/// An instance is created and registered by [install](install), which also reads the
/// directory path from the system config (`server.public_dir`, defaulting to **public**).
pub struct FileCache {
    root: PathBuf,
    entries: ArcSwap<PathTable>,
}

impl FileCache {
    /// Creates a new (empty) cache for the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileCache {
            root: root.into(),
            entries: ArcSwap::new(Arc::new(PathTable::default())),
        }
    }

    /// Walks the public directory and updates the cache.
    ///
    /// Files whose modification timestamp matches the cached one are carried over without
    /// any disk I/O. Hidden entries (names starting with `.`) are skipped entirely. Note
    /// that symlink cycles are not detected, the public directory is expected to be a
    /// plain file tree.
    ///
    /// If the walk fails (e.g. because the directory is missing or unreadable), an error
    /// is returned and the previous cache generation stays in place.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let metadata = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("Cannot access public directory: {}", self.root.display()))?;
        if !metadata.is_dir() {
            return Err(anyhow::anyhow!(
                "Public directory {} isn't a directory!",
                self.root.display()
            ));
        }

        let previous = self.entries.load_full();
        let mut next = PathTable::default();
        let mut total_bytes = 0;
        let mut files_read = 0;

        // Iterative depth first walk so that arbitrarily nested directories cannot
        // overflow the stack...
        let mut work_list = vec![(String::new(), self.root.clone())];
        while let Some((prefix, directory)) = work_list.pop() {
            let mut children = tokio::fs::read_dir(&directory)
                .await
                .with_context(|| format!("Cannot list directory: {}", directory.display()))?;

            while let Some(child) = children
                .next_entry()
                .await
                .with_context(|| format!("Cannot list directory: {}", directory.display()))?
            {
                let name = child.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }

                let file_type = child.file_type().await.with_context(|| {
                    format!("Cannot determine file type: {}", child.path().display())
                })?;

                if file_type.is_dir() {
                    work_list.push((format!("{}/{}", prefix, name), child.path()));
                } else if file_type.is_file() {
                    let request_path = format!("{}/{}", prefix, name);
                    let cached = self
                        .load_file(&previous, &request_path, &child, name, &mut files_read)
                        .await?;
                    total_bytes += cached.data.len();
                    let _ = next.insert(request_path, cached);
                }
            }
        }

        log::info!(
            "Cached {} file(s) ({}) from {} - {} file(s) were (re-)read from disk...",
            next.len(),
            format_size(total_bytes),
            self.root.display(),
            files_read
        );

        self.entries.store(Arc::new(next));

        Ok(())
    }

    /// Either re-uses the previously cached entry (if the file is unchanged) or reads the
    /// file from disk.
    async fn load_file(
        &self,
        previous: &PathTable,
        request_path: &str,
        entry: &tokio::fs::DirEntry,
        name: String,
        files_read: &mut usize,
    ) -> anyhow::Result<Arc<CachedFile>> {
        let metadata = entry
            .metadata()
            .await
            .with_context(|| format!("Cannot read metadata: {}", entry.path().display()))?;
        let last_modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if let Some(cached) = previous
            .get(request_path)
            .filter(|cached| cached.last_modified == last_modified)
        {
            return Ok(cached.clone());
        }

        let data = tokio::fs::read(entry.path())
            .await
            .with_context(|| format!("Cannot read file: {}", entry.path().display()))?;
        *files_read += 1;

        Ok(Arc::new(CachedFile {
            content_type: mime::content_type(&name),
            name,
            data: Bytes::from(data),
            last_modified,
        }))
    }

    /// Resolves the given request path to a cached file.
    ///
    /// An empty path or `/` resolves to the index document. Everything else requires an
    /// exact match, there are no directory listings.
    pub fn lookup(&self, path: &str) -> Option<Arc<CachedFile>> {
        let path = if path.is_empty() || path == "/" {
            INDEX_DOCUMENT
        } else {
            path
        };

        self.entries.load().get(path).cloned()
    }

    /// Returns the number of currently cached files.
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// Determines if the cache is currently empty.
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

/// Creates a file cache based on the system config and registers it on the platform.
///
/// Reads the directory path from `server.public_dir` (default **public**) and performs the
/// initial cache fill. A missing or unreadable directory aborts the installation.
pub async fn install(platform: Arc<Platform>) -> anyhow::Result<Arc<FileCache>> {
    let public_dir = platform
        .require::<Config>()
        .current()
        .config()["server"]["public_dir"]
        .as_str()
        .unwrap_or("public")
        .to_owned();

    let cache = Arc::new(FileCache::new(public_dir));
    cache.refresh().await?;
    platform.register::<FileCache>(cache.clone());

    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_async, SHARED_TEST_RESOURCES};
    use std::time::Duration;

    async fn setup_public_dir(root: &str) {
        let _ = tokio::fs::remove_dir_all(root).await;
        tokio::fs::create_dir_all(format!("{}/assets", root))
            .await
            .unwrap();
        tokio::fs::write(format!("{}/index.html", root), "<html>Hello</html>")
            .await
            .unwrap();
        tokio::fs::write(format!("{}/assets/app.css", root), "body {}")
            .await
            .unwrap();
        tokio::fs::write(format!("{}/.hidden", root), "nope")
            .await
            .unwrap();
    }

    #[test]
    fn cache_serves_files_and_maps_the_index_document() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let root = "target/file-tests/serve";
            setup_public_dir(root).await;

            let cache = FileCache::new(root);
            cache.refresh().await.unwrap();

            // Both the raw path and the root path resolve to the index document...
            let index = cache.lookup("/index.html").unwrap();
            let via_root = cache.lookup("/").unwrap();
            assert_eq!(index.data, via_root.data);
            assert_eq!(index.content_type, "text/html; charset=utf-8");

            // Nested files are keyed by their full request path...
            let css = cache.lookup("/assets/app.css").unwrap();
            assert_eq!(css.content_type, "text/css");
            assert_eq!(css.name, "app.css");

            // Hidden files and unknown paths don't resolve...
            assert_eq!(cache.lookup("/.hidden").is_none(), true);
            assert_eq!(cache.lookup("/missing.txt").is_none(), true);
            assert_eq!(cache.len(), 2);
        });
    }

    #[test]
    fn refresh_only_re_reads_changed_files() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let root = "target/file-tests/refresh";
            setup_public_dir(root).await;

            let cache = FileCache::new(root);
            cache.refresh().await.unwrap();
            let css_before = cache.lookup("/assets/app.css").unwrap();

            // Ensure a visibly different modification timestamp...
            tokio::time::sleep(Duration::from_millis(1100)).await;
            tokio::fs::write(format!("{}/index.html", root), "<html>Changed</html>")
                .await
                .unwrap();
            tokio::fs::remove_file(format!("{}/assets/app.css", root))
                .await
                .unwrap();

            cache.refresh().await.unwrap();

            // The changed file was re-read...
            let index = cache.lookup("/index.html").unwrap();
            assert_eq!(index.data.as_ref(), b"<html>Changed</html>");

            // ...the deleted one dropped out...
            assert_eq!(cache.lookup("/assets/app.css").is_none(), true);

            // ...while the previously cached entry is unaffected by the swap...
            assert_eq!(css_before.data.as_ref(), b"body {}");
        });
    }

    #[test]
    fn failed_refresh_keeps_the_previous_generation() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let root = "target/file-tests/failed-refresh";
            setup_public_dir(root).await;

            let cache = FileCache::new(root);
            cache.refresh().await.unwrap();

            // Remove the directory and try again - the refresh fails but the cache still
            // serves the previous contents...
            tokio::fs::remove_dir_all(root).await.unwrap();
            assert_eq!(cache.refresh().await.is_err(), true);
            assert_eq!(cache.lookup("/index.html").is_some(), true);
        });
    }

    #[test]
    fn refreshing_a_missing_directory_fails() {
        test_async(async {
            let cache = FileCache::new("target/file-tests/no-such-dir");
            assert_eq!(cache.refresh().await.is_err(), true);
        });
    }
}
