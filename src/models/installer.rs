//! Archive extract → compile → install pipeline
//!
//! Steps run strictly in order and stop at the first failure:
//!
//! 1. move the downloaded bytes to a stable archive path
//! 2. extract into a fresh temp directory, skipping foreign OS metadata
//! 3. locate the payload (breadth-first, shallowest match wins)
//! 4. compile the payload
//! 5. register the handle in memory, then move the artifact into the disk store
//! 6. clean up the temp directory and archive, whatever happened above

use super::cache::{CacheStore, ModelHandle};
use super::compiler::ModelCompiler;
use super::disk::DiskStore;
use crate::error::{DepotError, DepotResult};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zip::read::ZipArchive;

/// Extensions recognized as uncompiled model payloads
pub const PAYLOAD_EXTENSIONS: [&str; 2] = ["mlpackage", "mlmodel"];

/// Archive directory written by macOS Finder alongside real content
const FOREIGN_METADATA_DIR: &str = "__MACOSX";

/// Default bound on payload search depth
pub const DEFAULT_MAX_SEARCH_DEPTH: usize = 16;

/// Installer failure, tagged with the originating key
#[derive(Debug)]
pub struct InstallFailure {
    pub key: String,
    pub error: DepotError,
}

impl std::fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "install of '{}' failed: {}", self.key, self.error)
    }
}

impl std::error::Error for InstallFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Counts from one extraction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractStats {
    pub extracted: usize,
    pub skipped: usize,
}

/// True for AppleDouble files, Finder metadata and anything under `__MACOSX/`
pub fn is_foreign_metadata(relative: &Path) -> bool {
    if let Some(Component::Normal(first)) = relative.components().next()
        && first == FOREIGN_METADATA_DIR
    {
        return true;
    }

    relative
        .file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name.starts_with("._") || name == ".DS_Store"
        })
        .unwrap_or(false)
}

fn has_payload_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            PAYLOAD_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Extract a zip archive under `destination`
///
/// Entries that would escape `destination` are skipped along with foreign
/// metadata.
pub fn extract_archive(archive: &Path, destination: &Path) -> DepotResult<ExtractStats> {
    let file = File::open(archive)
        .map_err(|e| DepotError::io(format!("opening {}", archive.display()), e))?;
    let mut zip = ZipArchive::new(file)?;
    let mut stats = ExtractStats::default();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;

        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(entry = %entry.name(), "Skipping archive entry with unsafe path");
            stats.skipped += 1;
            continue;
        };

        if is_foreign_metadata(&relative) {
            tracing::trace!(entry = %relative.display(), "Skipping metadata entry");
            stats.skipped += 1;
            continue;
        }

        let target = destination.join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| DepotError::io(format!("creating {}", target.display()), e))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DepotError::io(format!("creating {}", parent.display()), e))?;
            }
            let mut out = File::create(&target)
                .map_err(|e| DepotError::io(format!("creating {}", target.display()), e))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| DepotError::io(format!("writing {}", target.display()), e))?;
        }
        stats.extracted += 1;
    }

    Ok(stats)
}

/// Breadth-first search for the shallowest payload under `root`
///
/// Each directory's own entries (sorted by name) are checked before any of
/// its subdirectories. Symlinks are never followed and each directory is
/// visited at most once.
pub fn find_payload(root: &Path, max_depth: usize) -> Option<PathBuf> {
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    let mut visited = HashSet::new();

    while let Some((dir, depth)) = queue.pop_front() {
        let identity = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        if !visited.insert(identity) {
            continue;
        }

        let Ok(read) = std::fs::read_dir(&dir) else {
            continue;
        };

        let mut entries: Vec<(PathBuf, std::fs::FileType)> = read
            .flatten()
            .filter_map(|e| e.file_type().ok().map(|ft| (e.path(), ft)))
            .filter(|(path, ft)| {
                !ft.is_symlink()
                    && path
                        .strip_prefix(root)
                        .map(|rel| !is_foreign_metadata(rel))
                        .unwrap_or(true)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some((path, _)) = entries.iter().find(|(path, _)| has_payload_extension(path)) {
            return Some(path.clone());
        }

        if depth < max_depth {
            queue.extend(
                entries
                    .into_iter()
                    .filter(|(_, ft)| ft.is_dir())
                    .map(|(path, _)| (path, depth + 1)),
            );
        }
    }

    None
}

/// Runs the extract-compile-install pipeline
pub struct ArchiveInstaller {
    disk: Arc<DiskStore>,
    cache: Arc<CacheStore>,
    compiler: Arc<dyn ModelCompiler>,
    max_search_depth: usize,
}

impl ArchiveInstaller {
    pub fn new(
        disk: Arc<DiskStore>,
        cache: Arc<CacheStore>,
        compiler: Arc<dyn ModelCompiler>,
        max_search_depth: usize,
    ) -> Self {
        Self {
            disk,
            cache,
            compiler,
            max_search_depth,
        }
    }

    /// Stable location a downloaded archive is moved to before extraction
    pub fn archive_path(&self, key: &str) -> PathBuf {
        self.disk
            .staging_dir()
            .join("archives")
            .join(format!("{}.zip", key))
    }

    /// Install a downloaded archive for `key`
    pub async fn install(
        &self,
        key: &str,
        downloaded: &Path,
    ) -> Result<ModelHandle, InstallFailure> {
        let archive = self.archive_path(key);
        let mut workdir = None;

        let result = self
            .install_archive(key, downloaded, &archive, &mut workdir)
            .await;

        cleanup(workdir, Some(&archive));
        result.map_err(|error| {
            tracing::warn!(key = %key, error = %error, "Install failed");
            InstallFailure {
                key: key.to_string(),
                error,
            }
        })
    }

    /// Compile and install a payload that needs no extraction
    pub async fn install_payload(
        &self,
        key: &str,
        payload: &Path,
    ) -> Result<ModelHandle, InstallFailure> {
        let mut workdir = None;
        let result = async {
            let dir = workdir.insert(self.fresh_workdir()?);
            self.compile_and_register(key, payload, dir.path()).await
        }
        .await;

        cleanup(workdir, None);
        result.map_err(|error| InstallFailure {
            key: key.to_string(),
            error,
        })
    }

    async fn install_archive(
        &self,
        key: &str,
        downloaded: &Path,
        archive: &Path,
        workdir: &mut Option<TempDir>,
    ) -> DepotResult<ModelHandle> {
        stage_archive(downloaded, archive)?;
        tracing::debug!(key = %key, archive = %archive.display(), "Archive staged");

        let dir = workdir.insert(self.fresh_workdir()?);
        let extract_root = dir.path().join("extracted");

        let archive_owned = archive.to_path_buf();
        let root = extract_root.clone();
        let max_depth = self.max_search_depth;
        let (stats, payload) = tokio::task::spawn_blocking(move || {
            let stats = extract_archive(&archive_owned, &root)?;
            Ok::<_, DepotError>((stats, find_payload(&root, max_depth)))
        })
        .await
        .map_err(|e| DepotError::Archive(format!("Extraction task panicked: {}", e)))??;

        tracing::debug!(
            key = %key,
            extracted = stats.extracted,
            skipped = stats.skipped,
            "Archive extracted"
        );

        let payload = payload.ok_or_else(|| {
            DepotError::NotFound(format!("no payload found in archive for '{}'", key))
        })?;
        tracing::info!(key = %key, payload = %payload.display(), "Found model payload");

        self.compile_and_register(key, &payload, dir.path()).await
    }

    async fn compile_and_register(
        &self,
        key: &str,
        payload: &Path,
        workdir: &Path,
    ) -> DepotResult<ModelHandle> {
        let artifact = self
            .compiler
            .compile(payload, &workdir.join("compiled"))
            .await?;
        tracing::info!(key = %key, artifact = %artifact.display(), "Compiled model");

        let handle = ModelHandle::new(key, self.disk.resolve_path(key));
        self.cache.put(key, handle.clone());

        match self.disk.install(key, &artifact) {
            Ok(_) => Ok(handle),
            Err(DepotError::AlreadyInstalled(path)) => {
                // Someone else finished first; their artifact is at the same path
                tracing::warn!(key = %key, path = %path.display(), "Artifact already installed, keeping existing");
                Ok(handle)
            }
            Err(e) => {
                self.cache.remove(key);
                Err(e)
            }
        }
    }

    fn fresh_workdir(&self) -> DepotResult<TempDir> {
        let staging = self.disk.staging_dir();
        std::fs::create_dir_all(&staging)
            .map_err(|e| DepotError::io(format!("creating {}", staging.display()), e))?;
        tempfile::Builder::new()
            .prefix("install-")
            .tempdir_in(&staging)
            .map_err(|e| DepotError::io("creating extraction directory", e))
    }
}

/// Move the downloaded file to its stable archive path, replacing any
/// leftover from an earlier attempt
fn stage_archive(downloaded: &Path, archive: &Path) -> DepotResult<()> {
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DepotError::io(format!("creating {}", parent.display()), e))?;
    }
    if archive.exists() {
        std::fs::remove_file(archive)
            .map_err(|e| DepotError::io(format!("replacing {}", archive.display()), e))?;
    }
    std::fs::rename(downloaded, archive).map_err(|e| {
        DepotError::io(
            format!("moving {} to {}", downloaded.display(), archive.display()),
            e,
        )
    })
}

fn cleanup(workdir: Option<TempDir>, archive: Option<&Path>) {
    if let Some(dir) = workdir {
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            tracing::warn!(dir = %path.display(), error = %e, "Failed to remove extraction directory");
        }
    }

    if let Some(archive) = archive
        && let Err(e) = std::fs::remove_file(archive)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(archive = %archive.display(), error = %e, "Failed to remove archive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::compiler::PassthroughCompiler;
    use async_trait::async_trait;
    use std::io::Write;
    use zip::write::FileOptions;

    /// Names ending in `/` become directory entries
    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    struct RejectingCompiler;

    #[async_trait]
    impl ModelCompiler for RejectingCompiler {
        async fn compile(&self, _payload: &Path, _output_dir: &Path) -> DepotResult<PathBuf> {
            Err(DepotError::Compile("unsupported layer".to_string()))
        }
    }

    fn installer(root: &Path, compiler: Arc<dyn ModelCompiler>) -> (ArchiveInstaller, Arc<DiskStore>, Arc<CacheStore>) {
        let disk = Arc::new(DiskStore::new(root));
        disk.ensure_dirs().unwrap();
        let cache = Arc::new(CacheStore::default());
        let installer = ArchiveInstaller::new(disk.clone(), cache.clone(), compiler, DEFAULT_MAX_SEARCH_DEPTH);
        (installer, disk, cache)
    }

    fn staging_contents(disk: &DiskStore) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![disk.staging_dir()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap().flatten() {
                if entry.file_type().unwrap().is_dir() {
                    stack.push(entry.path());
                } else {
                    out.push(entry.path());
                }
            }
        }
        out
    }

    #[test]
    fn test_foreign_metadata_detection() {
        assert!(is_foreign_metadata(Path::new("__MACOSX/._a")));
        assert!(is_foreign_metadata(Path::new("__MACOSX/model.mlpackage/x")));
        assert!(is_foreign_metadata(Path::new("nested/._model.mlmodel")));
        assert!(is_foreign_metadata(Path::new(".DS_Store")));
        assert!(!is_foreign_metadata(Path::new("model.mlpackage/data.bin")));
        assert!(!is_foreign_metadata(Path::new("nested/__MACOSX_notes.txt")));
    }

    #[test]
    fn test_extract_skips_metadata_and_recreates_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("a.zip");
        write_zip(
            &archive,
            &[
                ("__MACOSX/._a", "junk"),
                ("model.mlpackage/data.bin", "data"),
                ("nested/model.mlmodel", "raw"),
                ("empty/", ""),
            ],
        );

        let out = temp.path().join("out");
        let stats = extract_archive(&archive, &out).unwrap();
        assert_eq!(stats, ExtractStats { extracted: 3, skipped: 1 });
        assert!(out.join("model.mlpackage/data.bin").exists());
        assert!(out.join("nested/model.mlmodel").exists());
        assert!(out.join("empty").is_dir());
        assert!(!out.join("__MACOSX").exists());
    }

    #[test]
    fn test_extract_rejects_corrupt_archive() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("bad.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();
        let err = extract_archive(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, DepotError::Archive(_)));
    }

    #[test]
    fn test_find_payload_prefers_shallow_match() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("a.zip");
        write_zip(
            &archive,
            &[
                ("__MACOSX/._a", "junk"),
                ("model.mlpackage/data.bin", "data"),
                ("nested/model.mlmodel", "raw"),
            ],
        );
        let out = temp.path().join("out");
        extract_archive(&archive, &out).unwrap();

        let payload = find_payload(&out, DEFAULT_MAX_SEARCH_DEPTH).unwrap();
        assert_eq!(payload, out.join("model.mlpackage"));
    }

    #[test]
    fn test_find_payload_matches_extension_case_insensitively() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("Model.MLPACKAGE")).unwrap();
        std::fs::write(root.join("Model.MLPACKAGE/Manifest.json"), b"{}").unwrap();

        assert_eq!(
            find_payload(root, DEFAULT_MAX_SEARCH_DEPTH),
            Some(root.join("Model.MLPACKAGE"))
        );
    }

    #[test]
    fn test_find_payload_checks_level_before_descending() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("a/deep")).unwrap();
        std::fs::write(root.join("a/deep/first.mlmodel"), b"x").unwrap();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::write(root.join("b/second.mlmodel"), b"x").unwrap();

        // "a" sorts first but its payload is one level deeper
        assert_eq!(
            find_payload(root, DEFAULT_MAX_SEARCH_DEPTH),
            Some(root.join("b/second.mlmodel"))
        );
    }

    #[test]
    fn test_find_payload_ignores_metadata_tree() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("__MACOSX")).unwrap();
        std::fs::write(root.join("__MACOSX/._model.mlmodel"), b"x").unwrap();
        std::fs::write(root.join("._model.mlmodel"), b"x").unwrap();

        assert_eq!(find_payload(root, DEFAULT_MAX_SEARCH_DEPTH), None);
    }

    #[test]
    fn test_find_payload_respects_depth_bound() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("1/2/3")).unwrap();
        std::fs::write(root.join("1/2/3/model.mlmodel"), b"x").unwrap();

        assert_eq!(find_payload(root, 2), None);
        assert_eq!(find_payload(root, 3), Some(root.join("1/2/3/model.mlmodel")));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_payload_does_not_follow_symlink_cycles() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("loop")).unwrap();
        std::os::unix::fs::symlink(root, root.join("loop/back")).unwrap();

        assert_eq!(find_payload(root, DEFAULT_MAX_SEARCH_DEPTH), None);
    }

    #[tokio::test]
    async fn test_install_happy_path() {
        let temp = tempfile::tempdir().unwrap();
        let (installer, disk, cache) = installer(&temp.path().join("models"), Arc::new(PassthroughCompiler));

        let downloaded = temp.path().join("yolo11n.zip");
        write_zip(
            &downloaded,
            &[
                ("__MACOSX/._yolo11n.mlpackage", "junk"),
                ("yolo11n.mlpackage/Manifest.json", "{}"),
                ("yolo11n.mlpackage/Data/weight.bin", "w"),
            ],
        );

        let handle = installer.install("yolo11n", &downloaded).await.unwrap();
        assert_eq!(handle.key(), "yolo11n");
        assert_eq!(handle.artifact_path(), disk.resolve_path("yolo11n"));
        assert!(disk.exists("yolo11n"));
        assert!(disk.resolve_path("yolo11n").join("Manifest.json").exists());
        assert!(cache.contains("yolo11n"));

        // Downloaded file moved away, archive and temp dirs cleaned
        assert!(!downloaded.exists());
        assert!(!installer.archive_path("yolo11n").exists());
        assert!(staging_contents(&disk).is_empty());
    }

    #[tokio::test]
    async fn test_install_without_payload_fails_and_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let (installer, disk, cache) = installer(temp.path(), Arc::new(PassthroughCompiler));

        let downloaded = temp.path().join("dl.zip");
        write_zip(&downloaded, &[("readme.txt", "hi")]);

        let failure = installer.install("yolo11n", &downloaded).await.unwrap_err();
        assert_eq!(failure.key, "yolo11n");
        assert!(matches!(failure.error, DepotError::NotFound(_)));
        assert!(!disk.exists("yolo11n"));
        assert!(!cache.contains("yolo11n"));
        assert!(staging_contents(&disk).is_empty());
    }

    #[tokio::test]
    async fn test_install_compile_failure_propagates() {
        let temp = tempfile::tempdir().unwrap();
        let (installer, disk, cache) = installer(temp.path(), Arc::new(RejectingCompiler));

        let downloaded = temp.path().join("dl.zip");
        write_zip(&downloaded, &[("model.mlmodel", "raw")]);

        let failure = installer.install("yolo11n", &downloaded).await.unwrap_err();
        assert!(matches!(failure.error, DepotError::Compile(_)));
        assert!(failure.to_string().contains("unsupported layer"));
        assert!(!disk.exists("yolo11n"));
        assert!(!cache.contains("yolo11n"));
        assert!(staging_contents(&disk).is_empty());
    }

    #[tokio::test]
    async fn test_install_missing_download_is_io_failure() {
        let temp = tempfile::tempdir().unwrap();
        let (installer, _disk, _cache) = installer(temp.path(), Arc::new(PassthroughCompiler));

        let failure = installer
            .install("yolo11n", &temp.path().join("never-downloaded.zip"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, DepotError::Io { .. }));
    }

    #[tokio::test]
    async fn test_install_overwrites_stale_archive() {
        let temp = tempfile::tempdir().unwrap();
        let (installer, disk, _cache) = installer(temp.path(), Arc::new(PassthroughCompiler));

        let stale = installer.archive_path("yolo11n");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"stale bytes").unwrap();

        let downloaded = temp.path().join("dl.zip");
        write_zip(&downloaded, &[("yolo11n.mlmodel", "raw")]);

        installer.install("yolo11n", &downloaded).await.unwrap();
        assert!(disk.exists("yolo11n"));
    }

    #[tokio::test]
    async fn test_install_payload_for_bundled_model() {
        let temp = tempfile::tempdir().unwrap();
        let (installer, disk, cache) = installer(&temp.path().join("models"), Arc::new(PassthroughCompiler));

        let payload = temp.path().join("bundle/yolo11n.mlmodel");
        std::fs::create_dir_all(payload.parent().unwrap()).unwrap();
        std::fs::write(&payload, b"raw").unwrap();

        let handle = installer.install_payload("yolo11n", &payload).await.unwrap();
        assert!(disk.exists("yolo11n"));
        assert!(cache.get("yolo11n").unwrap().same_instance(&handle));
        // Bundled payload is read-only input
        assert!(payload.exists());
        assert!(staging_contents(&disk).is_empty());
    }
}
