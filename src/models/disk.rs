//! Durable artifact storage keyed by model identifier
//!
//! Layout:
//! ```text
//! <artifact_dir>/
//! ├── yolo11n.mlmodelc/      compiled artifact (file or directory)
//! ├── yolo11s.mlmodelc/
//! └── .staging/              transient downloads, archives, extraction dirs
//! ```
//!
//! The presence of `<artifact_dir>/<key>.mlmodelc` is the only signal that a
//! model is installed.

use crate::error::{DepotError, DepotResult};
use std::path::{Path, PathBuf};

/// Extension of compiled, runtime-loadable artifacts
pub const COMPILED_EXTENSION: &str = "mlmodelc";

/// Extensions swept by [`DiskStore::delete_all`]
pub const MODEL_FILE_EXTENSIONS: [&str; 3] = [COMPILED_EXTENSION, "mlmodel", "mlpackage"];

const STAGING_DIR_NAME: &str = ".staging";

/// True if `path` ends in one of [`MODEL_FILE_EXTENSIONS`], ignoring ASCII case
pub fn has_model_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            MODEL_FILE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Outcome of a bulk delete
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Filesystem-backed store of compiled model artifacts
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the artifact and staging directories if missing
    pub fn ensure_dirs(&self) -> DepotResult<()> {
        std::fs::create_dir_all(self.staging_dir()).map_err(|e| {
            DepotError::io(format!("creating {}", self.staging_dir().display()), e)
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch area on the same filesystem as the artifacts, so installs are
    /// plain renames
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    /// Canonical artifact path for a key. Pure, no I/O.
    pub fn resolve_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, COMPILED_EXTENSION))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.resolve_path(key).exists()
    }

    /// Atomically move a compiled artifact into its canonical location
    ///
    /// Never overwrites: callers check [`DiskStore::exists`] first.
    pub fn install(&self, key: &str, source: &Path) -> DepotResult<PathBuf> {
        let destination = self.resolve_path(key);
        if destination.exists() {
            return Err(DepotError::AlreadyInstalled(destination));
        }

        std::fs::create_dir_all(&self.root)
            .map_err(|e| DepotError::io(format!("creating {}", self.root.display()), e))?;

        std::fs::rename(source, &destination).map_err(|e| {
            DepotError::io(
                format!(
                    "moving {} to {}",
                    source.display(),
                    destination.display()
                ),
                e,
            )
        })?;

        tracing::info!(key = %key, path = %destination.display(), "Installed model artifact");
        crate::metrics::record_install(key);

        Ok(destination)
    }

    /// Keys of every installed artifact, sorted
    pub fn list_installed(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut keys: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(COMPILED_EXTENSION) {
                    return None;
                }
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
            })
            .collect();

        keys.sort();
        keys
    }

    /// Remove every entry with a recognized model extension
    ///
    /// Failures are per-entry and do not stop the sweep.
    pub fn delete_all(&self) -> DeleteReport {
        let mut report = DeleteReport::default();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                tracing::warn!(dir = %self.root.display(), error = %e, "Failed to list artifact directory");
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !has_model_extension(&path) {
                continue;
            }

            let result = match entry.file_type() {
                Ok(ft) if ft.is_dir() => std::fs::remove_dir_all(&path),
                _ => std::fs::remove_file(&path),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Deleted model artifact");
                    report.removed.push(path);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete model artifact");
                    report.failed.push(path);
                }
            }
        }

        tracing::info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Deleted installed models"
        );

        report
    }
}
