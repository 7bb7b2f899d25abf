//! Model resolution: memory cache, then disk, then download and install
//!
//! `ModelDepot` is the composition root. Each request walks
//!
//! ```text
//! Idle -> CheckMemoryCache -> CheckDiskCache -> LoadFromDisk ------------> Ready
//!                                            \-> Download -> Install ----> Ready
//!                                                        any failure ----> Failed
//! ```
//!
//! and concurrent requests for the same key share one resolution.

use crate::config::DepotConfig;
use crate::download::{DownloadCoordinator, DownloadFailure, HttpTransport, Transport};
use crate::error::{DepotError, DepotResult};
use crate::metrics::{self, CacheTier};
use crate::models::compiler::{CommandCompiler, ModelCompiler, PassthroughCompiler};
use crate::models::disk::COMPILED_EXTENSION;
use crate::models::{
    ArchiveInstaller, CacheStore, DeleteReport, DiskStore, InstallFailure, ModelEntry,
    ModelHandle, ModelOrigin,
};
use crate::progress::{ProgressEvent, ProgressHub, Subscription};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Terminal failure of a resolve request
#[derive(Debug, Clone)]
pub struct ResolveFailure {
    /// Display name of the requested model
    pub name: String,
    pub key: String,
    pub error: Arc<DepotError>,
}

impl ResolveFailure {
    fn new(entry: &ModelEntry, error: impl Into<Arc<DepotError>>) -> Self {
        Self {
            name: entry.display_name.clone(),
            key: entry.key.clone(),
            error: error.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.error, DepotError::Cancelled)
    }
}

impl fmt::Display for ResolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to load model `{}`: {}", self.name, self.error)
    }
}

impl std::error::Error for ResolveFailure {}

pub type ResolveResult = Result<ModelHandle, ResolveFailure>;

type SharedResolve = Shared<BoxFuture<'static, ResolveResult>>;

/// Step of a single resolve request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    Idle,
    CheckMemoryCache,
    CheckDiskCache,
    LoadFromDisk,
    Download,
    Install,
    Ready,
    Failed,
}

impl fmt::Display for ResolveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::CheckMemoryCache => "check_memory_cache",
            Self::CheckDiskCache => "check_disk_cache",
            Self::LoadFromDisk => "load_from_disk",
            Self::Download => "download",
            Self::Install => "install",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

struct DepotInner {
    cache: Arc<CacheStore>,
    disk: Arc<DiskStore>,
    downloads: DownloadCoordinator,
    installer: ArchiveInstaller,
    progress: ProgressHub,
    in_flight: DashMap<String, SharedResolve>,
}

/// Caches, downloads and installs models on demand
#[derive(Clone)]
pub struct ModelDepot {
    inner: Arc<DepotInner>,
}

impl ModelDepot {
    /// Assemble a depot from its seams
    pub fn new(
        disk: DiskStore,
        cache_capacity: usize,
        transport: Arc<dyn Transport>,
        compiler: Arc<dyn ModelCompiler>,
        max_search_depth: usize,
    ) -> DepotResult<Self> {
        disk.ensure_dirs()?;

        let disk = Arc::new(disk);
        let cache = Arc::new(CacheStore::new(cache_capacity));
        let progress = ProgressHub::new();
        let downloads = DownloadCoordinator::new(
            transport,
            progress.clone(),
            disk.staging_dir().join("downloads"),
        );
        let installer =
            ArchiveInstaller::new(disk.clone(), cache.clone(), compiler, max_search_depth);

        tracing::debug!(
            root = %disk.root().display(),
            cache_capacity = cache.capacity(),
            "Model depot ready"
        );

        Ok(Self {
            inner: Arc::new(DepotInner {
                cache,
                disk,
                downloads,
                installer,
                progress,
                in_flight: DashMap::new(),
            }),
        })
    }

    /// Build the production depot: HTTP transport, configured compiler
    pub fn from_config(config: &DepotConfig) -> DepotResult<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.http)?);
        let compiler: Arc<dyn ModelCompiler> = match &config.compiler {
            Some(compiler) => Arc::new(CommandCompiler::new(compiler)),
            None => Arc::new(PassthroughCompiler::new()),
        };

        Self::new(
            DiskStore::new(&config.artifact_dir),
            config.cache_capacity,
            transport,
            compiler,
            config.max_search_depth,
        )
    }

    /// Resolve `entry` to a loaded model handle
    ///
    /// Keys are case-insensitive: the cache, the disk store and the download
    /// coordinator all see the lowercase form. Requests for a key that is
    /// already resolving join that resolution instead of starting another
    /// download.
    pub async fn resolve(&self, entry: &ModelEntry) -> ResolveResult {
        let entry = &ModelEntry {
            key: normalize_key(&entry.key),
            ..entry.clone()
        };

        if let Some(handle) = self.inner.cache.get(&entry.key) {
            tracing::debug!(key = %entry.key, "Memory cache hit");
            metrics::record_resolved(CacheTier::Memory);
            return Ok(handle);
        }

        let coalesce_key = entry.key.clone();
        let shared = match self.inner.in_flight.entry(coalesce_key.clone()) {
            Entry::Occupied(occupied) => {
                tracing::debug!(key = %entry.key, "Joining in-flight resolution");
                occupied.get().clone()
            }
            Entry::Vacant(vacant) => {
                let inner = self.inner.clone();
                let owned = entry.clone();
                let task = tokio::spawn(async move {
                    let result = inner.resolve_uncoalesced(&owned).await;
                    inner.in_flight.remove(&coalesce_key);
                    result
                });

                let fallback = entry.clone();
                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(ResolveFailure::new(
                            &fallback,
                            DepotError::Io {
                                context: "resolving model".to_string(),
                                source: std::io::Error::other(e.to_string()),
                            },
                        ))
                    })
                }
                .boxed()
                .shared();
                vacant.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    /// True if a compiled artifact for `key` exists on disk
    pub fn is_installed(&self, key: &str) -> bool {
        self.inner.disk.exists(&normalize_key(key))
    }

    /// Path of the installed artifact for `key`, if there is one
    pub fn installed_path(&self, key: &str) -> Option<PathBuf> {
        let key = normalize_key(key);
        self.inner
            .disk
            .exists(&key)
            .then(|| self.inner.disk.resolve_path(&key))
    }

    /// Deliver progress events to `callback` on a dedicated task
    pub fn subscribe_progress<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        self.inner.progress.subscribe(callback)
    }

    pub fn progress_receiver(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.receiver()
    }

    /// Remove every installed artifact and drop every cached handle
    pub fn delete_all_installed(&self) -> DeleteReport {
        self.inner.cache.clear();
        metrics::update_cached_models(0);
        self.inner.disk.delete_all()
    }

    /// Move the download matching `key_fragment` to the front
    pub fn prioritize(&self, key_fragment: &str) -> bool {
        self.inner.downloads.prioritize(&normalize_key(key_fragment))
    }

    /// Cancel the prioritized download, if any
    pub fn cancel_current_priority(&self) -> bool {
        self.inner.downloads.cancel_current_priority()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn disk(&self) -> &DiskStore {
        &self.inner.disk
    }

    pub fn downloads(&self) -> &DownloadCoordinator {
        &self.inner.downloads
    }
}

impl DepotInner {
    async fn resolve_uncoalesced(&self, entry: &ModelEntry) -> ResolveResult {
        let key = entry.key.as_str();
        let mut state = ResolveState::Idle;
        transition(key, &mut state, ResolveState::CheckMemoryCache);

        // Another resolution may have finished between the caller's check and now
        if let Some(handle) = self.cache.get(key) {
            transition(key, &mut state, ResolveState::Ready);
            metrics::record_resolved(CacheTier::Memory);
            return Ok(handle);
        }

        transition(key, &mut state, ResolveState::CheckDiskCache);
        let result = if self.disk.exists(key) {
            transition(key, &mut state, ResolveState::LoadFromDisk);
            Ok((self.load(key, &self.disk.resolve_path(key)), CacheTier::Disk))
        } else {
            match &entry.origin {
                ModelOrigin::Bundled { path } => self
                    .load_bundled(key, path, &mut state)
                    .await
                    .map(|handle| (handle, CacheTier::Bundled)),
                ModelOrigin::Remote { url } => self
                    .download_and_install(key, url, &mut state)
                    .await
                    .map(|handle| (handle, CacheTier::Network)),
            }
        };

        match result {
            Ok((handle, tier)) => {
                transition(key, &mut state, ResolveState::Ready);
                metrics::record_resolved(tier);
                metrics::update_cached_models(self.cache.len());
                Ok(handle)
            }
            Err(error) => {
                transition(key, &mut state, ResolveState::Failed);
                tracing::error!(key = %key, error = %error, "Failed to resolve model");
                metrics::record_resolve_failure(key);
                Err(ResolveFailure::new(entry, error))
            }
        }
    }

    fn load(&self, key: &str, artifact: &Path) -> ModelHandle {
        let handle = ModelHandle::new(key, artifact);
        self.cache.put(key, handle.clone());
        handle
    }

    async fn load_bundled(
        &self,
        key: &str,
        path: &Path,
        state: &mut ResolveState,
    ) -> Result<ModelHandle, Arc<DepotError>> {
        if !path.exists() {
            return Err(Arc::new(DepotError::NotFound(format!(
                "bundled model at {}",
                path.display()
            ))));
        }

        let compiled = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(COMPILED_EXTENSION));
        if compiled {
            transition(key, state, ResolveState::LoadFromDisk);
            return Ok(self.load(key, path));
        }

        transition(key, state, ResolveState::Install);
        self.installer
            .install_payload(key, path)
            .await
            .map_err(|InstallFailure { error, .. }| Arc::new(error))
    }

    async fn download_and_install(
        &self,
        key: &str,
        url: &str,
        state: &mut ResolveState,
    ) -> Result<ModelHandle, Arc<DepotError>> {
        transition(key, state, ResolveState::Download);
        let downloaded = self
            .downloads
            .start(url, &format!("{}.zip", key), key)
            .wait()
            .await
            .map_err(|DownloadFailure { error, .. }| error)?;

        transition(key, state, ResolveState::Install);
        self.installer
            .install(key, &downloaded)
            .await
            .map_err(|InstallFailure { error, .. }| Arc::new(error))
    }
}

/// Canonical form of a model key
pub fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

fn transition(key: &str, state: &mut ResolveState, next: ResolveState) {
    tracing::debug!(key = %key, from = %state, to = %next, "Resolve state transition");
    *state = next;
}
