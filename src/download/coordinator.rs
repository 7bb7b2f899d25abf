//! One logical network task per model key, with priority promotion
//!
//! Every task has an id. Transport callbacks (progress and completion) carry
//! that id, so events from a task that has since been replaced are recognized
//! as stale and dropped instead of being applied to its successor.
//!
//! Promotion is a small state machine:
//!
//! ```text
//! Active ──prioritize──> Cancelling(Promote) ──resume data──> Resumed  (new task)
//!                                             └─no data─────> Restarted (new task)
//! Active | Cancelling(Promote) ──cancel_current_priority──> Cancelling(Discard) ──> Cancelled
//! ```
//!
//! A task becomes the priority as soon as `prioritize` marks it, so a cancel
//! that arrives before the replacement starts still reaches it.
//!
//! The replacement task inherits the waiters, so callers awaiting a
//! [`DownloadTicket`] never notice the swap.

use super::transport::{CancelSignal, FetchOutcome, FetchRequest, ProgressFn, Transport};
use crate::error::DepotError;
use crate::progress::{ProgressEvent, ProgressHub, fraction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Identity of a single network transfer
pub type TaskId = u64;

/// Download failure, always tagged with the originating key
#[derive(Debug, Clone)]
pub struct DownloadFailure {
    pub key: String,
    pub error: Arc<DepotError>,
}

impl DownloadFailure {
    fn new(key: &str, error: DepotError) -> Self {
        Self {
            key: key.to_string(),
            error: Arc::new(error),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.error, DepotError::Cancelled)
    }
}

impl std::fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "download of '{}' failed: {}", self.key, self.error)
    }
}

impl std::error::Error for DownloadFailure {}

pub type DownloadResult = Result<PathBuf, DownloadFailure>;

/// Why a task is being cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelIntent {
    /// Replace with a resumed or restarted task
    Promote,
    /// Tear down, no replacement
    Discard,
}

/// Lifecycle phase of a live task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Active,
    Cancelling(CancelIntent),
}

/// How a task came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    Fresh,
    /// Replacement continuing from resume data
    Resumed,
    /// Replacement starting over because no resume data was available
    Restarted,
}

impl TaskOrigin {
    fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Resumed => "resumed",
            Self::Restarted => "restarted",
        }
    }
}

/// Point-in-time view of a task, for callers and tests
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub key: String,
    pub url: String,
    pub destination: PathBuf,
    pub phase: TaskPhase,
    pub origin: TaskOrigin,
    pub bytes_written: u64,
    pub total_expected: Option<u64>,
    pub is_priority: bool,
}

struct TaskRecord {
    key: String,
    url: String,
    destination: PathBuf,
    phase: TaskPhase,
    origin: TaskOrigin,
    cancel: CancelSignal,
    waiters: Vec<oneshot::Sender<DownloadResult>>,
    bytes_written: u64,
    total_expected: Option<u64>,
}

#[derive(Default)]
struct CoordinatorState {
    tasks: HashMap<TaskId, TaskRecord>,
    by_key: HashMap<String, TaskId>,
    priority: Option<TaskId>,
    next_id: TaskId,
}

impl CoordinatorState {
    fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        self.next_id
    }

    fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        let record = self.tasks.get(&id)?;
        Some(TaskSnapshot {
            id,
            key: record.key.clone(),
            url: record.url.clone(),
            destination: record.destination.clone(),
            phase: record.phase,
            origin: record.origin,
            bytes_written: record.bytes_written,
            total_expected: record.total_expected,
            is_priority: self.priority == Some(id),
        })
    }

    fn forget(&mut self, id: TaskId, key: &str) {
        if self.by_key.get(key) == Some(&id) {
            self.by_key.remove(key);
        }
        if self.priority == Some(id) {
            self.priority = None;
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    progress: ProgressHub,
    download_dir: PathBuf,
    state: Mutex<CoordinatorState>,
}

/// Awaitable result of a download
#[derive(Debug)]
pub struct DownloadTicket {
    key: String,
    rx: oneshot::Receiver<DownloadResult>,
}

impl DownloadTicket {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> DownloadResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DownloadFailure::new(
                &self.key,
                DepotError::Network("download task dropped".to_string()),
            )),
        }
    }
}

/// Manages concurrent downloads keyed by model identifier
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        progress: ProgressHub,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                progress,
                download_dir: download_dir.into(),
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    /// Begin downloading `url` to `<download_dir>/<destination_file_name>`
    ///
    /// If `key` already has a live task, the returned ticket joins it instead
    /// of issuing a second request. Must be called within a Tokio runtime.
    pub fn start(&self, url: &str, destination_file_name: &str, key: &str) -> DownloadTicket {
        let (tx, rx) = oneshot::channel();
        let ticket = DownloadTicket {
            key: key.to_string(),
            rx,
        };

        let mut state = self.inner.state.lock();

        if let Some(existing) = state.by_key.get(key).copied()
            && let Some(record) = state.tasks.get_mut(&existing)
        {
            tracing::debug!(key = %key, task_id = existing, "Joining in-flight download");
            record.waiters.push(tx);
            return ticket;
        }

        let id = state.allocate_id();
        let destination = self.inner.download_dir.join(destination_file_name);
        let cancel = CancelSignal::new();

        state.tasks.insert(
            id,
            TaskRecord {
                key: key.to_string(),
                url: url.to_string(),
                destination: destination.clone(),
                phase: TaskPhase::Active,
                origin: TaskOrigin::Fresh,
                cancel: cancel.clone(),
                waiters: vec![tx],
                bytes_written: 0,
                total_expected: None,
            },
        );
        state.by_key.insert(key.to_string(), id);
        crate::metrics::update_active_downloads(state.by_key.len());
        drop(state);

        tracing::info!(key = %key, url = %url, task_id = id, "Starting download");
        crate::metrics::record_download_started(key, TaskOrigin::Fresh.as_str());
        self.inner.progress.publish(ProgressEvent::new(key, 0.0));

        let request = FetchRequest {
            url: url.to_string(),
            destination,
            resume: None,
        };
        Inner::spawn_task(&self.inner, id, request, cancel);

        ticket
    }

    /// Promote the in-flight task whose destination file name contains
    /// `key_fragment`
    ///
    /// The task is cancelled with a request for resume data and replaced once
    /// the transport acknowledges. Returns `false` when nothing matches.
    pub fn prioritize(&self, key_fragment: &str) -> bool {
        let mut state = self.inner.state.lock();

        let mut candidates: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, record)| {
                matches!(
                    record.phase,
                    TaskPhase::Active | TaskPhase::Cancelling(CancelIntent::Promote)
                ) && record
                        .destination
                        .file_name()
                        .map(|n| n.to_string_lossy().contains(key_fragment))
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        candidates.sort_unstable();

        let Some(id) = candidates.first().copied() else {
            tracing::debug!(fragment = %key_fragment, "No in-flight download to prioritize");
            return false;
        };

        if state.priority == Some(id) {
            return true;
        }
        state.priority = Some(id);

        if let Some(record) = state.tasks.get_mut(&id)
            && record.phase == TaskPhase::Active
        {
            record.phase = TaskPhase::Cancelling(CancelIntent::Promote);
            record.cancel.cancel_with_resume();
            tracing::info!(key = %record.key, task_id = id, "Prioritizing download");
        }

        true
    }

    /// Best-effort cancel of the promoted task, discarding partial data
    ///
    /// Also applies while a promotion is still waiting for the transport to
    /// stop: no replacement is started.
    pub fn cancel_current_priority(&self) -> bool {
        let mut state = self.inner.state.lock();
        let Some(id) = state.priority else {
            return false;
        };

        match state.tasks.get_mut(&id) {
            Some(record) => {
                record.phase = TaskPhase::Cancelling(CancelIntent::Discard);
                record.cancel.cancel();
                tracing::info!(key = %record.key, task_id = id, "Cancelling priority download");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.inner.state.lock().by_key.contains_key(key)
    }

    /// Keys with a live task, sorted
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.state.lock().by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn priority_key(&self) -> Option<String> {
        let state = self.inner.state.lock();
        let id = state.priority?;
        state.tasks.get(&id).map(|r| r.key.clone())
    }

    pub fn snapshot(&self, key: &str) -> Option<TaskSnapshot> {
        let state = self.inner.state.lock();
        let id = *state.by_key.get(key)?;
        state.snapshot(id)
    }
}

impl Inner {
    fn spawn_task(inner: &Arc<Inner>, id: TaskId, request: FetchRequest, cancel: CancelSignal) {
        let progress: ProgressFn = {
            let inner = inner.clone();
            Arc::new(move |written, total| inner.on_progress(id, written, total))
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let result = inner
                .transport
                .fetch(request, progress, cancel)
                .await;
            Inner::on_finished(&inner, id, result);
        });
    }

    fn on_progress(&self, id: TaskId, written: u64, total: Option<u64>) {
        let key = {
            let mut state = self.state.lock();
            let Some(record) = state.tasks.get_mut(&id) else {
                return;
            };
            record.bytes_written = written;
            record.total_expected = total;
            record.key.clone()
        };

        if let Some(f) = fraction(written, total) {
            self.progress.publish(ProgressEvent::new(key, f));
        }
    }

    fn on_finished(inner: &Arc<Inner>, id: TaskId, result: Result<FetchOutcome, DepotError>) {
        let mut state = inner.state.lock();
        let Some(record) = state.tasks.remove(&id) else {
            tracing::debug!(task_id = id, "Ignoring completion of unknown task");
            return;
        };

        match result {
            Ok(FetchOutcome::Completed { path, bytes }) => {
                state.forget(id, &record.key);
                crate::metrics::update_active_downloads(state.by_key.len());
                drop(state);

                tracing::info!(key = %record.key, task_id = id, bytes, "Download complete");
                crate::metrics::record_download_finished(&record.key, "completed");
                inner.progress.publish(ProgressEvent::new(&record.key, 1.0));
                for waiter in record.waiters {
                    let _ = waiter.send(Ok(path.clone()));
                }
            }
            Ok(FetchOutcome::Cancelled { resume })
                if record.phase == TaskPhase::Cancelling(CancelIntent::Promote) =>
            {
                let new_id = state.allocate_id();
                let origin = if resume.is_some() {
                    TaskOrigin::Resumed
                } else {
                    TaskOrigin::Restarted
                };
                let cancel = CancelSignal::new();
                let (bytes_written, total_expected) = match &resume {
                    Some(r) => (r.offset(), r.total().or(record.total_expected)),
                    None => (0, None),
                };

                let request = FetchRequest {
                    url: record.url.clone(),
                    destination: record.destination.clone(),
                    resume,
                };

                state.by_key.insert(record.key.clone(), new_id);
                // A later prioritize may have moved the priority elsewhere
                if state.priority == Some(id) {
                    state.priority = Some(new_id);
                }
                state.tasks.insert(
                    new_id,
                    TaskRecord {
                        key: record.key.clone(),
                        url: record.url,
                        destination: record.destination,
                        phase: TaskPhase::Active,
                        origin,
                        cancel: cancel.clone(),
                        waiters: record.waiters,
                        bytes_written,
                        total_expected,
                    },
                );
                drop(state);

                tracing::info!(
                    key = %record.key,
                    old_task_id = id,
                    task_id = new_id,
                    origin = origin.as_str(),
                    offset = bytes_written,
                    "Replaced download with priority task"
                );
                crate::metrics::record_download_started(&record.key, origin.as_str());
                if origin == TaskOrigin::Restarted {
                    inner.progress.publish(ProgressEvent::new(&record.key, 0.0));
                }

                Inner::spawn_task(inner, new_id, request, cancel);
            }
            Ok(FetchOutcome::Cancelled { resume }) => {
                state.forget(id, &record.key);
                crate::metrics::update_active_downloads(state.by_key.len());
                drop(state);

                if let Some(resume) = resume {
                    // Discarding: the partial bytes are not coming back
                    let _ = std::fs::remove_file(resume.partial_path());
                }

                tracing::info!(key = %record.key, task_id = id, "Download cancelled");
                crate::metrics::record_download_finished(&record.key, "cancelled");
                for waiter in record.waiters {
                    let _ = waiter.send(Err(DownloadFailure::new(&record.key, DepotError::Cancelled)));
                }
            }
            Err(error) => {
                state.forget(id, &record.key);
                crate::metrics::update_active_downloads(state.by_key.len());
                drop(state);

                tracing::warn!(key = %record.key, task_id = id, error = %error, "Download failed");
                crate::metrics::record_download_finished(&record.key, "failed");
                let failure = DownloadFailure::new(&record.key, error);
                for waiter in record.waiters {
                    let _ = waiter.send(Err(failure.clone()));
                }
            }
        }
    }
}
