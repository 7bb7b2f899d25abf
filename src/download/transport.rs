//! Streaming download-to-file transport
//!
//! A transport writes the response body to `<destination>.part`, reports
//! `(bytes_written, total_expected)` as it goes, and renames the part file
//! into place once the body is complete. When cancelled it can hand back
//! [`ResumeData`] so a replacement request continues from the received offset
//! instead of byte zero.

use crate::config::HttpConfig;
use crate::error::{DepotError, DepotResult};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Shared Types
// ============================================================================

/// Opaque continuation state for a cancelled transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    pub(crate) partial_path: PathBuf,
    pub(crate) offset: u64,
    pub(crate) total: Option<u64>,
}

impl ResumeData {
    pub fn new(partial_path: PathBuf, offset: u64, total: Option<u64>) -> Self {
        Self {
            partial_path,
            offset,
            total,
        }
    }

    /// Bytes already on disk
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }
}

/// One network transfer
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub destination: PathBuf,
    pub resume: Option<ResumeData>,
}

/// How a transfer ended, short of a transport error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed { path: PathBuf, bytes: u64 },
    Cancelled { resume: Option<ResumeData> },
}

/// Progress callback: `(bytes_written, total_expected)`
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Cancellation request, optionally asking the transport to keep resume data
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    keep_resume: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel and ask for resume data
    pub fn cancel_with_resume(&self) {
        self.keep_resume.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Cancel and discard any partial bytes
    pub fn cancel(&self) {
        self.keep_resume.store(false, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn wants_resume_data(&self) -> bool {
        self.keep_resume.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Path of the in-progress file for a destination
pub fn partial_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

// ============================================================================
// Trait Definition
// ============================================================================

/// Streaming download-to-file with cancel-with-resume semantics
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressFn,
        cancel: CancelSignal,
    ) -> DepotResult<FetchOutcome>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// HTTP transport backed by reqwest
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> DepotResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| DepotError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Bring an existing partial file to `part_path`, returning its length
    async fn adopt_partial(resume: &ResumeData, part_path: &Path) -> u64 {
        if resume.partial_path != part_path
            && let Err(e) = fs::rename(&resume.partial_path, part_path).await
        {
            tracing::warn!(
                from = %resume.partial_path.display(),
                error = %e,
                "Failed to adopt partial download, restarting"
            );
            return 0;
        }

        match fs::metadata(part_path).await {
            Ok(meta) => meta.len().min(resume.offset),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressFn,
        cancel: CancelSignal,
    ) -> DepotResult<FetchOutcome> {
        let part_path = partial_path_for(&request.destination);

        if let Some(parent) = part_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DepotError::io(format!("creating {}", parent.display()), e))?;
        }

        let mut offset = match &request.resume {
            Some(resume) => Self::adopt_partial(resume, &part_path).await,
            None => 0,
        };

        let mut builder = self.client.get(&request.url);
        if offset > 0 {
            builder = builder.header(header::RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if cancel.wants_resume_data() && offset > 0 {
                    let total = request.resume.as_ref().and_then(|r| r.total);
                    return Ok(FetchOutcome::Cancelled {
                        resume: Some(ResumeData::new(part_path, offset, total)),
                    });
                }
                let _ = fs::remove_file(&part_path).await;
                return Ok(FetchOutcome::Cancelled { resume: None });
            }
            response = builder.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DepotError::Network(format!(
                "GET {} returned {}",
                request.url, status
            )));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !resumed {
            tracing::info!(url = %request.url, "Server ignored range request, restarting from zero");
            offset = 0;
        }

        let accepts_ranges = resumed
            || response
                .headers()
                .get(header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        let total = response.content_length().map(|len| len + offset);

        let mut file = if resumed {
            tracing::debug!(url = %request.url, offset, "Resuming download");
            let file = fs::OpenOptions::new()
                .append(true)
                .open(&part_path)
                .await
                .map_err(|e| DepotError::io("opening partial download", e))?;
            // Bytes past the acknowledged offset are not part of the range response
            file.set_len(offset)
                .await
                .map_err(|e| DepotError::io("truncating partial download", e))?;
            file
        } else {
            fs::File::create(&part_path)
                .await
                .map_err(|e| DepotError::io("creating partial download", e))?
        };

        let mut written = offset;
        progress(written, total);

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush()
                        .await
                        .map_err(|e| DepotError::io("flushing partial download", e))?;
                    drop(file);

                    if cancel.wants_resume_data() && accepts_ranges && written > 0 {
                        return Ok(FetchOutcome::Cancelled {
                            resume: Some(ResumeData::new(part_path, written, total)),
                        });
                    }

                    let _ = fs::remove_file(&part_path).await;
                    return Ok(FetchOutcome::Cancelled { resume: None });
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes)
                        .await
                        .map_err(|e| DepotError::io("writing download chunk", e))?;
                    written += bytes.len() as u64;
                    progress(written, total);
                }
                Some(Err(e)) => {
                    drop(file);
                    let _ = fs::remove_file(&part_path).await;
                    return Err(DepotError::Network(format!(
                        "Failed reading body of {}: {}",
                        request.url, e
                    )));
                }
                None => break,
            }
        }

        file.flush()
            .await
            .map_err(|e| DepotError::io("flushing download", e))?;
        drop(file);

        fs::rename(&part_path, &request.destination)
            .await
            .map_err(|e| DepotError::io("finalizing download", e))?;

        Ok(FetchOutcome::Completed {
            path: request.destination,
            bytes: written,
        })
    }
}
