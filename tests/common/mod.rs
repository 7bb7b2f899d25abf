//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use model_depot::download::{
    CancelSignal, FetchOutcome, FetchRequest, ProgressFn, ResumeData, Transport,
    partial_path_for,
};
use model_depot::DepotResult;
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use zip::write::FileOptions;

/// Build an in-memory zip; names ending in '/' become directories
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options).unwrap();
        } else {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
    }
    zip.finish().unwrap().into_inner()
}

/// A typical downloaded model archive, with Finder metadata mixed in
pub fn model_archive(stem: &str) -> Vec<u8> {
    let package = format!("{}.mlpackage/", stem);
    let manifest = format!("{}.mlpackage/Manifest.json", stem);
    let weights = format!("{}.mlpackage/Data/weights.bin", stem);
    let apple_double = format!("__MACOSX/._{}.mlpackage", stem);
    zip_bytes(&[
        (apple_double.as_str(), b"junk".as_slice()),
        (package.as_str(), b"".as_slice()),
        (manifest.as_str(), b"{}".as_slice()),
        (weights.as_str(), &[7u8; 4096]),
    ])
}

/// Serves a fixed body in chunks, counting requests and honouring cancel
pub struct ChunkedTransport {
    body: Vec<u8>,
    chunk: usize,
    step: Duration,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl ChunkedTransport {
    pub fn new(body: Vec<u8>, chunk: usize, step: Duration) -> Self {
        Self {
            body,
            chunk: chunk.max(1),
            step,
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ChunkedTransport {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressFn,
        cancel: CancelSignal,
    ) -> DepotResult<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(request.url.clone());

        let part = partial_path_for(&request.destination);
        std::fs::create_dir_all(part.parent().unwrap()).unwrap();

        let mut written = match &request.resume {
            Some(resume) => resume.offset() as usize,
            None => 0,
        };
        std::fs::write(&part, &self.body[..written]).unwrap();

        let total = Some(self.body.len() as u64);
        progress(written as u64, total);

        while written < self.body.len() {
            tokio::time::sleep(self.step).await;
            if cancel.is_cancelled() {
                let resume = cancel
                    .wants_resume_data()
                    .then(|| ResumeData::new(part.clone(), written as u64, total));
                return Ok(FetchOutcome::Cancelled { resume });
            }

            let end = (written + self.chunk).min(self.body.len());
            let mut file = std::fs::OpenOptions::new().append(true).open(&part).unwrap();
            file.write_all(&self.body[written..end]).unwrap();
            written = end;
            progress(written as u64, total);
        }

        std::fs::rename(&part, &request.destination).unwrap();
        Ok(FetchOutcome::Completed {
            path: request.destination,
            bytes: written as u64,
        })
    }
}
