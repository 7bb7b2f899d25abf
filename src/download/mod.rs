//! Concurrent, cancellable, resumable downloads
//!
//! Provides:
//! - `Transport` seam with a reqwest-backed streaming implementation
//! - `DownloadCoordinator` enforcing one network task per key, with
//!   cancel-and-resume priority promotion

pub mod coordinator;
pub mod transport;

pub use coordinator::{
    CancelIntent, DownloadCoordinator, DownloadFailure, DownloadResult, DownloadTicket, TaskId,
    TaskOrigin, TaskPhase, TaskSnapshot,
};
pub use transport::{
    CancelSignal, FetchOutcome, FetchRequest, HttpTransport, ProgressFn, ResumeData, Transport,
    partial_path_for,
};
