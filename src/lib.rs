//! Model Depot - on-demand model artifact cache
//!
//! Resolves a model key to a loaded handle through a bounded in-memory LRU
//! cache, a durable on-disk artifact store, and finally a resumable download
//! followed by archive extraction, compilation and installation.

pub mod config;
pub mod depot;
pub mod download;
pub mod error;
pub mod metrics;
pub mod models;
pub mod progress;

pub use config::{DepotConfig, RemoteModelConfig};
pub use depot::{ModelDepot, ResolveFailure, ResolveResult, ResolveState, normalize_key};
pub use download::{DownloadCoordinator, HttpTransport, Transport};
pub use error::{DepotError, DepotResult};
pub use models::{CacheStore, Catalog, DiskStore, ModelEntry, ModelHandle, ModelOrigin};
pub use progress::{ProgressEvent, ProgressHub, Subscription};
