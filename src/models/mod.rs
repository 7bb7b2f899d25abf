//! Model storage module
//!
//! Provides functionality for:
//! - Keeping recently used model handles in a bounded LRU cache
//! - Persisting compiled artifacts on disk
//! - Extracting, compiling and installing downloaded archives
//! - Listing bundled and downloadable models per task

pub mod cache;
pub mod catalog;
pub mod compiler;
pub mod disk;
pub mod installer;

pub use cache::{CacheStore, DEFAULT_CACHE_CAPACITY, ModelHandle};
pub use catalog::{Catalog, ModelEntry, ModelOrigin, key_from_url};
pub use compiler::{CommandCompiler, ModelCompiler, PassthroughCompiler};
pub use disk::{DeleteReport, DiskStore};
pub use installer::{ArchiveInstaller, InstallFailure, extract_archive, find_payload};
