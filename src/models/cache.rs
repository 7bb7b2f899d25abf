//! In-memory LRU cache of compiled model handles
//!
//! Capacity is a plain entry count, not a byte budget. Every access goes
//! through a single mutex that guards both the record map and the recency
//! order, so completions arriving from concurrent downloads cannot tear the
//! two structures apart.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default number of compiled models kept in memory
pub const DEFAULT_CACHE_CAPACITY: usize = 3;

#[derive(Debug)]
struct LoadedModel {
    key: String,
    artifact_path: PathBuf,
    loaded_at: DateTime<Utc>,
}

/// Opaque, cheaply clonable handle to a runtime-loadable model artifact
#[derive(Debug, Clone)]
pub struct ModelHandle {
    inner: Arc<LoadedModel>,
}

impl ModelHandle {
    pub fn new(key: impl Into<String>, artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LoadedModel {
                key: key.into(),
                artifact_path: artifact_path.into(),
                loaded_at: Utc::now(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn artifact_path(&self) -> &Path {
        &self.inner.artifact_path
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.inner.loaded_at
    }

    /// True when both handles refer to the same loaded instance
    pub fn same_instance(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug)]
struct CacheRecord {
    handle: ModelHandle,
    tick: u64,
}

#[derive(Debug, Default)]
struct LruState {
    records: HashMap<String, CacheRecord>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl LruState {
    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.bump();
        if let Some(record) = self.records.get_mut(key) {
            self.recency.remove(&record.tick);
            record.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.records.remove(&key);
        Some(key)
    }
}

/// Bounded map of ready-to-use model handles with strict LRU eviction
#[derive(Debug)]
pub struct CacheStore {
    capacity: usize,
    state: Mutex<LruState>,
}

impl CacheStore {
    /// Create a cache holding at most `capacity` handles (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a handle, marking it most-recently-used on hit
    pub fn get(&self, key: &str) -> Option<ModelHandle> {
        let mut state = self.state.lock();
        let handle = state.records.get(key)?.handle.clone();
        state.touch(key);
        Some(handle)
    }

    /// Insert or refresh a handle
    ///
    /// Returns the key evicted to make room, if any.
    pub fn put(&self, key: &str, handle: ModelHandle) -> Option<String> {
        let mut state = self.state.lock();

        if state.records.contains_key(key) {
            if let Some(record) = state.records.get_mut(key) {
                record.handle = handle;
            }
            state.touch(key);
            return None;
        }

        let evicted = if state.records.len() >= self.capacity {
            state.evict_oldest()
        } else {
            None
        };

        if let Some(ref evicted_key) = evicted {
            tracing::debug!(key = %evicted_key, "Evicted least-recently-used model");
        }

        let tick = state.bump();
        state.recency.insert(tick, key.to_string());
        state
            .records
            .insert(key.to_string(), CacheRecord { handle, tick });

        evicted
    }

    /// Membership probe; does not affect recency
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().records.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<ModelHandle> {
        let mut state = self.state.lock();
        let record = state.records.remove(key)?;
        state.recency.remove(&record.tick);
        Some(record.handle)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys ordered from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.state.lock().recency.values().cloned().collect()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
