//! Per-task model listings
//!
//! Bundled models come first, read from `<bundled_dir>/<task>/`. Downloadable
//! models from configuration follow. Keys are unique per task, compared
//! case-insensitively, and a bundled model shadows a remote one with the same key.

use super::disk::{MODEL_FILE_EXTENSIONS, has_model_extension};
use crate::config::{DepotConfig, RemoteModelConfig};
use crate::error::{DepotError, DepotResult};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Archive suffixes stripped when deriving a key from a URL
const ARCHIVE_EXTENSIONS: [&str; 1] = ["zip"];

/// Where a model's bytes come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelOrigin {
    Bundled { path: PathBuf },
    Remote { url: String },
}

/// A selectable model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub display_name: String,
    pub key: String,
    pub origin: ModelOrigin,
}

impl ModelEntry {
    pub fn bundled(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let key = path.file_stem()?.to_str()?.to_string();
        Some(Self {
            display_name: key.clone(),
            key,
            origin: ModelOrigin::Bundled { path },
        })
    }

    pub fn remote(display_name: impl Into<String>, url: impl Into<String>) -> Option<Self> {
        let url = url.into();
        let key = key_from_url(&url)?;
        Some(Self {
            display_name: display_name.into(),
            key,
            origin: ModelOrigin::Remote { url },
        })
    }

    pub fn is_bundled(&self) -> bool {
        matches!(self.origin, ModelOrigin::Bundled { .. })
    }
}

/// Derive a model key from the last path segment of a URL
///
/// Query strings and fragments are ignored; archive and model extensions are
/// stripped, so `.../yolo11n.mlpackage.zip?dl=1` yields `yolo11n`.
pub fn key_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next()?;
    let mut name = without_query.trim_end_matches('/').rsplit('/').next()?;

    loop {
        let stripped = name.rsplit_once('.').and_then(|(stem, ext)| {
            let ext = ext.to_ascii_lowercase();
            let known = ARCHIVE_EXTENSIONS.contains(&ext.as_str())
                || MODEL_FILE_EXTENSIONS.contains(&ext.as_str());
            (known && !stem.is_empty()).then_some(stem)
        });
        match stripped {
            Some(stem) => name = stem,
            None => break,
        }
    }

    if name.is_empty() || name.contains(':') {
        return None;
    }
    Some(name.to_string())
}

/// Builds model listings from configuration and bundled resources
#[derive(Debug, Clone)]
pub struct Catalog {
    bundled_dir: Option<PathBuf>,
    remote: BTreeMap<String, Vec<RemoteModelConfig>>,
}

impl Catalog {
    pub fn new(
        bundled_dir: Option<PathBuf>,
        remote: BTreeMap<String, Vec<RemoteModelConfig>>,
    ) -> Self {
        Self {
            bundled_dir,
            remote,
        }
    }

    pub fn from_config(config: &DepotConfig) -> Self {
        Self::new(config.bundled_dir.clone(), config.tasks.clone())
    }

    /// Task names with either bundled or remote models, sorted
    pub fn tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self.remote.keys().cloned().collect();

        if let Some(dir) = &self.bundled_dir
            && let Ok(entries) = std::fs::read_dir(dir)
        {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                    && let Some(name) = entry.file_name().to_str()
                    && !name.starts_with('.')
                {
                    tasks.push(name.to_string());
                }
            }
        }

        tasks.sort();
        tasks.dedup();
        tasks
    }

    /// All models for `task`, bundled first
    pub fn entries_for(&self, task: &str) -> DepotResult<Vec<ModelEntry>> {
        let bundled_folder = self
            .bundled_dir
            .as_ref()
            .map(|dir| dir.join(task))
            .filter(|dir| dir.is_dir());
        let remote = self.remote.get(task).filter(|models| !models.is_empty());

        if bundled_folder.is_none() && remote.is_none() {
            return Err(DepotError::NotFound(format!("no models for task '{}'", task)));
        }

        let mut entries = match &bundled_folder {
            Some(folder) => bundled_entries(folder)?,
            None => Vec::new(),
        };
        let mut seen: HashSet<String> = entries.iter().map(|e| e.key.to_lowercase()).collect();

        for model in remote.into_iter().flatten() {
            let Some(entry) = ModelEntry::remote(&model.name, &model.url) else {
                tracing::warn!(task = %task, url = %model.url, "Skipping model with unusable URL");
                continue;
            };
            if seen.insert(entry.key.to_lowercase()) {
                entries.push(entry);
            } else {
                tracing::debug!(task = %task, key = %entry.key, "Skipping duplicate model key");
            }
        }

        tracing::debug!(task = %task, count = entries.len(), "Listed models");
        Ok(entries)
    }

    /// Find one entry by key, case-insensitively
    pub fn find(&self, task: &str, key: &str) -> DepotResult<ModelEntry> {
        self.entries_for(task)?
            .into_iter()
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .ok_or_else(|| DepotError::NotFound(format!("model '{}' in task '{}'", key, task)))
    }
}

fn bundled_entries(folder: &Path) -> DepotResult<Vec<ModelEntry>> {
    let listing = std::fs::read_dir(folder)
        .map_err(|e| DepotError::io(format!("listing {}", folder.display()), e))?;

    let mut paths: Vec<PathBuf> = listing
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| has_model_extension(path))
        .collect();
    paths.sort();

    let mut seen = HashSet::new();
    Ok(paths
        .into_iter()
        .filter_map(ModelEntry::bundled)
        .filter(|entry| seen.insert(entry.key.to_lowercase()))
        .collect())
}
