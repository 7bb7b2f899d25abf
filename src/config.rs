//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Main depot configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DepotConfig {
    /// Durable directory holding compiled artifacts
    pub artifact_dir: PathBuf,
    /// Read-only bundled models, laid out as `<bundled_dir>/<task>/<model>`
    pub bundled_dir: Option<PathBuf>,
    pub cache_capacity: usize,
    pub max_search_depth: usize,
    pub http: HttpConfig,
    /// External compiler; payloads are installed as-is when unset
    pub compiler: Option<CompilerConfig>,
    /// Task category -> downloadable models
    pub tasks: BTreeMap<String, Vec<RemoteModelConfig>>,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            bundled_dir: None,
            cache_capacity: default_cache_capacity(),
            max_search_depth: default_max_search_depth(),
            http: HttpConfig::default(),
            compiler: None,
            tasks: BTreeMap::new(),
        }
    }
}

impl DepotConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(dir) = std::env::var("MODEL_DEPOT_ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("MODEL_DEPOT_BUNDLED_DIR") {
            config.bundled_dir = Some(PathBuf::from(dir));
        }
        if let Ok(capacity) = std::env::var("MODEL_DEPOT_CACHE_CAPACITY") {
            config.cache_capacity = capacity
                .parse()
                .context("Invalid MODEL_DEPOT_CACHE_CAPACITY value")?;
        }
        if let Ok(program) = std::env::var("MODEL_DEPOT_COMPILER") {
            config.compiler = Some(CompilerConfig {
                program,
                ..config.compiler.unwrap_or_default()
            });
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            anyhow::bail!("cache_capacity must be at least 1");
        }
        if self.max_search_depth == 0 {
            anyhow::bail!("max_search_depth must be at least 1");
        }
        if let Some(compiler) = &self.compiler
            && compiler.program.trim().is_empty()
        {
            anyhow::bail!("compiler.program cannot be empty");
        }

        for (task, models) in &self.tasks {
            if task.is_empty() {
                anyhow::bail!("Task name cannot be empty");
            }

            let mut keys = HashSet::new();
            for model in models {
                if model.name.trim().is_empty() {
                    anyhow::bail!("Model in task '{}' has an empty name", task);
                }
                if !(model.url.starts_with("http://") || model.url.starts_with("https://")) {
                    anyhow::bail!(
                        "Model '{}' in task '{}' has unsupported URL scheme: {}",
                        model.name,
                        task,
                        model.url
                    );
                }
                let key = crate::models::catalog::key_from_url(&model.url).with_context(|| {
                    format!("Cannot derive a model key from URL: {}", model.url)
                })?;
                if !keys.insert(key.to_lowercase()) {
                    anyhow::bail!("Duplicate model key '{}' in task '{}'", key, task);
                }
            }
        }

        Ok(())
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// External compiler invocation: `<program> <args..> <payload> <output_dir>`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CompilerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "xcrun".to_string(),
            args: vec!["coremlcompiler".to_string(), "compile".to_string()],
            timeout_secs: default_compile_timeout(),
        }
    }
}

/// A downloadable model archive
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteModelConfig {
    pub name: String,
    pub url: String,
}

// Default functions
fn default_artifact_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("model-depot"))
        .unwrap_or_else(|| PathBuf::from("/tmp/model-depot"))
}
fn default_cache_capacity() -> usize {
    crate::models::cache::DEFAULT_CACHE_CAPACITY
}
fn default_max_search_depth() -> usize {
    crate::models::installer::DEFAULT_MAX_SEARCH_DEPTH
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("model-depot/{}", env!("CARGO_PKG_VERSION"))
}
fn default_compile_timeout() -> u64 {
    600
}
