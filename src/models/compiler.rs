//! Payload compilation into runtime-loadable artifacts
//!
//! `CommandCompiler` shells out to a platform compiler (by default
//! `xcrun coremlcompiler compile <payload> <output_dir>`). `PassthroughCompiler`
//! treats the payload as already loadable and copies it into place.

use super::disk::COMPILED_EXTENSION;
use crate::config::CompilerConfig;
use crate::error::{DepotError, DepotResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

// ============================================================================
// Trait Definition
// ============================================================================

/// Converts a raw payload into a loadable artifact
#[async_trait]
pub trait ModelCompiler: Send + Sync {
    /// Compile `payload` into `output_dir`, returning the artifact path
    ///
    /// Implementations must not block the calling task.
    async fn compile(&self, payload: &Path, output_dir: &Path) -> DepotResult<PathBuf>;
}

/// Artifact path a compiler is expected to produce for a payload
pub fn compiled_artifact_path(payload: &Path, output_dir: &Path) -> PathBuf {
    let stem = payload
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    output_dir.join(format!("{}.{}", stem, COMPILED_EXTENSION))
}

// ============================================================================
// Production Implementations
// ============================================================================

/// Compiler that runs an external program
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCompiler {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl ModelCompiler for CommandCompiler {
    async fn compile(&self, payload: &Path, output_dir: &Path) -> DepotResult<PathBuf> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(payload)
            .arg(output_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %self.program,
            payload = %payload.display(),
            output_dir = %output_dir.display(),
            "Spawning model compiler"
        );

        let child = cmd
            .spawn()
            .map_err(|e| DepotError::Compile(format!("Failed to spawn {}: {}", self.program, e)))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DepotError::Compile(format!(
                    "Failed waiting for {}: {}",
                    self.program, e
                )));
            }
            Err(_) => {
                return Err(DepotError::Compile(format!(
                    "Compiler timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DepotError::Compile(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let artifact = compiled_artifact_path(payload, output_dir);
        if !artifact.exists() {
            return Err(DepotError::Compile(format!(
                "Compiler produced no artifact at {}",
                artifact.display()
            )));
        }

        crate::metrics::record_compile_duration(started.elapsed());
        Ok(artifact)
    }
}

/// Compiler for payloads that are already loadable
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCompiler;

impl PassthroughCompiler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModelCompiler for PassthroughCompiler {
    async fn compile(&self, payload: &Path, output_dir: &Path) -> DepotResult<PathBuf> {
        let started = Instant::now();
        let source = payload.to_path_buf();
        let artifact = compiled_artifact_path(payload, output_dir);
        let target = artifact.clone();

        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| DepotError::Compile(format!("Compile task panicked: {}", e)))??;

        crate::metrics::record_compile_duration(started.elapsed());
        Ok(artifact)
    }
}

/// Copy a file, or a directory recursively, without following symlinks
fn copy_tree(source: &Path, target: &Path) -> DepotResult<()> {
    let meta = std::fs::symlink_metadata(source)
        .map_err(|e| DepotError::io(format!("reading {}", source.display()), e))?;

    if meta.is_dir() {
        std::fs::create_dir_all(target)
            .map_err(|e| DepotError::io(format!("creating {}", target.display()), e))?;
        let entries = std::fs::read_dir(source)
            .map_err(|e| DepotError::io(format!("listing {}", source.display()), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DepotError::io("listing payload", e))?;
            copy_tree(&entry.path(), &target.join(entry.file_name()))?;
        }
    } else if meta.is_file() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DepotError::io(format!("creating {}", parent.display()), e))?;
        }
        std::fs::copy(source, target)
            .map_err(|e| DepotError::io(format!("copying {}", source.display()), e))?;
    }

    Ok(())
}
