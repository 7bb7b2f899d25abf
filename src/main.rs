//! Model Depot - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use model_depot::{Catalog, DepotConfig, ModelDepot};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "model-depot")]
#[command(about = "On-demand model artifact cache", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override artifact directory
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List task categories
    Tasks,
    /// List models available for a task
    List {
        task: String,
        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one or more models, downloading and installing as needed
    Resolve {
        task: String,
        #[arg(required = true)]
        keys: Vec<String>,
        /// Move this key's download to the front once it starts
        #[arg(long)]
        prioritize: Option<String>,
    },
    /// Exit successfully if a model is installed
    Installed { key: String },
    /// Delete every installed model
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    // Load configuration
    let mut config = DepotConfig::load(cli.config)?;

    // CLI overrides
    if let Some(dir) = cli.artifact_dir {
        config.artifact_dir = dir;
    }

    config.validate()?;

    tracing::debug!(
        artifact_dir = %config.artifact_dir.display(),
        bundled_dir = ?config.bundled_dir,
        cache_capacity = config.cache_capacity,
        tasks = config.tasks.len(),
        "Configuration loaded"
    );

    let catalog = Catalog::from_config(&config);

    match cli.command {
        Command::Tasks => {
            for task in catalog.tasks() {
                println!("{}", task);
            }
        }
        Command::List { task, json } => {
            let depot = ModelDepot::from_config(&config).context("Failed to open model depot")?;
            let entries = catalog.entries_for(&task)?;
            if json {
                let listing: Vec<_> = entries
                    .iter()
                    .map(|entry| {
                        serde_json::json!({
                            "entry": entry,
                            "installed": depot.is_installed(&entry.key),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
                return Ok(());
            }
            for entry in entries {
                let status = if depot.is_installed(&entry.key) {
                    "installed"
                } else if entry.is_bundled() {
                    "bundled"
                } else {
                    "remote"
                };
                println!("{}\t{}\t{}", entry.key, entry.display_name, status);
            }
        }
        Command::Resolve {
            task,
            keys,
            prioritize,
        } => {
            let depot = ModelDepot::from_config(&config).context("Failed to open model depot")?;
            resolve(&depot, &catalog, &task, &keys, prioritize).await?;
        }
        Command::Installed { key } => {
            let depot = ModelDepot::from_config(&config).context("Failed to open model depot")?;
            let Some(path) = depot.installed_path(&key) else {
                anyhow::bail!("Model '{}' is not installed", key);
            };
            println!("{}", path.display());
        }
        Command::Clean => {
            let depot = ModelDepot::from_config(&config).context("Failed to open model depot")?;
            let report = depot.delete_all_installed();
            for path in &report.failed {
                tracing::error!(path = %path.display(), "Failed to delete");
            }
            println!("removed {} model(s)", report.removed.len());
            if !report.failed.is_empty() {
                anyhow::bail!("{} model(s) could not be deleted", report.failed.len());
            }
        }
    }

    Ok(())
}

async fn resolve(
    depot: &ModelDepot,
    catalog: &Catalog,
    task: &str,
    keys: &[String],
    prioritize: Option<String>,
) -> Result<()> {
    let entries = keys
        .iter()
        .map(|key| catalog.find(task, key))
        .collect::<Result<Vec<_>, _>>()?;

    let _progress = depot.subscribe_progress(|event| {
        tracing::info!(
            key = %event.key,
            percent = event.percentage(),
            "Download progress"
        );
    });

    if let Some(fragment) = prioritize {
        let depot = depot.clone();
        tokio::spawn(async move {
            // The download only exists once resolution reaches the network
            for _ in 0..50 {
                if depot.prioritize(&fragment) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
    }

    let resolutions = join_all(entries.iter().map(|entry| depot.resolve(entry)));

    let results = tokio::select! {
        results = resolutions => results,
        _ = shutdown_signal() => {
            if depot.cancel_current_priority() {
                tracing::info!("Cancelled priority download");
            }
            anyhow::bail!("Interrupted");
        }
    };

    let mut failures = 0;
    for result in results {
        match result {
            Ok(handle) => println!("{}\t{}", handle.key(), handle.artifact_path().display()),
            Err(failure) => {
                eprintln!("{}", failure);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} model(s) failed to resolve", failures);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
