#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

use std::path::PathBuf;

use clap::Parser;

#[cfg(not(unix))]
compile_error!("Only unix is currently supported");

/// Mail delivery scheduler
#[derive(Parser, Debug)]
#[command(name = "switchyard", version)]
struct Args {
    /// Configuration file; skips the usual search
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => find_config_file()?,
    };
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let switchyard: switchyard::controller::Switchyard = ron::from_str(&config_content)?;

    switchyard.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `SWITCHYARD_CONFIG` environment variable
/// 2. ./switchyard.config.ron (current working directory)
/// 3. /etc/switchyard/switchyard.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("SWITCHYARD_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "SWITCHYARD_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./switchyard.config.ron"),
        PathBuf::from("/etc/switchyard/switchyard.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - SWITCHYARD_CONFIG environment variable\n{paths_tried}"
    )
}
