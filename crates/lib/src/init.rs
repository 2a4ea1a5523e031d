//! Initialize the configuration directory: create ~/.wabridge, the default config, and the mailbox
//! and session directories.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;

/// Ensure the configuration directory has been initialized (config file and mailbox directory exist).
pub fn require_initialized(config_path: &Path, config: &config::Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `wabridge init` first (config file not found: {})",
            config_path.display()
        );
    }
    let mailbox_dir = config::resolve_mailbox_dir(config, config_path);
    if !mailbox_dir.exists() {
        anyhow::bail!(
            "configuration not initialized; run `wabridge init` first (mailbox directory not found: {})",
            mailbox_dir.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Writes `config.json` with every setting at its default if missing.
/// - Creates the mailbox and session directories the config resolves to.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&config::Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    for dir in [
        config::resolve_mailbox_dir(&config, config_path),
        config::resolve_session_dir(&config, config_path),
    ] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            log::info!("created directory {}", dir.display());
        } else {
            log::debug!("directory already exists at {}, skipping", dir.display());
        }
    }

    Ok(config_dir.to_path_buf())
}
