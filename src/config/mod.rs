mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./config.toml",
        "./tunerflow.toml",
        "~/.config/tunerflow/config.toml",
        "/etc/tunerflow/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    let live_tv = &config.live_tv;
    if live_tv.transcode_temp_dir.as_os_str().is_empty() {
        anyhow::bail!("live_tv.transcode_temp_dir cannot be empty");
    }
    if live_tv.segment_extension.is_empty() {
        anyhow::bail!("live_tv.segment_extension cannot be empty");
    }
    if live_tv.copier.buffer_size == 0 {
        anyhow::bail!("live_tv.copier.buffer_size must be greater than 0");
    }
    if live_tv.copier.exited_empty_read_limit == 0 || live_tv.copier.sealed_segment_empty_read_limit == 0 {
        anyhow::bail!("live_tv.copier empty read limits must be at least 1");
    }

    let mut seen = HashSet::new();
    for tuner in &live_tv.tuners {
        if !seen.insert(tuner.id.as_str()) {
            anyhow::bail!("Duplicate tuner id '{}'", tuner.id);
        }
        match tuner.kind {
            TunerKind::M3u if !tuner.url.contains("://") => {
                // Local playlist path
                if !Path::new(&tuner.url).exists() {
                    tracing::warn!("M3U playlist for tuner '{}' does not exist: {}", tuner.id, tuner.url);
                }
            }
            _ => {
                reqwest::Url::parse(&tuner.url)
                    .with_context(|| format!("Tuner '{}' has an invalid url: {}", tuner.id, tuner.url))?;
            }
        }
        if tuner.tuner_count == Some(0) {
            anyhow::bail!("Tuner '{}' has a tuner_count of 0", tuner.id);
        }
    }

    Ok(())
}
