//! Config loader — reads `config.json`, merges env overrides.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `<hive root>/config.json`
//! 3. Environment variables `HIVEBOT_<SECTION>__<FIELD>` (override JSON)
//!
//! A missing or unparsable file falls back to defaults with a warning; a
//! structurally valid file that fails cross-reference validation is surfaced
//! to the caller via [`Config::validate`] at startup, not here.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::schema::Config;

/// Default config file path under a hive root.
pub fn config_path(root: &Path) -> PathBuf {
    root.join("config.json")
}

/// Load configuration for a hive root, falling back to defaults.
pub fn load_config(root: &Path) -> Config {
    load_config_from_path(&config_path(root))
}

fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("no config file at {}, using defaults", path.display());
        return apply_env_overrides(Config::default());
    }

    debug!("loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to read config file {}: {}", path.display(), e);
            return apply_env_overrides(Config::default());
        }
    };

    let config: Config = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to parse config JSON: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    apply_env_overrides(config)
}

/// Save configuration to disk (pretty-printed JSON, camelCase keys).
pub fn save_config(config: &Config, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    std::fs::write(path, json)?;
    debug!("config saved to {}", path.display());
    Ok(())
}

/// Apply `HIVEBOT_QUEUE__*` env overrides on top of a loaded config.
fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(val) = std::env::var("HIVEBOT_QUEUE__POLL_INTERVAL_MS") {
        if let Ok(n) = val.parse::<u64>() {
            config.queue.poll_interval_ms = n;
        }
    }
    if let Ok(val) = std::env::var("HIVEBOT_QUEUE__WORKER_TIMEOUT_SECS") {
        if let Ok(n) = val.parse::<u64>() {
            config.queue.worker_timeout_secs = n;
        }
    }
    if let Ok(val) = std::env::var("HIVEBOT_QUEUE__WORKER_STDOUT_CAP_BYTES") {
        if let Ok(n) = val.parse::<usize>() {
            config.queue.worker_stdout_cap_bytes = n;
        }
    }
    if let Ok(val) = std::env::var("HIVEBOT_QUEUE__DEADLETTER_AFTER") {
        if let Ok(n) = val.parse::<u32>() {
            config.queue.deadletter_after = n;
        }
    }
    config
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
