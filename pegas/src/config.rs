//! Configuration loading. See spec §6 and SPEC_FULL §4.9.
//!
//! Ground: teacher `settings.rs`'s `AppSettings::load()` shape (resolve a
//! path, read, parse, fall back to defaults), adapted to the spec's own
//! schema and read-only (no `save()` — config is a frozen record, SPEC_FULL
//! §9) and the exact XDG fallback chain recovered from
//! `original_source/src/pegas.c`.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use pegas_shared::ServerDescriptor;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}
fn default_local_port() -> u16 {
    1080
}
fn default_control_port() -> u16 {
    0
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_local_address")]
    pub local_address: String,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default)]
    pub control_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_isatty: Option<bool>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub servers: Vec<ServerDescriptor>,

    /// Worker thread count. Not a config-file key (spec §6 gives it via
    /// `-t`); defaulted here and overridden by the CLI after load.
    #[serde(default = "default_worker_threads", skip_serializing)]
    pub worker_threads: usize,
}

fn default_worker_threads() -> usize {
    4
}

impl Config {
    pub fn log_isatty(&self) -> bool {
        self.log_isatty.unwrap_or_else(|| std::io::stdout().is_terminal())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Invalid("servers must not be empty".into()));
        }
        if pegas_shared::LogLevel::parse(&self.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        if self.local_port == 0 {
            return Err(ConfigError::Invalid("local_port must be non-zero".into()));
        }
        Ok(())
    }
}

/// Resolves the default config path: `$XDG_CONFIG_HOME/.pegasrc`, then
/// `$XDG_CONFIG_HOME/pegas/config`, substituting `$HOME/.config` when
/// `XDG_CONFIG_HOME` is unset. Ground: `original_source/src/pegas.c`.
fn default_config_candidates() -> Vec<PathBuf> {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")));

    let Some(base) = base else { return Vec::new() };
    vec![base.join(".pegasrc"), base.join("pegas").join("config")]
}

/// Loads config from `path` if given, otherwise from the first existing
/// default candidate.
pub fn load(path: Option<&Path>, worker_threads_override: Option<usize>) -> Result<Config, ConfigError> {
    let resolved = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let candidates = default_config_candidates();
            candidates
                .iter()
                .find(|p| p.exists())
                .cloned()
                .ok_or_else(|| {
                    ConfigError::NotFound(
                        candidates
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                    )
                })?
        }
    };

    let text = std::fs::read_to_string(&resolved).map_err(|source| ConfigError::Io {
        path: resolved.display().to_string(),
        source,
    })?;

    let mut config: Config = serde_json::from_str(&text)?;
    if let Some(n) = worker_threads_override {
        config.worker_threads = n;
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "local_port": 1080,
            "servers": [
                {"address": "example.com", "port": 443, "server_type": "v2ray_ws",
                 "password_or_uuid": "3f6f8e9a-0000-0000-0000-000000000000",
                 "ws_path": "/ray"}
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.local_port, 1080);
        assert_eq!(config.control_port, 0);
        assert_eq!(config.timeout, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_servers() {
        let json = r#"{"local_port": 1080, "servers": []}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
