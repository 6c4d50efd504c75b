//! Agent configuration.
//!
//! Priority, highest first: environment variable, config file
//! (`~/.config/lanpresence/config.toml`), built-in defaults.

use crate::scanner::SweepOptions;
use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Default collector endpoint (the original deployment runs the
/// collector next to the agent).
const DEFAULT_COLLECTOR_URL: &str = "http://127.0.0.1:8000";

/// Default seconds between sweep cycles.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;

/// How long a graceful shutdown waits for an in-flight cycle.
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

/// Environment variable overriding the collector URL.
const ENV_COLLECTOR_URL: &str = "LANPRESENCE_COLLECTOR_URL";

/// On-disk configuration file structure.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    collector: Option<CollectorSection>,
    sweep: Option<SweepSection>,
}

#[derive(Debug, Deserialize, Default)]
struct CollectorSection {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SweepSection {
    interval_secs: Option<u64>,
    probe_count: Option<u32>,
    probe_timeout_secs: Option<u64>,
    probe_interval_secs: Option<u64>,
    concurrency: Option<usize>,
}

/// Where the collector URL came from (for logging and `config`
/// output).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Environment,
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Runtime agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub collector_url: String,
    pub collector_url_source: ConfigSource,
    pub sweep_interval: Duration,
    pub sweep_options: SweepOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            collector_url_source: ConfigSource::Default,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            sweep_options: SweepOptions::default(),
        }
    }
}

/// Path of the configuration file.
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("lanpresence").join("config.toml"))
}

pub fn config_file_path_string() -> String {
    config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

fn load_config_file() -> Option<ConfigFile> {
    let path = config_file_path()?;
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::debug!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file {:?}: {}", path, e);
            None
        }
    }
}

/// Load the agent configuration, merging file values over the
/// defaults and the environment over both.
pub fn load_config() -> Result<AgentConfig> {
    let mut config = AgentConfig::default();

    if let Some(file) = load_config_file() {
        apply_config_file(&mut config, file);
    }

    if let Ok(url) = std::env::var(ENV_COLLECTOR_URL) {
        let url = url.trim().trim_end_matches('/');
        if !url.is_empty() {
            tracing::info!("Using collector URL from environment: {}", url);
            config.collector_url = url.to_string();
            config.collector_url_source = ConfigSource::Environment;
        }
    }

    Ok(config)
}

fn apply_config_file(config: &mut AgentConfig, file: ConfigFile) {
    if let Some(url) = file
        .collector
        .and_then(|c| c.url)
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
    {
        config.collector_url = url;
        config.collector_url_source = ConfigSource::ConfigFile;
    }

    if let Some(sweep) = file.sweep {
        if let Some(secs) = sweep.interval_secs {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(count) = sweep.probe_count {
            config.sweep_options.count = count;
        }
        if let Some(secs) = sweep.probe_timeout_secs {
            config.sweep_options.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = sweep.probe_interval_secs {
            config.sweep_options.interval = Duration::from_secs(secs);
        }
        if let Some(concurrency) = sweep.concurrency {
            config.sweep_options.concurrency = concurrency;
        }
    }
}

/// Example config for `lanpresence config` output.
pub fn generate_example_config() -> String {
    format!(
        r#"[collector]
url = "{DEFAULT_COLLECTOR_URL}"

[sweep]
interval_secs = {DEFAULT_SWEEP_INTERVAL_SECS}
probe_count = 3
probe_timeout_secs = 2
probe_interval_secs = 1
concurrency = 100
"#
    )
}
