use crate::call_detector::ProviderTable;
use crate::cidr::{merge_ranges, parse_ranges};
use crate::error::{MonitorError, Result};
use ipnetwork::Ipv4Network;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Where the running configuration came from, reported once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    File(PathBuf),
    Defaults(String),
}

impl ConfigOrigin {
    pub fn log(&self) {
        match self {
            ConfigOrigin::File(path) => info!("Configuration loaded from {}", path.display()),
            ConfigOrigin::Defaults(reason) => warn!("Using default configuration: {}", reason),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub local_networks: Vec<String>,
    #[serde(default)]
    pub local_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub providers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub sample_interval_ms: u64,
    pub min_packet_rate: u32,
    pub network_change_delay_secs: u64,
    pub network_poll_secs: u64,
    pub probe_address: String,
    pub channel_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            sample_interval_ms: 1000,
            min_packet_rate: 1,
            network_change_delay_secs: 5,
            network_poll_secs: 10,
            probe_address: "8.8.8.8:53".to_string(),
            channel_capacity: 4096,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub call_start: Option<String>,
    pub call_end: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: Option<String>,
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            local_networks: vec![
                "10.0.0.0/8".to_string(),
                "172.16.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
            ],
            local_address: None,
            providers: BTreeMap::new(),
            monitoring: MonitoringConfig::default(),
            webhooks: WebhookConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file: explicit path, then next to the executable,
    /// then the working directory.
    pub fn find(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));

        if let Some(dir) = exe_dir {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                return Some(candidate);
            }
        }

        let cwd = Path::new(CONFIG_FILE_NAME);
        cwd.exists().then(|| cwd.to_path_buf())
    }

    /// Load from the located file. A missing or broken default file falls
    /// back to defaults; an explicit path that fails to load is an error.
    pub fn locate(explicit: Option<&Path>) -> Result<(Self, ConfigOrigin)> {
        match Config::find(explicit) {
            Some(path) if explicit.is_some() => {
                let config = Config::load(&path)?;
                Ok((config, ConfigOrigin::File(path)))
            }
            Some(path) => match Config::load(&path) {
                Ok(config) => Ok((config, ConfigOrigin::File(path))),
                Err(e) => Ok((
                    Config::default(),
                    ConfigOrigin::Defaults(format!("failed to load {} ({})", path.display(), e)),
                )),
            },
            None => Ok((
                Config::default(),
                ConfigOrigin::Defaults(format!("{} not found", CONFIG_FILE_NAME)),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        parse_ranges(&self.local_networks)?;
        for (name, ranges) in &self.providers {
            if name.trim().is_empty() {
                return Err(MonitorError::Config("provider name must not be empty".into()));
            }
            parse_ranges(ranges)?;
        }
        if self.monitoring.sample_interval_ms == 0 {
            return Err(MonitorError::Config("sample_interval_ms must be greater than zero".into()));
        }
        if self.monitoring.min_packet_rate == 0 {
            return Err(MonitorError::Config("min_packet_rate must be greater than zero".into()));
        }
        if self.monitoring.channel_capacity == 0 {
            return Err(MonitorError::Config("channel_capacity must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn local_ranges(&self) -> Result<Vec<Ipv4Network>> {
        parse_ranges(&self.local_networks)
    }

    pub fn provider_table(&self) -> Result<ProviderTable> {
        let mut table = ProviderTable::new();
        for (name, ranges) in &self.providers {
            let parsed = parse_ranges(ranges)?;
            let merged = merge_ranges(parsed);
            info!("Provider '{}': {} ranges ({} after merge)", name, ranges.len(), merged.len());
            table.insert(name.clone(), merged);
        }
        Ok(table)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring.sample_interval_ms)
    }

    pub fn network_change_delay(&self) -> Duration {
        Duration::from_secs(self.monitoring.network_change_delay_secs)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.network_poll_secs)
    }
}
