use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregate::AggregationMode;
use crate::error::GuardError;
use crate::guard::GuardSettings;
use crate::snapshot::{SnapshotLayout, PROC_NET_TCP};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub ipset: IpsetConfig,

    #[serde(default)]
    pub whitelist: WhitelistConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/tcpguard/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("tcpguard/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Validated settings for the policy loop
    pub fn guard_settings(&self) -> std::result::Result<GuardSettings, GuardError> {
        GuardSettings::new(
            self.guard.ports.clone(),
            self.guard.kill,
            Duration::from_secs(self.guard.interval_secs),
            self.guard.mode,
        )
        .map(|settings| settings.with_layout(self.guard.layout))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Local ports to watch (empty = all ports)
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Block a peer once it holds this many connections
    #[serde(default = "default_kill")]
    pub kill: usize,

    /// Seconds between evaluations
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Count all connections or only abnormal ones
    #[serde(default)]
    pub mode: AggregationMode,

    /// Connection table files read on every evaluation
    #[serde(default = "default_sources")]
    pub sources: Vec<PathBuf>,

    /// Row layout of the connection table
    #[serde(default)]
    pub layout: SnapshotLayout,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            kill: default_kill(),
            interval_secs: default_interval(),
            mode: AggregationMode::default(),
            sources: default_sources(),
            layout: SnapshotLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpsetConfig {
    /// Name of the ipset holding blocked peers
    #[serde(default = "default_ipset_name")]
    pub name: String,

    /// Seconds a peer stays in the set
    #[serde(default = "default_ipset_timeout")]
    pub timeout_secs: u64,

    /// Path or name of the ipset executable
    #[serde(default = "default_ipset_binary")]
    pub binary: String,
}

impl Default for IpsetConfig {
    fn default() -> Self {
        Self {
            name: default_ipset_name(),
            timeout_secs: default_ipset_timeout(),
            binary: default_ipset_binary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// File with one or more IPs / CIDRs per line
    #[serde(default = "default_whitelist_file")]
    pub file: PathBuf,

    /// Additional networks in CIDR notation
    #[serde(default)]
    pub networks: Vec<String>,

    /// Whitelist the addresses of local interfaces
    #[serde(default = "default_true")]
    pub include_local: bool,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            file: default_whitelist_file(),
            networks: Vec::new(),
            include_local: true,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_kill() -> usize {
    200
}

fn default_interval() -> u64 {
    3
}

fn default_sources() -> Vec<PathBuf> {
    vec![PathBuf::from(PROC_NET_TCP)]
}

fn default_ipset_name() -> String {
    "blackhold".to_string()
}

fn default_ipset_timeout() -> u64 {
    600 // 10 minutes
}

fn default_ipset_binary() -> String {
    "ipset".to_string()
}

fn default_whitelist_file() -> PathBuf {
    PathBuf::from("whiteip.txt")
}

fn default_true() -> bool {
    true
}
