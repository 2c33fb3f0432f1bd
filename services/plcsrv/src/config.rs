//! Service configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `PLCSRV_`-prefixed environment variables (`__` separates nesting levels,
//! e.g. `PLCSRV_CONNECTION__SIMULATED=true`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{PlcError, Result};
use crate::store::TagValue;
use crate::tag::{seconds, TagDirection};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/plcsrv.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PLCSRV_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlcConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Tags to set up on connect, in order
    #[serde(default)]
    pub tag_list: Vec<String>,

    /// Per-tag metadata keyed by tag name
    #[serde(default)]
    pub tags: HashMap<String, TagConfig>,
}

/// Service identity and logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Directory for rolling log files; unset logs to the console only
    #[serde(default = "default_log_dir")]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// JSON lines in the log file instead of bracketed text
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Controller connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Controller network address
    #[serde(default)]
    pub address: Option<String>,
    /// Talk to the in-memory simulator instead of hardware
    #[serde(default)]
    pub simulated: bool,
    /// Force the debug marker on the controller address
    #[serde(default)]
    pub plcio_debug: bool,
    /// Tag-name suffix identifying the status tag
    #[serde(default = "default_status_tag_suffix")]
    pub status_tag_suffix: String,
    /// Whether tag writes reach the controller
    #[serde(default = "default_true")]
    pub hardware_writes: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: None,
            simulated: false,
            plcio_debug: false,
            status_tag_suffix: default_status_tag_suffix(),
            hardware_writes: true,
        }
    }
}

/// Metadata of one tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    #[serde(default = "default_direction")]
    pub direction: TagDirection,
    pub byte_length: usize,
    /// Polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Reconnect retry interval in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: f64,
    /// Hardware timeout reported in alarms
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Absent means always enabled
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            direction: default_direction(),
            byte_length: 0,
            interval: default_interval(),
            reconnect_interval: default_reconnect_interval(),
            timeout_ms: default_timeout_ms(),
            enabled: None,
            items: Vec::new(),
        }
    }
}

/// One item of a tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConfig {
    pub name: String,
    /// Declared kind, e.g. `boolean`, `dint`, `real`
    pub kind: String,
    /// Byte offset within the block
    pub byte: usize,
    /// Bit offset, booleans only
    #[serde(default)]
    pub bit: u8,
    /// Value fused into writes that omit this item
    #[serde(default)]
    pub default: Option<TagValue>,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "plcsrv".to_string()
}

fn default_log_dir() -> Option<PathBuf> {
    Some(PathBuf::from("logs"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_tag_suffix() -> String {
    "CStatus".to_string()
}

fn default_direction() -> TagDirection {
    TagDirection::Read
}

fn default_interval() -> f64 {
    1.0
}

fn default_reconnect_interval() -> f64 {
    5.0
}

fn default_timeout_ms() -> u64 {
    1000
}

impl PlcConfig {
    /// Figment with every layer, for callers that want to add their own
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(PlcConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate configuration from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_figment(&Self::figment(path))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: PlcConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(PlcError::config("service name must not be empty"));
        }

        if !self.connection.simulated
            && self
                .connection
                .address
                .as_deref()
                .map_or(true, |a| a.trim().is_empty())
        {
            return Err(PlcError::config(
                "connection.address is required unless connection.simulated is set",
            ));
        }

        for (name, tag) in &self.tags {
            seconds(name, "interval", tag.interval)?;
            seconds(name, "reconnect_interval", tag.reconnect_interval)?;
        }
        Ok(())
    }

    /// Metadata for `name`, if present
    pub fn tag(&self, name: &str) -> Option<&TagConfig> {
        self.tags.get(name)
    }
}
