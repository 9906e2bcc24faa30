//! Load config from file and environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use oic_core::{AttributeStore, AttributeValue, AutomationType, Constraint};
use serde::Deserialize;

use crate::client::ClientConfig;
use crate::host::ResourceDefinition;
use crate::transport::udp::COAP_PORT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("environment variable {name}={value:?} is not valid")]
    InvalidEnv { name: &'static str, value: String },
    #[error("resource {uri}: {reason}")]
    InvalidResource { uri: String, reason: String },
}

/// Daemon configuration. File: ~/.config/oic/config.toml or /etc/oic/config.toml.
/// Env overrides: OIC_COAP_PORT, OIC_DISCOVERY_TIMEOUT_MS, OIC_SUBSCRIBE_TIMEOUT_MS, OIC_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port for CoAP traffic (default 5683).
    #[serde(default = "default_coap_port")]
    pub coap_port: u16,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_automation_interval_ms")]
    pub automation_interval_ms: u64,
    /// Tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// When set, the daemon discovers and caches matching resources on startup.
    #[serde(default)]
    pub discovery_query: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

fn default_coap_port() -> u16 {
    COAP_PORT
}
fn default_discovery_timeout_ms() -> u64 {
    5_000
}
fn default_subscribe_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_tick_interval_ms() -> u64 {
    500
}
fn default_automation_interval_ms() -> u64 {
    1_000
}
fn default_log_filter() -> String {
    "info".to_string()
}
fn default_observable() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coap_port: default_coap_port(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            automation_interval_ms: default_automation_interval_ms(),
            log_filter: default_log_filter(),
            discovery_query: None,
            resources: Vec::new(),
        }
    }
}

/// `automation = "one-shot" | "recurring"` on a hosted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutomationMode {
    OneShot,
    Recurring,
}

impl From<AutomationMode> for AutomationType {
    fn from(mode: AutomationMode) -> Self {
        match mode {
            AutomationMode::OneShot => AutomationType::OneShot,
            AutomationMode::Recurring => AutomationType::Recurring,
        }
    }
}

/// One `[[resources]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub uri: String,
    pub types: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default = "default_observable")]
    pub observable: bool,
    /// Opaque key/value parameters; value types are inferred.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub allowed: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub range: HashMap<String, [f64; 2]>,
    #[serde(default)]
    pub automation: Option<AutomationMode>,
}

impl ResourceConfig {
    pub fn to_definition(&self) -> Result<ResourceDefinition, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidResource {
            uri: self.uri.clone(),
            reason,
        };
        if self.types.is_empty() {
            return Err(invalid("no resource types".into()));
        }
        let mut store = AttributeStore::from_params(&self.attributes);
        for (name, values) in &self.allowed {
            let values = values.iter().map(|v| AttributeValue::parse_param(v)).collect();
            store
                .set_constraint(name, Constraint::AllowedValues(values))
                .map_err(|e| invalid(e.to_string()))?;
        }
        for (name, [min, max]) in &self.range {
            if min > max {
                return Err(invalid(format!("range of {name} is empty")));
            }
            store
                .set_constraint(
                    name,
                    Constraint::Range {
                        min: *min,
                        max: *max,
                    },
                )
                .map_err(|e| invalid(e.to_string()))?;
        }
        let mut definition = ResourceDefinition::new(self.uri.clone(), self.types[0].clone())
            .observable(self.observable)
            .with_attributes(store);
        definition.types = self.types.clone();
        definition.interfaces = self.interfaces.clone();
        Ok(definition)
    }
}

impl Config {
    pub fn from_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
            subscribe_timeout: Duration::from_millis(self.subscribe_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
        }
    }

    pub fn automation_interval(&self) -> Duration {
        Duration::from_millis(self.automation_interval_ms.max(1))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name, value })
        }
        if let Some(v) = lookup("OIC_COAP_PORT") {
            self.coap_port = parse("OIC_COAP_PORT", v)?;
        }
        if let Some(v) = lookup("OIC_DISCOVERY_TIMEOUT_MS") {
            self.discovery_timeout_ms = parse("OIC_DISCOVERY_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("OIC_SUBSCRIBE_TIMEOUT_MS") {
            self.subscribe_timeout_ms = parse("OIC_SUBSCRIBE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("OIC_LOG") {
            self.log_filter = v;
        }
        Ok(())
    }
}

/// Load config: defaults, then the first config file found (or `explicit`), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let paths = match explicit {
        Some(p) => vec![p.to_path_buf()],
        None => config_paths(),
    };
    let mut config = load_file(&paths, explicit.is_some())?.unwrap_or_default();
    config.apply_env(|name| std::env::var(name).ok())?;
    Ok(config)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/oic/config.toml"));
    }
    out.push(PathBuf::from("/etc/oic/config.toml"));
    out
}

fn load_file(paths: &[PathBuf], required: bool) -> Result<Option<Config>, ConfigError> {
    for p in paths {
        if !required && !p.exists() {
            continue;
        }
        let text = std::fs::read_to_string(p).map_err(|source| ConfigError::Io {
            path: p.clone(),
            source,
        })?;
        return Config::from_toml(p, &text).map(Some);
    }
    Ok(None)
}
