//! Scan configuration.
//!
//! Settings come from, in priority order:
//! 1. Environment variables (`NETSURVEY_PORTS`, `NETSURVEY_OUTPUT`)
//! 2. Config file (`~/.config/netsurvey/config.toml`)
//! 3. Built-in defaults
//!
//! A config file may set any subset of keys; the rest keep their defaults.

use crate::scanner::ports::default_ports;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the port list (comma separated)
const ENV_PORTS: &str = "NETSURVEY_PORTS";

/// Environment variable overriding the inventory export path
const ENV_OUTPUT: &str = "NETSURVEY_OUTPUT";

/// Where the configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Using default hardcoded values
    #[default]
    Default,
    /// At least one value came from an environment variable
    Environment,
    /// Loaded from config file
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

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// How often the runner polls a step for completion
    pub poll_interval_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl PipelineSettings {
    pub fn poll_interval(&self) -> Duration {
        millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingSettings {
    pub concurrency: usize,
    pub timeout_ms: u64,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            concurrency: 100,
            timeout_ms: 1000,
        }
    }
}

impl PingSettings {
    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub concurrency: usize,
    pub timeout_ms: u64,
    /// Resolve only hosts already marked online instead of every candidate
    pub online_only: bool,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            concurrency: 20,
            timeout_ms: 2000,
            online_only: true,
        }
    }
}

impl DnsSettings {
    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortScanSettings {
    pub ports: Vec<u16>,
    pub concurrency: usize,
    pub connect_timeout_ms: u64,
    pub banner_timeout_ms: u64,
    pub max_banner_bytes: usize,
}

impl Default for PortScanSettings {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            concurrency: 100,
            connect_timeout_ms: 2000,
            banner_timeout_ms: 2000,
            max_banner_bytes: 4096,
        }
    }
}

impl PortScanSettings {
    pub fn connect_timeout(&self) -> Duration {
        millis(self.connect_timeout_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        millis(self.banner_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Ports probed with plain HTTP
    pub http_ports: Vec<u16>,
    /// Ports probed over TLS
    pub https_ports: Vec<u16>,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub max_header_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            http_ports: vec![80],
            https_ports: vec![443],
            concurrency: 20,
            timeout_ms: 3000,
            max_header_bytes: 16 * 1024,
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }

    pub fn all_ports(&self) -> Vec<u16> {
        self.http_ports
            .iter()
            .chain(self.https_ports.iter())
            .copied()
            .collect()
    }
}

/// Settings shared by the NetBIOS and MSRPC probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowsProbeSettings {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub max_response_bytes: usize,
}

impl Default for WindowsProbeSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            timeout_ms: 3000,
            max_response_bytes: 4096,
        }
    }
}

impl WindowsProbeSettings {
    pub fn timeout(&self) -> Duration {
        millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsSettings {
    /// Total listen window, split evenly across the browsed service types
    pub listen_ms: u64,
    pub service_types: Vec<String>,
}

impl Default for MdnsSettings {
    fn default() -> Self {
        Self {
            listen_ms: 5000,
            service_types: [
                "_workstation._tcp.local.",
                "_http._tcp.local.",
                "_smb._tcp.local.",
                "_ssh._tcp.local.",
                "_ipp._tcp.local.",
                "_printer._tcp.local.",
                "_airplay._tcp.local.",
                "_googlecast._tcp.local.",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl MdnsSettings {
    pub fn listen_window(&self) -> Duration {
        millis(self.listen_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Inventory export path; `None` means the default data directory
    pub path: Option<PathBuf>,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub pipeline: PipelineSettings,
    pub ping: PingSettings,
    pub dns: DnsSettings,
    pub ports: PortScanSettings,
    pub http: HttpSettings,
    pub netbios: WindowsProbeSettings,
    pub msrpc: WindowsProbeSettings,
    pub mdns: MdnsSettings,
    pub output: OutputSettings,
    #[serde(skip)]
    pub source: ConfigSource,
}

/// Get the path to the configuration file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("netsurvey").join("config.toml"))
}

/// Get the path to the config file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/netsurvey/config.toml".to_string())
}

/// Parse config file text. Missing keys keep their defaults.
pub fn parse_config(content: &str) -> Result<ScanConfig, toml::de::Error> {
    toml::from_str(content)
}

/// Load configuration from the config file
fn load_config_file() -> Option<ScanConfig> {
    let path = get_config_file_path()?;

    if !path.exists() {
        return None;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
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

/// Parse a comma separated port list such as `22,80, 443`.
pub fn parse_port_list(text: &str) -> Result<Vec<u16>, String> {
    let mut ports = Vec::new();
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let port: u16 = part
            .parse()
            .map_err(|_| format!("invalid port '{}'", part))?;
        if port == 0 {
            return Err("port 0 is not scannable".to_string());
        }
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
    Ok(ports)
}

/// Apply environment overrides on top of a loaded config.
fn apply_env_overrides(config: &mut ScanConfig) {
    if let Ok(value) = std::env::var(ENV_PORTS) {
        match parse_port_list(&value) {
            Ok(ports) => {
                tracing::info!("Using {} ports from {}", ports.len(), ENV_PORTS);
                config.ports.ports = ports;
                config.source = ConfigSource::Environment;
            }
            Err(e) => tracing::warn!("Ignoring {}: {}", ENV_PORTS, e),
        }
    }

    if let Ok(value) = std::env::var(ENV_OUTPUT) {
        let value = value.trim();
        if !value.is_empty() {
            tracing::info!("Using export path from {}: {}", ENV_OUTPUT, value);
            config.output.path = Some(PathBuf::from(value));
            config.source = ConfigSource::Environment;
        }
    }
}

/// Load scan configuration with priority:
/// 1. Environment variables
/// 2. Config file (~/.config/netsurvey/config.toml)
/// 3. Default values
pub fn load_scan_config() -> ScanConfig {
    let mut config = match load_config_file() {
        Some(mut config) => {
            config.source = ConfigSource::ConfigFile;
            config
        }
        None => {
            tracing::debug!("Using default scan configuration");
            ScanConfig::default()
        }
    };
    apply_env_overrides(&mut config);
    config
}

/// Generate example config file content
pub fn generate_example_config() -> String {
    r#"# netsurvey configuration
# Place this file at: ~/.config/netsurvey/config.toml

[pipeline]
# How often each step is polled for completion (milliseconds)
# poll_interval_ms = 1000

[ping]
# concurrency = 100
# timeout_ms = 1000

[dns]
# concurrency = 20
# timeout_ms = 2000
# Resolve only hosts that answered the ping sweep
# online_only = true

[ports]
# Default: every port in the well-known table
# ports = [21, 22, 23, 25, 53, 80, 135, 139, 443, 445, 3389, 8080]
# concurrency = 100
# connect_timeout_ms = 2000
# banner_timeout_ms = 2000
# max_banner_bytes = 4096

[http]
# http_ports = [80]
# https_ports = [443]
# concurrency = 20
# timeout_ms = 3000

[netbios]
# concurrency = 10
# timeout_ms = 3000

[msrpc]
# concurrency = 10
# timeout_ms = 3000

[mdns]
# listen_ms = 5000

[output]
# Default: <data dir>/netsurvey/Hosts.json
# path = "/var/lib/netsurvey/Hosts.json"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScanConfig::default();
        assert_eq!(config.ping.concurrency, 100);
        assert_eq!(config.dns.concurrency, 20);
        assert!(config.dns.online_only);
        assert_eq!(config.ports.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.ports.max_banner_bytes, 4096);
        assert!(config.ports.ports.contains(&445));
        assert_eq!(config.http.all_ports(), vec![80, 443]);
        assert_eq!(config.netbios.concurrency, 10);
        assert_eq!(config.pipeline.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.source, ConfigSource::Default);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            r#"
[ports]
ports = [22, 80]

[dns]
online_only = false
"#,
        )
        .unwrap();
        assert_eq!(config.ports.ports, vec![22, 80]);
        assert_eq!(config.ports.concurrency, 100);
        assert!(!config.dns.online_only);
        assert_eq!(config.http.https_ports, vec![443]);
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(&generate_example_config()).unwrap();
        assert_eq!(config.ping.timeout_ms, 1000);
    }

    #[test]
    fn test_parse_port_list() {
        assert_eq!(parse_port_list("22, 80,443,80").unwrap(), vec![22, 80, 443]);
        assert!(parse_port_list("").unwrap().is_empty());
        assert!(parse_port_list("22,http").is_err());
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("70000").is_err());
    }
}
