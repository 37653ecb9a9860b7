//! Balancer configuration.
//!
//! Configuration is read once at startup from a YAML file and can be
//! adjusted by environment variables / CLI flags (port, log level).
//! There is no live reload.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::error::BalancerError;

/// Default listening port.
pub const DEFAULT_PROXY_PORT: &str = "8080";

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Directories searched for a relative config file name, in order.
pub const CONFIG_SEARCH_PATHS: [&str; 5] = [
    "",
    "./config/",
    "../config/",
    "../../config/",
    "../../../config/",
];

/// Upper bound of every configured duration, in seconds.
pub const MAX_DURATION_SECS: u64 = 86400 * 365;

const DEFAULT_MAX_COUNT_CONNECTION: u32 = 1000;
const DEFAULT_DEADLINE_SECS: u64 = 30;
const DEFAULT_COUNT_MAX_DIAL_ATTEMPTS: u32 = 30;
const DEFAULT_SIZE_COPY_BUFFER_IO: usize = 64 * 1024;
const DEFAULT_TIME_TO_EVICT_BAD_PEERS_SECS: u64 = 10;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 1000;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 5000;
const DEFAULT_BLACKLIST_CACHE_TTL_SECS: u64 = 60;
const DEFAULT_LOG_FILE_SIZE_MB: u64 = 10;

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logger: LoggerConfig,
    pub proxy: ProxyConfig,
    pub peers: Vec<PeerConfig>,
    pub rules: RulesConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Output format for stderr.
    pub format: LogFormat,
    /// Directory for the JSON log file. No file is written when unset.
    pub dir_log: Option<PathBuf>,
    /// Size cap of the log file, in megabytes.
    pub file_size_mb: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            dir_log: None,
            file_size_mb: DEFAULT_LOG_FILE_SIZE_MB,
        }
    }
}

/// Active health probing of peers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Dial timeout of a single probe.
    pub timeout_ms: u64,
    /// Pause between probes of the same peer.
    pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
        }
    }
}

impl HealthCheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Proxy data path configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Port to listen on, with or without a leading `:`.
    pub default_port: String,
    /// Session deadline for the client socket, measured from accept.
    pub client_deadline_secs: u64,
    /// Timeout for establishing a connection to a peer.
    pub peer_connection_timeout_secs: u64,
    /// Session deadline for the peer socket, measured from a successful dial.
    pub peer_host_deadline_secs: u64,
    /// How long shutdown waits for in-flight connections.
    pub shutdown_timeout_secs: u64,
    /// Maximum number of concurrently handled client connections.
    pub max_count_connection: u32,
    /// Maximum number of peer dials per client connection.
    pub count_max_dial_attempts_to_peer: u32,
    /// Chunk size of each copy direction.
    pub size_copy_buffer_io: usize,
    /// How long a peer that refused a dial is skipped.
    pub time_to_evict_not_response_peers_secs: u64,
    pub health_check: HealthCheckConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            default_port: DEFAULT_PROXY_PORT.to_string(),
            client_deadline_secs: DEFAULT_DEADLINE_SECS,
            peer_connection_timeout_secs: DEFAULT_DEADLINE_SECS,
            peer_host_deadline_secs: DEFAULT_DEADLINE_SECS,
            shutdown_timeout_secs: DEFAULT_DEADLINE_SECS,
            max_count_connection: DEFAULT_MAX_COUNT_CONNECTION,
            count_max_dial_attempts_to_peer: DEFAULT_COUNT_MAX_DIAL_ATTEMPTS,
            size_copy_buffer_io: DEFAULT_SIZE_COPY_BUFFER_IO,
            time_to_evict_not_response_peers_secs: DEFAULT_TIME_TO_EVICT_BAD_PEERS_SECS,
            health_check: HealthCheckConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn client_deadline(&self) -> Duration {
        Duration::from_secs(self.client_deadline_secs)
    }

    pub fn peer_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connection_timeout_secs)
    }

    pub fn peer_host_deadline(&self) -> Duration {
        Duration::from_secs(self.peer_host_deadline_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn time_to_evict_not_response_peers(&self) -> Duration {
        Duration::from_secs(self.time_to_evict_not_response_peers_secs)
    }

    /// Replace the port from an override (environment variable or flag).
    ///
    /// A blank override leaves the configured port in place; a bare `:`
    /// is rejected as an empty value.
    pub fn override_port(&mut self, value: &str) -> Result<(), BalancerError> {
        if value == ":" {
            return Err(BalancerError::Config("proxy port is empty".to_string()));
        }

        let trimmed = value.trim();
        if !trimmed.is_empty() {
            self.default_port = trimmed.to_string();
        }
        Ok(())
    }

    /// Parse the configured port.
    pub fn port(&self) -> Result<u16, BalancerError> {
        let port = self.default_port.trim().trim_start_matches(':').trim();
        if port.is_empty() {
            return Err(BalancerError::Config("proxy port is empty".to_string()));
        }

        port.parse().map_err(|_| {
            BalancerError::Config(format!("invalid proxy port '{}'", self.default_port))
        })
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, BalancerError> {
        Ok(SocketAddr::new(self.bind_address, self.port()?))
    }
}

fn default_proto() -> String {
    "tcp".to_string()
}

/// A configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_proto")]
    pub proto: String,
    /// `host:port`, optionally prefixed with `proto://`.
    pub uri: String,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            proto: default_proto(),
            uri: uri.into(),
        }
    }
}

/// Client admission rules.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub blacklist: Option<BlacklistConfig>,
}

/// Denied remote IPs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub remote_ip: Vec<String>,
    /// Lifetime of cached verdicts. `0` disables the verdict cache.
    pub cache_ttl_secs: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            remote_ip: Vec::new(),
            cache_ttl_secs: DEFAULT_BLACKLIST_CACHE_TTL_SECS,
        }
    }
}

impl Config {
    /// Decode a YAML document.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("invalid config YAML")
    }

    /// Locate and load a config file.
    ///
    /// Absolute paths are used as-is; relative names are searched in
    /// [`CONFIG_SEARCH_PATHS`].
    pub fn load(file_name: &Path) -> Result<Self> {
        let path = find_config_file(file_name)?;
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        Self::from_yaml_str(&contents)
            .with_context(|| format!("failed to decode config file {}", path.display()))
    }

    /// Check the startup invariants.
    pub fn validate(&self) -> Result<(), BalancerError> {
        if self.peers.is_empty() {
            return Err(BalancerError::Config("peer list is empty".to_string()));
        }

        for peer in &self.peers {
            let address = crate::peer::strip_scheme(peer.uri.trim());
            let valid = address
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(BalancerError::Config(format!(
                    "peer '{}' uri '{}' must be host:port",
                    peer.name, peer.uri
                )));
            }
        }

        self.proxy.port()?;

        if self.proxy.max_count_connection == 0 {
            return Err(BalancerError::Config(
                "max_count_connection must be greater than zero".to_string(),
            ));
        }
        if self.proxy.count_max_dial_attempts_to_peer == 0 {
            return Err(BalancerError::Config(
                "count_max_dial_attempts_to_peer must be greater than zero".to_string(),
            ));
        }
        if self.proxy.size_copy_buffer_io == 0 {
            return Err(BalancerError::Config(
                "size_copy_buffer_io must be greater than zero".to_string(),
            ));
        }

        let proxy = &self.proxy;
        for (key, secs) in [
            ("client_deadline_secs", proxy.client_deadline_secs),
            ("peer_connection_timeout_secs", proxy.peer_connection_timeout_secs),
            ("peer_host_deadline_secs", proxy.peer_host_deadline_secs),
            (
                "time_to_evict_not_response_peers_secs",
                proxy.time_to_evict_not_response_peers_secs,
            ),
        ] {
            check_range(key, secs, 1, MAX_DURATION_SECS)?;
        }
        check_range("shutdown_timeout_secs", proxy.shutdown_timeout_secs, 0, MAX_DURATION_SECS)?;

        if proxy.health_check.enabled {
            let max_ms = MAX_DURATION_SECS * 1000;
            check_range("health_check.timeout_ms", proxy.health_check.timeout_ms, 1, max_ms)?;
            check_range("health_check.interval_ms", proxy.health_check.interval_ms, 1, max_ms)?;
        }

        if let Some(blacklist) = &self.rules.blacklist {
            check_range(
                "blacklist.cache_ttl_secs",
                blacklist.cache_ttl_secs,
                0,
                MAX_DURATION_SECS,
            )?;
        }

        Ok(())
    }
}

fn check_range(key: &str, value: u64, min: u64, max: u64) -> Result<(), BalancerError> {
    if (min..=max).contains(&value) {
        return Ok(());
    }
    Err(BalancerError::Config(format!(
        "{key} must be between {min} and {max}, got {value}"
    )))
}

fn find_config_file(file_name: &Path) -> Result<PathBuf> {
    if file_name.is_absolute() {
        if file_name.is_file() {
            return Ok(file_name.to_path_buf());
        }
        bail!("path to config not found: {}", file_name.display());
    }

    CONFIG_SEARCH_PATHS
        .iter()
        .map(|dir| Path::new(dir).join(file_name))
        .find(|candidate| candidate.is_file())
        .with_context(|| format!("path to config not found: {}", file_name.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: &str = r#"
logger:
  level: debug
  format: compact
proxy:
  default_port: "18080"
  client_deadline_secs: 5
  max_count_connection: 10
  count_max_dial_attempts_to_peer: 3
  health_check:
    enabled: false
peers:
  - name: first
    uri: 127.0.0.1:9001
  - name: second
    proto: tcp
    uri: tcp://127.0.0.1:9002
rules:
  blacklist:
    remote_ip: ["10.0.0.1", "10.0.0.2"]
"#;

    #[test]
    fn test_decode_sample() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.logger.format, LogFormat::Compact);
        assert_eq!(config.proxy.port().unwrap(), 18080);
        assert_eq!(config.proxy.client_deadline(), Duration::from_secs(5));
        // Unset keys keep their defaults.
        assert_eq!(config.proxy.peer_host_deadline(), Duration::from_secs(30));
        assert_eq!(config.proxy.size_copy_buffer_io, 64 * 1024);
        assert!(!config.proxy.health_check.enabled);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].proto, "tcp");
        let blacklist = config.rules.blacklist.unwrap();
        assert_eq!(blacklist.remote_ip, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(blacklist.cache_ttl_secs, 60);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.proxy.port().unwrap(), 8080);
        assert_eq!(config.proxy.max_count_connection, 1000);
        assert_eq!(config.proxy.count_max_dial_attempts_to_peer, 30);
        assert!(config.rules.blacklist.is_none());
    }

    #[rstest]
    #[case::explicit_port("1234", "", Some(1234))]
    #[case::blank_override_keeps_default("", "", Some(8080))]
    #[case::override_from_env("", "8081", Some(8081))]
    #[case::override_with_colon("", ":9000", Some(9000))]
    #[case::bare_colon_rejected("", ":", None)]
    #[case::whitespace_keeps_default("", "          ", Some(8080))]
    fn test_port_resolution(
        #[case] configured: &str,
        #[case] override_value: &str,
        #[case] want: Option<u16>,
    ) {
        let mut proxy = ProxyConfig::default();
        if !configured.is_empty() {
            proxy.default_port = configured.to_string();
        }

        let result = proxy.override_port(override_value).and_then(|_| proxy.port());
        assert_eq!(result.ok(), want);
    }

    #[test]
    fn test_empty_configured_port_rejected() {
        let proxy = ProxyConfig {
            default_port: " : ".to_string(),
            ..ProxyConfig::default()
        };
        assert!(matches!(proxy.port(), Err(BalancerError::Config(_))));
    }

    #[test]
    fn test_validate() {
        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        assert!(config.validate().is_ok());

        config.peers.push(PeerConfig::new("broken", "127.0.0.1"));
        assert!(config.validate().is_err());

        config.peers.clear();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: peer list is empty");

        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        config.proxy.max_count_connection = 0;
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::padded_uri(|c: &mut Config| c.peers[0].uri = "  127.0.0.1:9001 \n".to_string())]
    #[case::padded_scheme_uri(|c: &mut Config| {
        c.peers[1].uri = " tcp://127.0.0.1:9002".to_string()
    })]
    #[case::zero_shutdown_timeout(|c: &mut Config| c.proxy.shutdown_timeout_secs = 0)]
    #[case::zero_cache_ttl(|c: &mut Config| {
        c.rules.blacklist.as_mut().unwrap().cache_ttl_secs = 0
    })]
    #[case::max_client_deadline(|c: &mut Config| {
        c.proxy.client_deadline_secs = MAX_DURATION_SECS
    })]
    #[case::health_disabled_ignores_interval(|c: &mut Config| {
        c.proxy.health_check.interval_ms = 0
    })]
    fn test_validate_accepts(#[case] edit: fn(&mut Config)) {
        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        edit(&mut config);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::zero_client_deadline(|c: &mut Config| c.proxy.client_deadline_secs = 0)]
    #[case::huge_client_deadline(|c: &mut Config| c.proxy.client_deadline_secs = u64::MAX)]
    #[case::zero_dial_timeout(|c: &mut Config| c.proxy.peer_connection_timeout_secs = 0)]
    #[case::huge_dial_timeout(|c: &mut Config| {
        c.proxy.peer_connection_timeout_secs = MAX_DURATION_SECS + 1
    })]
    #[case::zero_peer_deadline(|c: &mut Config| c.proxy.peer_host_deadline_secs = 0)]
    #[case::huge_peer_deadline(|c: &mut Config| c.proxy.peer_host_deadline_secs = u64::MAX)]
    #[case::huge_shutdown_timeout(|c: &mut Config| c.proxy.shutdown_timeout_secs = u64::MAX)]
    #[case::zero_bad_peer_ttl(|c: &mut Config| {
        c.proxy.time_to_evict_not_response_peers_secs = 0
    })]
    #[case::huge_bad_peer_ttl(|c: &mut Config| {
        c.proxy.time_to_evict_not_response_peers_secs = u64::MAX
    })]
    #[case::huge_cache_ttl(|c: &mut Config| {
        c.rules.blacklist.as_mut().unwrap().cache_ttl_secs = u64::MAX
    })]
    #[case::zero_health_timeout(|c: &mut Config| {
        c.proxy.health_check.enabled = true;
        c.proxy.health_check.timeout_ms = 0;
    })]
    #[case::huge_health_timeout(|c: &mut Config| {
        c.proxy.health_check.enabled = true;
        c.proxy.health_check.timeout_ms = u64::MAX;
    })]
    #[case::zero_health_interval(|c: &mut Config| {
        c.proxy.health_check.enabled = true;
        c.proxy.health_check.interval_ms = 0;
    })]
    #[case::huge_health_interval(|c: &mut Config| {
        c.proxy.health_check.enabled = true;
        c.proxy.health_check.interval_ms = u64::MAX;
    })]
    #[case::blank_uri(|c: &mut Config| c.peers[0].uri = "   ".to_string())]
    fn test_validate_rejects(#[case] edit: fn(&mut Config)) {
        let mut config = Config::from_yaml_str(SAMPLE).unwrap();
        edit(&mut config);
        assert!(matches!(config.validate(), Err(BalancerError::Config(_))));
    }

    #[test]
    fn test_load_from_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balancer.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.peers[1].uri, "tcp://127.0.0.1:9002");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("definitely-missing-vbalancer.yaml")).unwrap_err();
        assert!(err.to_string().contains("path to config not found"));
    }
}
