//! Proxy configuration
//!
//! Built once at startup from defaults, an optional TOML file and CLI
//! overrides, validated, then shared read-only with every request handler.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8081
//!
//! [upstream]
//! url = "http://localhost:8080"
//! timeout_secs = 300
//!
//! [output]
//! dir = "./traces"
//! save_combined = true
//!
//! [monitor]
//! rejection_log = "./traces/rejection_log.json"
//! poll_interval_ms = 100
//! timeout_secs = 30
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TracerError};
use crate::monitor::{DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};

/// Response header naming the persisted combined document
pub const COMBINED_DATA_HEADER: &str = "X-Combined-Data-Available";

/// Immutable configuration of the forwarding proxy
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Listen host
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Upstream inference server base URL
    pub upstream_url: String,
    /// Timeout for one upstream call
    pub upstream_timeout: Duration,
    /// Directory receiving combined documents
    pub output_dir: PathBuf,
    /// Whether combined documents are persisted
    pub save_combined: bool,
    /// Rejection log written by the decoding engine
    pub rejection_log: PathBuf,
    /// Delay between tail-monitor polls
    pub poll_interval: Duration,
    /// Tail-monitor window per request
    pub monitor_timeout: Duration,
    /// Header carrying the artifact path
    pub artifact_header: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8081,
            upstream_url: "http://localhost:8080".to_string(),
            upstream_timeout: Duration::from_secs(300),
            output_dir: PathBuf::from("./traces"),
            save_combined: true,
            rejection_log: PathBuf::from("./traces/rejection_log.json"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            monitor_timeout: DEFAULT_TIMEOUT,
            artifact_header: COMBINED_DATA_HEADER.to_string(),
        }
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// `--host`
    pub host: Option<String>,
    /// `--port`
    pub port: Option<u16>,
    /// `--upstream-url`
    pub upstream_url: Option<String>,
    /// `--output-dir`
    pub output_dir: Option<PathBuf>,
    /// `--rejection-log`
    pub rejection_log: Option<PathBuf>,
    /// `--no-save`
    pub no_save: bool,
    /// `--monitor-timeout-secs`
    pub monitor_timeout_secs: Option<u64>,
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// `MissingInput` for an absent file, `Io` when it cannot be read,
    /// `InvalidConfiguration` when it is not valid TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TracerError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| TracerError::io(format!("Failed to read config file {}", path.display()), e))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when the TOML does not parse.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content)
            .map_err(|e| TracerError::InvalidConfiguration(format!("Failed to parse TOML config: {e}")))?;
        Ok(Self::from(file))
    }

    /// Apply CLI overrides to the configuration
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(url) = overrides.upstream_url {
            self.upstream_url = url;
        }
        if let Some(dir) = overrides.output_dir {
            self.output_dir = dir;
        }
        if let Some(log) = overrides.rejection_log {
            self.rejection_log = log;
        }
        if overrides.no_save {
            self.save_combined = false;
        }
        if let Some(secs) = overrides.monitor_timeout_secs {
            self.monitor_timeout = Duration::from_secs(secs);
        }
    }

    /// Check values that would only fail later, at request time
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for a non-HTTP upstream URL or a zero poll interval.
    pub fn validate(&self) -> Result<()> {
        if !(self.upstream_url.starts_with("http://") || self.upstream_url.starts_with("https://")) {
            return Err(TracerError::InvalidConfiguration(format!(
                "upstream url must start with http:// or https://, got {}",
                self.upstream_url
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(TracerError::InvalidConfiguration(
                "monitor poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Listen address
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when host and port do not form a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| TracerError::InvalidConfiguration(format!("invalid listen address: {e}")))
    }

    /// Upstream URL for a request path and optional query string
    #[must_use]
    pub fn upstream_target(&self, path: &str, query: Option<&str>) -> String {
        let base = self.upstream_url.trim_end_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{base}{path}?{q}"),
            _ => format!("{base}{path}"),
        }
    }
}

// =============================================================================
// TOML FILE LAYOUT
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    server: ServerToml,
    #[serde(default)]
    upstream: UpstreamToml,
    #[serde(default)]
    output: OutputToml,
    #[serde(default)]
    monitor: MonitorToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ServerToml {
    host: String,
    port: u16,
}

impl Default for ServerToml {
    fn default() -> Self {
        let defaults = ProxyConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UpstreamToml {
    url: String,
    timeout_secs: u64,
}

impl Default for UpstreamToml {
    fn default() -> Self {
        let defaults = ProxyConfig::default();
        Self {
            url: defaults.upstream_url,
            timeout_secs: defaults.upstream_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct OutputToml {
    dir: PathBuf,
    save_combined: bool,
}

impl Default for OutputToml {
    fn default() -> Self {
        let defaults = ProxyConfig::default();
        Self {
            dir: defaults.output_dir,
            save_combined: defaults.save_combined,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MonitorToml {
    rejection_log: PathBuf,
    poll_interval_ms: u64,
    timeout_secs: u64,
}

impl Default for MonitorToml {
    fn default() -> Self {
        let defaults = ProxyConfig::default();
        Self {
            rejection_log: defaults.rejection_log,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            timeout_secs: defaults.monitor_timeout.as_secs(),
        }
    }
}

impl From<TomlConfig> for ProxyConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            host: toml.server.host,
            port: toml.server.port,
            upstream_url: toml.upstream.url,
            upstream_timeout: Duration::from_secs(toml.upstream.timeout_secs),
            output_dir: toml.output.dir,
            save_combined: toml.output.save_combined,
            rejection_log: toml.monitor.rejection_log,
            poll_interval: Duration::from_millis(toml.monitor.poll_interval_ms),
            monitor_timeout: Duration::from_secs(toml.monitor.timeout_secs),
            artifact_header: COMBINED_DATA_HEADER.to_string(),
        }
    }
}
