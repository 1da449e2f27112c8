//! JSON configuration file.
//!
//! The file carries store endpoints and TLS material, the read tolerance,
//! director and turbulence credentials, and optional timing knobs. Unknown
//! keys are ignored.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::cluster::DEFAULT_GATEWAY_PREFIX;

/// Errors loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for the expected shape.
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[error("Invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Key name.
        field: &'static str,
        /// What is wrong and what is expected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

fn default_instance_group() -> String {
    "etcd".to_string()
}

fn default_zones() -> Vec<String> {
    vec!["z1".to_string(), "z2".to_string(), "z3".to_string()]
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_operation_timeout_secs() -> u64 {
    10
}

fn default_hold_secs() -> u64 {
    60
}

fn default_gateway_prefix() -> String {
    DEFAULT_GATEWAY_PREFIX.to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Parsed configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// CA bundle for store TLS.
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
    /// Client certificate for store TLS.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// Client key for store TLS.
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// Store endpoints; endpoint `i` belongs to node `i`.
    pub endpoints: Vec<String>,
    /// Largest deviation accepted while the cluster should be available.
    pub read_tolerance: f64,

    /// Director CA certificate (PEM).
    #[serde(default)]
    pub director_ca: Option<String>,
    /// Director OAuth client.
    #[serde(default)]
    pub director_client: String,
    /// Director OAuth client secret.
    #[serde(default)]
    pub director_client_secret: String,
    /// Director URL.
    #[serde(default)]
    pub director_url: String,
    /// UAA URL.
    #[serde(default)]
    pub uaa_url: String,
    /// Deployment under test.
    #[serde(default)]
    pub deployment_name: String,

    /// Turbulence API host.
    #[serde(default)]
    pub turbulence_host: String,
    /// Turbulence API port.
    #[serde(default)]
    pub turbulence_port: u16,
    /// Turbulence user.
    #[serde(default)]
    pub turbulence_user: String,
    /// Turbulence password.
    #[serde(default)]
    pub turbulence_password: String,
    /// Turbulence CA certificate (PEM).
    #[serde(default)]
    pub turbulence_ca_cert: Option<String>,

    /// Instance group of the store nodes.
    #[serde(default = "default_instance_group")]
    pub instance_group: String,
    /// Zone of node `i` is `zones[i]`.
    #[serde(default = "default_zones")]
    pub zones: Vec<String>,
    /// Measurer tick period in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Per-call store timeout in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Full-partition observation window in seconds.
    #[serde(default = "default_hold_secs")]
    pub hold_secs: u64,
    /// JSON gateway API prefix.
    #[serde(default = "default_gateway_prefix")]
    pub gateway_prefix: String,
    /// Address to keep reachable through firewall blocks.
    #[serde(default)]
    pub client_ip: Option<String>,
    /// Deployment whose VM address is the client address.
    #[serde(default)]
    pub acceptance_deployment: Option<String>,
    /// SSH port of the nodes.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

impl FileConfig {
    /// Reads, parses and validates `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable, malformed or
    /// holds out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw).map_err(|error| match error {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        debug!(path = %path.display(), endpoints = config.endpoints.len(), "config loaded");
        Ok(config)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::invalid(
                "endpoints",
                "empty list. Expected at least one endpoint",
            ));
        }
        if self.zones.len() < 3 {
            return Err(ConfigError::invalid(
                "zones",
                format!("{} zones. Expected at least 3", self.zones.len()),
            ));
        }
        if self.endpoints.len() < self.zones.len() {
            return Err(ConfigError::invalid(
                "endpoints",
                format!(
                    "{} endpoints for {} zones. Expected one endpoint per zone",
                    self.endpoints.len(),
                    self.zones.len()
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.read_tolerance) {
            return Err(ConfigError::invalid(
                "read_tolerance",
                format!("{}. Expected range: 0.0..=1.0", self.read_tolerance),
            ));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "probe_interval_ms",
                "0. Expected a positive interval",
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "operation_timeout_secs",
                "0. Expected a positive timeout",
            ));
        }
        if self.hold_secs == 0 {
            return Err(ConfigError::invalid("hold_secs", "0. Expected a positive window"));
        }
        if self.deployment_name.trim().is_empty() {
            return Err(ConfigError::invalid(
                "deployment_name",
                "empty. Expected a deployment name",
            ));
        }
        Ok(())
    }

    /// Measurer tick period.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Per-call store timeout.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Full-partition observation window.
    #[must_use]
    pub fn hold(&self) -> Duration {
        Duration::from_secs(self.hold_secs)
    }

    /// Returns the three TLS paths when all are set.
    #[must_use]
    pub fn tls_paths(&self) -> Option<(&Path, &Path, &Path)> {
        Some((
            self.client_ca_path.as_deref()?,
            self.client_cert_path.as_deref()?,
            self.client_key_path.as_deref()?,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "endpoints": ["https://10.0.16.4:2379", "https://10.0.32.4:2379", "https://10.0.48.4:2379"],
        "read_tolerance": 0.05,
        "deployment_name": "etcd"
    }"#;

    fn with(key: &str, value: serde_json::Value) -> String {
        let mut doc: serde_json::Value = serde_json::from_str(MINIMAL).unwrap();
        doc[key] = value;
        doc.to_string()
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = FileConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.instance_group, "etcd");
        assert_eq!(config.zones, vec!["z1", "z2", "z3"]);
        assert_eq!(config.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.operation_timeout(), Duration::from_secs(10));
        assert_eq!(config.hold(), Duration::from_secs(60));
        assert_eq!(config.gateway_prefix, "/v3");
        assert_eq!(config.ssh_port, 22);
        assert!(config.tls_paths().is_none());
    }

    #[test]
    fn test_full_config_keys_are_read() {
        let raw = r#"{
            "client_ca_path": "/certs/ca.crt",
            "client_cert_path": "/certs/client.crt",
            "client_key_path": "/certs/client.key",
            "endpoints": ["https://a:2379", "https://b:2379", "https://c:2379"],
            "read_tolerance": 0.1,
            "director_ca": "-----BEGIN CERTIFICATE-----",
            "director_client": "ci",
            "director_client_secret": "secret",
            "director_url": "https://10.0.0.6:25555",
            "deployment_name": "etcd",
            "turbulence_host": "10.0.0.9",
            "turbulence_port": 8080,
            "turbulence_user": "turbulence",
            "turbulence_password": "pw",
            "turbulence_ca_cert": "-----BEGIN CERTIFICATE-----",
            "uaa_url": "https://10.0.0.6:8443",
            "some_future_key": true
        }"#;
        let config = FileConfig::parse(raw).unwrap();
        assert_eq!(config.director_client, "ci");
        assert_eq!(config.turbulence_port, 8080);
        let (ca, cert, key) = config.tls_paths().unwrap();
        assert_eq!(ca, Path::new("/certs/ca.crt"));
        assert_eq!(cert, Path::new("/certs/client.crt"));
        assert_eq!(key, Path::new("/certs/client.key"));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            FileConfig::parse("{ not json"),
            Err(ConfigError::Parse { .. })
        ));
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_rejects_empty_endpoints() {
        let error = FileConfig::parse(&with("endpoints", serde_json::json!([]))).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { field: "endpoints", .. }));
    }

    #[test]
    fn test_rejects_fewer_endpoints_than_zones() {
        let error =
            FileConfig::parse(&with("endpoints", serde_json::json!(["https://a:2379"]))).unwrap_err();
        let msg = error.to_string();
        assert!(msg.contains("`endpoints`"), "Expected key in: {msg}");
        assert!(msg.contains("one endpoint per zone"), "Expected reason in: {msg}");
    }

    #[test]
    fn test_rejects_tolerance_out_of_range() {
        let error = FileConfig::parse(&with("read_tolerance", serde_json::json!(1.5))).unwrap_err();
        assert!(error.to_string().contains("Expected range: 0.0..=1.0"));
    }

    #[test]
    fn test_rejects_zero_probe_interval() {
        let error = FileConfig::parse(&with("probe_interval_ms", serde_json::json!(0))).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid {
                field: "probe_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_two_zones() {
        let error = FileConfig::parse(&with("zones", serde_json::json!(["z1", "z2"]))).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { field: "zones", .. }));
    }

    #[test]
    fn test_rejects_blank_deployment() {
        let error = FileConfig::parse(&with("deployment_name", serde_json::json!(" "))).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid {
                field: "deployment_name",
                ..
            }
        ));
    }

    // ==================== Loading Tests ====================

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(config.deployment_name, "etcd");
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let error = FileConfig::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
        assert!(error.to_string().contains("/nonexistent/config.json"));
    }

    #[test]
    fn test_load_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[]").unwrap();
        let error = FileConfig::load(file.path()).unwrap_err();
        let msg = error.to_string();
        assert!(
            msg.contains(&file.path().display().to_string()),
            "Expected path in: {msg}"
        );
    }
}
