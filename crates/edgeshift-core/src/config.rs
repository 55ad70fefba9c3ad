//! edgeshift.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::hostname::is_valid_hostname;

/// Errors raised while loading or validating `edgeshift.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EdgeshiftConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub rollout: RolloutSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// API listen address.
    pub listen: String,
    /// Directory holding the rollout history database.
    pub data_dir: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            data_dir: PathBuf::from("/var/lib/edgeshift"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutSection {
    /// How long a candidate may take to become healthy.
    pub deploy_timeout: String,
    /// Dual-serving window before the previous instance is unpublished.
    pub grace_period: String,
    /// Drain period between unpublishing and retiring the previous instance.
    pub drain_period: String,
    /// Deadline for the proxy to acknowledge a routing table.
    pub publish_timeout: String,
    /// Rollout records kept per hostname.
    pub history_retention: usize,
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            deploy_timeout: "120s".to_string(),
            grace_period: "10s".to_string(),
            drain_period: "30s".to_string(),
            publish_timeout: "5s".to_string(),
            history_retention: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// HTTP path to probe (e.g., "/healthz").
    pub endpoint: String,
    /// Probe interval (e.g., "2s").
    pub interval: String,
    /// Timeout per probe (e.g., "1s").
    pub timeout: String,
    /// Consecutive successes before an instance is healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before an instance is unhealthy.
    pub unhealthy_threshold: u32,
    /// Upper bound for the retry backoff after transient probe errors.
    pub max_backoff: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            endpoint: "/healthz".to_string(),
            interval: "2s".to_string(),
            timeout: "1s".to_string(),
            healthy_threshold: 3,
            unhealthy_threshold: 3,
            max_backoff: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxySection {
    /// When set, routing tables are written here as JSON for the proxy to pick up.
    pub routes_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Exact hostname or single-label wildcard (`*.example.com`).
    pub server_name: String,
    /// Fallback certificate presented when no name matches.
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    #[serde(default)]
    pub versions: Vec<VersionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionConfig {
    pub version: String,
    /// Address (`ip:port`) the version listens on once started.
    pub address: String,
}

impl EdgeshiftConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EdgeshiftConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check durations, thresholds and host catalog consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("rollout.deploy_timeout", &self.rollout.deploy_timeout),
            ("rollout.grace_period", &self.rollout.grace_period),
            ("rollout.drain_period", &self.rollout.drain_period),
            ("rollout.publish_timeout", &self.rollout.publish_timeout),
            ("health.interval", &self.health.interval),
            ("health.timeout", &self.health.timeout),
            ("health.max_backoff", &self.health.max_backoff),
        ] {
            duration_field(name, value)?;
        }

        if self.health.healthy_threshold == 0 || self.health.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health thresholds must be at least 1".to_string(),
            ));
        }
        if self.rollout.history_retention == 0 {
            return Err(ConfigError::Invalid(
                "rollout.history_retention must be at least 1".to_string(),
            ));
        }
        if !self.health.endpoint.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "health.endpoint must start with '/': {}",
                self.health.endpoint
            )));
        }

        for cert in &self.certificates {
            let name = cert
                .server_name
                .strip_prefix("*.")
                .unwrap_or(&cert.server_name);
            if !is_valid_hostname(name) {
                return Err(ConfigError::Invalid(format!(
                    "malformed certificate server_name: {}",
                    cert.server_name
                )));
            }
        }

        let mut seen_hosts = HashSet::new();
        for host in &self.hosts {
            if !is_valid_hostname(&host.hostname) {
                return Err(ConfigError::Invalid(format!(
                    "malformed hostname: {}",
                    host.hostname
                )));
            }
            if !seen_hosts.insert(host.hostname.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "hostname declared twice: {}",
                    host.hostname
                )));
            }
            let mut seen_versions = HashSet::new();
            for v in &host.versions {
                if !seen_versions.insert(v.version.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "version {} declared twice for {}",
                        v.version, host.hostname
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn deploy_timeout(&self) -> Duration {
        parse_duration(&self.rollout.deploy_timeout).unwrap_or(Duration::from_secs(120))
    }

    pub fn grace_period(&self) -> Duration {
        parse_duration(&self.rollout.grace_period).unwrap_or(Duration::from_secs(10))
    }

    pub fn drain_period(&self) -> Duration {
        parse_duration(&self.rollout.drain_period).unwrap_or(Duration::from_secs(30))
    }

    pub fn publish_timeout(&self) -> Duration {
        parse_duration(&self.rollout.publish_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn probe_interval(&self) -> Duration {
        parse_duration(&self.health.interval).unwrap_or(Duration::from_secs(2))
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.health.timeout).unwrap_or(Duration::from_secs(1))
    }

    pub fn max_backoff(&self) -> Duration {
        parse_duration(&self.health.max_backoff).unwrap_or(Duration::from_secs(30))
    }
}

fn duration_field(name: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value)
        .ok_or_else(|| ConfigError::Invalid(format!("{name}: not a duration: {value:?}")))
}
