use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    pub storage: StorageConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen_addr: String,
}

/// Thresholds and TTLs for the admission gate. Defaults mirror the panel
/// deployment this replaces: 20 bad tokens per hour blacklists an IP for a
/// week; subscribe traffic is capped at 10/min per user and 30/min per IP.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u64,
    #[serde(default = "default_failed_attempt_ttl")]
    pub failed_attempt_ttl_secs: u64,
    #[serde(default = "default_blacklist_ttl")]
    pub blacklist_ttl_secs: u64,
    #[serde(default = "default_user_rate_limit")]
    pub user_rate_limit: u64,
    #[serde(default = "default_ip_rate_limit")]
    pub ip_rate_limit: u64,
    #[serde(default = "default_rate_window")]
    pub rate_window_secs: u64,
}

fn default_max_failed_attempts() -> u64 {
    20
}

fn default_failed_attempt_ttl() -> u64 {
    3600
}

fn default_blacklist_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_user_rate_limit() -> u64 {
    10
}

fn default_ip_rate_limit() -> u64 {
    30
}

fn default_rate_window() -> u64 {
    60
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: default_max_failed_attempts(),
            failed_attempt_ttl_secs: default_failed_attempt_ttl(),
            blacklist_ttl_secs: default_blacklist_ttl(),
            user_rate_limit: default_user_rate_limit(),
            ip_rate_limit: default_ip_rate_limit(),
            rate_window_secs: default_rate_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    /// Prepend informational banner entries (remaining traffic, reset
    /// countdown, expiry) to the rendered list
    #[serde(default)]
    pub show_info_banner: bool,
    /// Prefix server names with their protocol tag ([vmess], [Hy2], ...)
    #[serde(default)]
    pub show_protocol_prefix: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    pub users_file: String,
    pub servers_file: String,
    #[serde(default)]
    pub geo_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus: PrometheusConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_prometheus_enabled")]
    pub enabled: bool,
    #[serde(default = "default_prometheus_path")]
    pub path: String,
}

fn default_prometheus_enabled() -> bool {
    true
}

fn default_prometheus_path() -> String {
    "/metrics".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: default_prometheus_enabled(),
            path: default_prometheus_path(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(Error::Config(format!(
                "Invalid listen address: {}",
                self.server.listen_addr
            )));
        }

        if self.admission.max_failed_attempts == 0 {
            return Err(Error::Config(
                "admission.max_failed_attempts must be greater than 0".to_string(),
            ));
        }

        if self.admission.user_rate_limit == 0 || self.admission.ip_rate_limit == 0 {
            return Err(Error::Config(
                "admission rate limits must be greater than 0".to_string(),
            ));
        }

        if self.admission.rate_window_secs == 0 {
            return Err(Error::Config(
                "admission.rate_window_secs must be greater than 0".to_string(),
            ));
        }

        if self.data.users_file.trim().is_empty() || self.data.servers_file.trim().is_empty() {
            return Err(Error::Config(
                "data.users_file and data.servers_file must be set".to_string(),
            ));
        }

        Ok(())
    }
}
