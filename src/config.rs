//! TOML configuration: `[server]`, `[gps]`, `[ntp]`, `[security]`,
//! `[logging]`, `[webserver]`. Every optional field carries a serde default
//! so a hand-edited config only needs to state what it wants to change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub gps: GpsConfig,

    #[serde(default)]
    pub ntp: NtpConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub webserver: WebServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Listen address for the SNTP socket, e.g. "0.0.0.0:123".
    pub bind_address: String,

    /// Advertised precision in log2 seconds (e.g. -20 is about 1µs), used
    /// only in the wire reply's precision field.
    #[serde(default = "default_precision")]
    pub precision: i8,

    /// Recommended poll interval in log2 seconds, echoed into replies.
    #[serde(default = "default_poll")]
    pub poll_interval: i8,

    /// Clock disciplinarian precision in milliseconds: the hysteresis unit
    /// for the synchronized/unsynchronized thresholds (precision /
    /// 50×precision). Unrelated to the wire `precision` byte above.
    #[serde(default = "default_precision_ms")]
    pub precision_ms: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Serial device, e.g. "/dev/ttyUSB0" or "COM9".
    pub serial_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Fixed serial/processing latency credited against each GPS fix,
    /// in milliseconds.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: i32,

    /// Use the burst wake-up time rather than each sentence's individual
    /// back-computed arrival time as the synchronize sample.
    #[serde(default)]
    pub burst_mode: bool,

    /// Omit latitude/longitude from the decoded fix and its telemetry.
    #[serde(default)]
    pub privacy: bool,

    #[serde(default = "default_min_satellites")]
    pub min_satellites: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NtpConfig {
    /// Seconds between periodic broadcasts; floored to 10 at runtime.
    #[serde(default = "default_broadcast_period")]
    pub broadcast_period_secs: u64,

    /// Broadcast even while unsynchronized to GPS and serving only from the
    /// upstream pool.
    #[serde(default)]
    pub broadcast_without_gps: bool,
}

impl Default for NtpConfig {
    fn default() -> Self {
        NtpConfig {
            broadcast_period_secs: default_broadcast_period(),
            broadcast_without_gps: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub enable_rate_limiting: bool,

    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,

    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    #[serde(default)]
    pub ip_blacklist: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            enable_rate_limiting: true,
            max_requests_per_second: default_max_requests_per_second(),
            ip_whitelist: vec![],
            ip_blacklist: vec![],
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub log_requests: bool,

    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_requests: false,
            log_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebServerConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,

    #[serde(default = "default_web_bind_address")]
    pub bind_address: String,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        WebServerConfig {
            port: default_web_port(),
            bind_address: default_web_bind_address(),
        }
    }
}

fn default_precision() -> i8 {
    -20
}
fn default_precision_ms() -> i64 {
    10
}
fn default_poll() -> i8 {
    6
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_latency_ms() -> i32 {
    70
}
fn default_min_satellites() -> u32 {
    4
}
fn default_broadcast_period() -> u64 {
    64
}
fn default_true() -> bool {
    true
}
fn default_max_requests_per_second() -> u32 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_web_port() -> u16 {
    8080
}
fn default_web_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                bind_address: "0.0.0.0:123".to_string(),
                precision: default_precision(),
                poll_interval: default_poll(),
                precision_ms: default_precision_ms(),
            },
            gps: GpsConfig {
                enabled: true,
                serial_port: default_serial_port(),
                baud_rate: default_baud_rate(),
                latency_ms: default_latency_ms(),
                burst_mode: false,
                privacy: false,
                min_satellites: default_min_satellites(),
            },
            ntp: NtpConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
            webserver: WebServerConfig::default(),
        }
    }
}

#[cfg(target_os = "windows")]
fn default_serial_port() -> String {
    "COM9".to_string()
}

#[cfg(not(target_os = "windows"))]
fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path.as_ref(), content).context("Failed to write config file")?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.gps.enabled && self.gps.serial_port.trim().is_empty() {
            anyhow::bail!("GPS is enabled but no serial_port was configured");
        }
        if self.ntp.broadcast_period_secs < crate::sntp::MIN_BROADCAST_PERIOD_SECS {
            tracing::warn!(
                configured = self.ntp.broadcast_period_secs,
                floor = crate::sntp::MIN_BROADCAST_PERIOD_SECS,
                "broadcast_period_secs below the floor, will be clamped at runtime"
            );
        }
        Ok(())
    }

    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let example_config = Config {
            logging: LoggingConfig {
                level: "info".to_string(),
                log_requests: true,
                log_file: Some(default_log_file()),
            },
            ..Config::default()
        };
        example_config.to_file(path)
    }
}

#[cfg(target_os = "windows")]
fn default_log_file() -> String {
    "pendulum.log".to_string()
}

#[cfg(not(target_os = "windows"))]
fn default_log_file() -> String {
    "/var/log/pendulum.log".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bind_address_and_gps_on() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:123");
        assert!(config.gps.enabled);
    }

    #[test]
    fn validation_rejects_empty_serial_port_when_gps_enabled() {
        let mut config = Config::default();
        config.gps.serial_port = "".to_string();
        assert!(config.validate().is_err());

        config.gps.enabled = false;
        assert!(config.validate().is_ok());
    }
}
