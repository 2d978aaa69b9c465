use anyhow::Result;
use serde::Deserialize;

/// Application configuration loaded from a TOML file or defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    /// Interval between keepalive frames pushed to subscribed user sessions.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

/// Device liveness settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Seconds an online device may stay silent before it decays to `unknown`.
    #[serde(default = "default_status_timeout")]
    pub timeout_secs: u64,

    /// Whether motion/overspeed state is evaluated when a device leaves the
    /// online state (may emit deviceStopped/deviceOverspeed events).
    #[serde(default)]
    pub update_device_state: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Auto-register devices presenting an unknown unique id. Disable for
    /// locked-down fleets.
    #[serde(default = "default_register_unknown")]
    pub register_unknown: bool,
}

/// Settings for the line-oriented TCP ingest listener.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_enabled")]
    pub enabled: bool,

    #[serde(default = "default_ingest_port")]
    pub port: u16,
}

fn default_status_timeout() -> u64 {
    600
}

fn default_register_unknown() -> bool {
    true
}

fn default_ingest_enabled() -> bool {
    true
}

fn default_ingest_port() -> u16 {
    5200
}

fn default_keepalive_interval() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            status: StatusConfig::default(),
            database: DatabaseConfig::default(),
            ingest: IngestConfig::default(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_status_timeout(),
            update_device_state: false,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            register_unknown: default_register_unknown(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: default_ingest_enabled(),
            port: default_ingest_port(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }
}
