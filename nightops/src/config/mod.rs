//! Site configuration for the operations daemon.
//!
//! The config file is a single JSON object describing the site, the RPC
//! whitelists, the environment aggregation rules, and (optionally) the dome
//! backend. Dynamically-named modules (`actions_module`, `dome.module`)
//! resolve through in-crate registries at load time, so an unknown name is a
//! config error rather than a runtime surprise.

use crate::sun::Site;
use serde::Deserialize;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating the site configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid configuration:\n  {}", errors.join("\n  "))]
    Invalid { errors: Vec<String> },
}

fn default_loop_delay() -> f64 {
    10.0
}

fn default_scripts_module() -> String {
    "simulated".to_string()
}

fn default_unsafe_key() -> String {
    "unsafe".to_string()
}

fn default_open_timeout() -> f64 {
    120.0
}

fn default_close_timeout() -> f64 {
    120.0
}

fn default_movement_timeout() -> f64 {
    180.0
}

fn default_heartbeat_timeout() -> f64 {
    300.0
}

fn default_heartbeat_open_timeout() -> f64 {
    120.0
}

fn default_heartbeat_close_timeout() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

fn default_grace_polls() -> u32 {
    2
}

/// Daemon configuration parsed from the site JSON file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address for the RPC surface, `host:port`.
    pub daemon: String,
    /// Name used for the daemon's log file.
    pub log_name: String,
    /// Source addresses allowed to issue control commands.
    pub control_machines: Vec<String>,
    /// Source addresses allowed to deliver pipeline notifications.
    pub pipeline_machines: Vec<String>,
    /// Registry id of the telescope action module.
    pub actions_module: String,
    /// Registry id of the operator script module (client side).
    #[serde(default = "default_scripts_module")]
    pub scripts_module: String,
    /// Seconds between operations loop ticks.
    #[serde(default = "default_loop_delay")]
    pub loop_delay: f64,
    /// Site latitude in decimal degrees, north positive.
    pub site_latitude: f64,
    /// Site longitude in decimal degrees, east positive.
    pub site_longitude: f64,
    /// Site elevation in metres.
    pub site_elevation: f64,
    /// Sun altitude (degrees) defining the start and end of the night.
    pub sun_altitude_limit: f64,
    /// Dome backend configuration; absent for dome-less sites.
    #[serde(default)]
    pub dome: Option<DomeConfig>,
    /// Base URL of the environment daemon.
    pub environment_daemon: String,
    /// Consecutive failed environment polls tolerated before the aggregate
    /// safe flag is forced false.
    #[serde(default = "default_grace_polls")]
    pub environment_grace_polls: u32,
    /// Condition groups folded into the aggregate safety verdict.
    pub environment_conditions: Vec<ConditionConfig>,
}

/// Dome backend configuration block.
///
/// The timeout keys are common to every backend; anything else is collected
/// into `backend` and interpreted by the registered constructor.
#[derive(Clone, Debug, Deserialize)]
pub struct DomeConfig {
    /// Registry id of the dome backend.
    pub module: String,
    /// Seconds allowed for an open command to complete.
    #[serde(default = "default_open_timeout")]
    pub open_timeout: f64,
    /// Seconds allowed for a close command to complete.
    #[serde(default = "default_close_timeout")]
    pub close_timeout: f64,
    /// Seconds the dome may report Moving before the controller errors.
    #[serde(default = "default_movement_timeout")]
    pub movement_timeout: f64,
    /// Heartbeat timeout while the dome is in transit.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: f64,
    /// Heartbeat timeout while the intent is to keep the dome open.
    #[serde(default = "default_heartbeat_open_timeout")]
    pub heartbeat_open_timeout: f64,
    /// Heartbeat timeout while the intent is to keep the dome closed.
    #[serde(default = "default_heartbeat_close_timeout")]
    pub heartbeat_close_timeout: f64,
    /// Whether the open window survives a weather alert. When false the
    /// window is cleared on the first unsafe tick and the dome stays shut
    /// for the rest of the night.
    #[serde(default = "default_true")]
    pub reopen_after_weather_alert: bool,
    /// Backend-specific keys, passed to the registered constructor.
    #[serde(flatten)]
    pub backend: serde_json::Map<String, Value>,
}

/// A named group of sensors contributing one safety verdict.
#[derive(Clone, Debug, Deserialize)]
pub struct ConditionConfig {
    pub label: String,
    pub sensors: Vec<SensorConfig>,
}

/// One sensor parameter within a condition.
#[derive(Clone, Debug, Deserialize)]
pub struct SensorConfig {
    /// Display label for status output.
    pub label: String,
    /// Key of the reporting daemon in the environment data dictionary.
    pub sensor: String,
    /// Parameter key under the sensor's `parameters` block.
    pub parameter: String,
    /// Key of the boolean unsafe flag within the parameter block.
    #[serde(default = "default_unsafe_key")]
    pub unsafe_key: String,
    /// Sensor reporting cadence in seconds, used to derive the max age.
    #[serde(default)]
    pub cadence: Option<f64>,
    /// Explicit max age in seconds, overriding the cadence-derived value.
    #[serde(default)]
    pub max_age: Option<f64>,
}

impl SensorConfig {
    /// Maximum age before a reading is considered stale: the explicit
    /// `max_age`, else three reporting cadences, else 30 seconds.
    pub fn max_age(&self) -> Duration {
        let secs = self
            .max_age
            .or(self.cadence.map(|c| 3.0 * c))
            .unwrap_or(30.0);
        Duration::from_secs_f64(secs)
    }
}

impl Config {
    /// Loads and validates the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a config object from already-loaded JSON and validates it.
    pub fn from_json(json: Value) -> Result<Self, ConfigError> {
        let config: Config =
            serde_json::from_value(json).map_err(|source| ConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the fields that serde cannot: address syntax, registry ids,
    /// and value ranges. Collects every problem rather than stopping at the
    /// first so the operator can fix the file in one pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.daemon.parse::<SocketAddr>().is_err() {
            errors.push(format!("daemon: '{}' is not a host:port address", self.daemon));
        }
        for machine in self.control_machines.iter().chain(&self.pipeline_machines) {
            if machine.parse::<IpAddr>().is_err() {
                errors.push(format!("'{machine}' is not a valid IP address"));
            }
        }
        if !(self.loop_delay > 0.0) {
            errors.push("loop_delay: must be greater than zero".to_string());
        }
        if !(-90.0..=90.0).contains(&self.site_latitude) {
            errors.push("site_latitude: must be between -90 and 90".to_string());
        }
        if !(-180.0..=180.0).contains(&self.site_longitude) {
            errors.push("site_longitude: must be between -180 and 180".to_string());
        }
        if crate::telescope::actions::lookup_module(&self.actions_module).is_none() {
            errors.push(format!(
                "actions_module: '{}' is not a registered action module",
                self.actions_module
            ));
        }
        if let Some(dome) = &self.dome {
            if crate::dome::interface::lookup_backend(&dome.module).is_none() {
                errors.push(format!(
                    "dome: module '{}' is not a registered dome backend",
                    dome.module
                ));
            }
            for (key, value) in [
                ("open_timeout", dome.open_timeout),
                ("close_timeout", dome.close_timeout),
                ("movement_timeout", dome.movement_timeout),
                ("heartbeat_timeout", dome.heartbeat_timeout),
                ("heartbeat_open_timeout", dome.heartbeat_open_timeout),
                ("heartbeat_close_timeout", dome.heartbeat_close_timeout),
            ] {
                if !(value > 0.0) {
                    errors.push(format!("dome: {key} must be greater than zero"));
                }
            }
        }
        if reqwest::Url::parse(&self.environment_daemon).is_err() {
            errors.push(format!(
                "environment_daemon: '{}' is not a valid URL",
                self.environment_daemon
            ));
        }
        for condition in &self.environment_conditions {
            if condition.label.is_empty() {
                errors.push("environment_conditions: condition label must not be empty".to_string());
            }
            if condition.sensors.is_empty() {
                errors.push(format!(
                    "environment_conditions: '{}' has no sensors",
                    condition.label
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }

    /// Site coordinates for night and pointing calculations.
    pub fn site(&self) -> Site {
        Site {
            latitude: self.site_latitude,
            longitude: self.site_longitude,
            elevation: self.site_elevation,
        }
    }

    /// Parsed control whitelist. Invalid entries were rejected at load.
    pub fn control_ips(&self) -> Vec<IpAddr> {
        self.control_machines
            .iter()
            .filter_map(|machine| machine.parse().ok())
            .collect()
    }

    /// Parsed pipeline whitelist. Invalid entries were rejected at load.
    pub fn pipeline_ips(&self) -> Vec<IpAddr> {
        self.pipeline_machines
            .iter()
            .filter_map(|machine| machine.parse().ok())
            .collect()
    }

    /// Tick period of the operations loop.
    pub fn loop_delay(&self) -> Duration {
        Duration::from_secs_f64(self.loop_delay)
    }
}
