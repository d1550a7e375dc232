//! Configuration management module
//!
//! Loads and validates environment-based configuration. Values come from the
//! process environment (optionally seeded from a `.env` file).

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value {value:?} for environment variable {var}")]
    ParseError { var: &'static str, value: String },

    #[error("Environment variable {var} must be between {min} and {max}, got {value}")]
    OutOfRange {
        var: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Longest forecast horizon, in poll intervals
pub const MAX_LOOKAHEAD_INTERVALS: u64 = 10;

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Poller configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct PollerSettings {
    /// Seconds between two poll cycles
    pub poll_interval_secs: u64,
    /// Upper bound for a single device fetch
    pub fetch_timeout_secs: u64,
    /// Forecast horizon
    pub lookahead_secs: u64,
    /// Seconds between two device list refreshes
    pub device_refresh_secs: u64,
}

impl PollerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_secs(self.lookahead_secs)
    }

    pub fn device_refresh(&self) -> Duration {
        Duration::from_secs(self.device_refresh_secs)
    }
}

/// How the session token is presented to the upstream API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `x-auth-token: <token>`
    HeaderToken,
}

/// Upstream sensor API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    /// Base URL of the sensor API; the simulator is used when absent
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub auth_scheme: AuthScheme,
}

/// Persistence settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Directory for persisted dashboard state; in-memory when absent
    pub data_dir: Option<PathBuf>,
}

/// Simulated sensor fleet settings
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorSettings {
    pub devices: Vec<String>,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub poller: PollerSettings,
    pub api: ApiSettings,
    pub storage: StorageSettings,
    pub simulator: SimulatorSettings,
}

const DEFAULT_SIMULATED_DEVICES: &str = "b8:27:eb:bf:9d:51,00:0f:00:70:91:0a,1c:bf:ce:15:ec:4d";

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port: u16 = parse_var(&lookup, "SERVER_PORT", 8080)?;
        let poll_interval_secs: u64 = parse_var(&lookup, "POLL_INTERVAL_SECS", 30)?;
        let poll_interval_secs = poll_interval_secs.max(1);
        let fetch_timeout_secs: u64 = parse_var(&lookup, "FETCH_TIMEOUT_SECS", poll_interval_secs)?;
        let lookahead_secs: u64 = parse_var(&lookup, "LOOKAHEAD_SECS", poll_interval_secs)?;
        let max_lookahead_secs = poll_interval_secs.saturating_mul(MAX_LOOKAHEAD_INTERVALS);
        if !(1..=max_lookahead_secs).contains(&lookahead_secs) {
            return Err(SettingsError::OutOfRange {
                var: "LOOKAHEAD_SECS",
                value: lookahead_secs,
                min: 1,
                max: max_lookahead_secs,
            });
        }
        let device_refresh_secs: u64 = parse_var(&lookup, "DEVICE_REFRESH_SECS", 300)?;

        let auth_scheme = match lookup("SENSOR_API_AUTH").as_deref().map(str::trim) {
            None | Some("") | Some("bearer") => AuthScheme::Bearer,
            Some("x-auth-token") => AuthScheme::HeaderToken,
            Some(other) => {
                return Err(SettingsError::ParseError {
                    var: "SENSOR_API_AUTH",
                    value: other.to_string(),
                })
            }
        };

        let simulated = lookup("SIMULATED_DEVICES").unwrap_or_else(|| DEFAULT_SIMULATED_DEVICES.into());

        Ok(Self {
            server: ServerSettings {
                host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
                port,
            },
            poller: PollerSettings {
                poll_interval_secs,
                fetch_timeout_secs: fetch_timeout_secs.max(1),
                lookahead_secs,
                device_refresh_secs: device_refresh_secs.max(1),
            },
            api: ApiSettings {
                base_url: non_empty(lookup("SENSOR_API_URL")),
                token: non_empty(lookup("SENSOR_API_TOKEN")),
                auth_scheme,
            },
            storage: StorageSettings {
                data_dir: non_empty(lookup("DATA_DIR")).map(PathBuf::from),
            },
            simulator: SimulatorSettings {
                devices: simulated
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            },
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::ParseError { var, value }),
        None => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_with(vars: &[(&str, &str)]) -> Result<Settings, SettingsError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_settings() {
        let settings = settings_with(&[]).unwrap();

        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.poller.poll_interval_secs, 30);
        assert_eq!(settings.poller.fetch_timeout_secs, 30);
        assert_eq!(settings.poller.lookahead_secs, 30);
        assert_eq!(settings.api.auth_scheme, AuthScheme::Bearer);
        assert!(settings.api.base_url.is_none());
        assert!(settings.storage.data_dir.is_none());
        assert_eq!(settings.simulator.devices.len(), 3);
    }

    #[test]
    fn test_custom_settings() {
        let settings = settings_with(&[
            ("SERVER_PORT", "3000"),
            ("POLL_INTERVAL_SECS", "10"),
            ("SENSOR_API_URL", "http://localhost:5000/api/data"),
            ("SENSOR_API_AUTH", "x-auth-token"),
            ("SIMULATED_DEVICES", "a, b,,"),
        ])
        .unwrap();

        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.poller.poll_interval(), Duration::from_secs(10));
        assert_eq!(settings.poller.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(settings.poller.lookahead(), Duration::from_secs(10));
        assert_eq!(settings.api.base_url.as_deref(), Some("http://localhost:5000/api/data"));
        assert_eq!(settings.api.auth_scheme, AuthScheme::HeaderToken);
        assert_eq!(settings.simulator.devices, vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_number_names_variable() {
        let err = settings_with(&[("SERVER_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("SERVER_PORT"));
    }

    #[test]
    fn test_lookahead_range() {
        let err = settings_with(&[("LOOKAHEAD_SECS", "0")]).unwrap_err();
        assert!(matches!(err, SettingsError::OutOfRange { var: "LOOKAHEAD_SECS", .. }));

        let err = settings_with(&[("POLL_INTERVAL_SECS", "10"), ("LOOKAHEAD_SECS", "101")]).unwrap_err();
        assert!(matches!(err, SettingsError::OutOfRange { max: 100, .. }));
        assert!(settings_with(&[("LOOKAHEAD_SECS", "18446744073709551615")]).is_err());

        let settings = settings_with(&[("POLL_INTERVAL_SECS", "10"), ("LOOKAHEAD_SECS", "100")]).unwrap();
        assert_eq!(settings.poller.lookahead(), Duration::from_secs(100));
    }

    #[test]
    fn test_invalid_auth_scheme() {
        assert!(settings_with(&[("SENSOR_API_AUTH", "basic")]).is_err());
    }
}
