//! Data models for sensor readings and dashboard metrics
//!
//! Defines the reading wire format shared with the upstream sensor API, the
//! closed set of metrics the dashboard understands and the derived air
//! quality score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use validator::Validate;

/// One timestamped sample of every metric reported by a device.
///
/// Field names on the wire follow the upstream table (`ts`, `device`, `temp`).
/// Numeric fields that are missing, null or malformed decode to `0.0` so a
/// partially broken row still reaches the charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Instant the sample was taken; the source of truth for ordering
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// Opaque sensor identifier (a MAC address for the reference fleet)
    #[serde(rename = "device", default)]
    pub device_id: String,

    /// Temperature in Celsius
    #[serde(rename = "temp", default, deserialize_with = "lenient_f64")]
    pub temperature: f64,

    /// Relative humidity in percent
    #[serde(default, deserialize_with = "lenient_f64")]
    pub humidity: f64,

    /// Carbon monoxide concentration (ppm fraction)
    #[serde(default, deserialize_with = "lenient_f64")]
    pub co: f64,

    /// Liquefied petroleum gas concentration (ppm fraction)
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lpg: f64,

    /// Smoke concentration (ppm fraction); any positive value counts as smoke present
    #[serde(default, deserialize_with = "lenient_f64")]
    pub smoke: f64,

    #[serde(default, deserialize_with = "lenient_bool")]
    pub light: bool,

    #[serde(default, deserialize_with = "lenient_bool")]
    pub motion: bool,
}

impl Reading {
    /// Create a reading with every metric zeroed
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            device_id: device_id.into(),
            temperature: 0.0,
            humidity: 0.0,
            co: 0.0,
            lpg: 0.0,
            smoke: 0.0,
            light: false,
            motion: false,
        }
    }

    /// Derived 0-100 air quality score for this reading
    pub fn air_quality(&self) -> f64 {
        air_quality_index(self.co, self.lpg, self.smoke)
    }

    /// Decode an upstream "current reading" payload.
    ///
    /// The upstream answers `{}` when a device has no rows yet, which maps to `None`.
    pub fn from_payload(payload: Value) -> Result<Option<Self>, serde_json::Error> {
        let empty = match &payload {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            return Ok(None);
        }
        serde_json::from_value(payload).map(Some)
    }
}

/// Air quality score in `[0, 100]` computed from gas concentrations.
///
/// `100 - (co * 10000 + lpg * 10000 + (smoke present ? 50 : 0)) / 100`, clamped.
pub fn air_quality_index(co: f64, lpg: f64, smoke: f64) -> f64 {
    let smoke_penalty = if smoke > 0.0 { 50.0 } else { 0.0 };
    let score = 100.0 - (co * 10_000.0 + lpg * 10_000.0 + smoke_penalty) / 100.0;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Some(Value::Bool(b)) => {
            if b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .unwrap_or(0.0),
        _ => 0.0,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "on"),
        _ => false,
    })
}

/// Every metric the dashboard can chart.
///
/// `AirQuality` is virtual: it is derived from `co`, `lpg` and `smoke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricKind {
    #[serde(rename = "temp")]
    Temperature,
    #[serde(rename = "humidity")]
    Humidity,
    #[serde(rename = "co")]
    Co,
    #[serde(rename = "lpg")]
    Lpg,
    #[serde(rename = "smoke")]
    Smoke,
    #[serde(rename = "light")]
    Light,
    #[serde(rename = "motion")]
    Motion,
    #[serde(rename = "airQuality")]
    AirQuality,
}

/// Per-metric presentation and prediction profile
#[derive(Debug)]
pub struct MetricProfile {
    pub key: &'static str,
    pub label: &'static str,
    pub unit: &'static str,
    pub decimals: usize,
    pub axis_step: f64,
    /// `(on, off)` display labels for boolean metrics
    pub boolean_labels: Option<(&'static str, &'static str)>,
    pub predictable: bool,
}

static TEMPERATURE: MetricProfile = MetricProfile {
    key: "temp",
    label: "Temperatura",
    unit: "°C",
    decimals: 2,
    axis_step: 0.1,
    boolean_labels: None,
    predictable: true,
};

static HUMIDITY: MetricProfile = MetricProfile {
    key: "humidity",
    label: "Humedad",
    unit: "%",
    decimals: 1,
    axis_step: 0.1,
    boolean_labels: None,
    predictable: true,
};

static CO: MetricProfile = MetricProfile {
    key: "co",
    label: "CO",
    unit: "ppm",
    decimals: 6,
    axis_step: 0.00001,
    boolean_labels: None,
    predictable: true,
};

static LPG: MetricProfile = MetricProfile {
    key: "lpg",
    label: "LPG",
    unit: "ppm",
    decimals: 6,
    axis_step: 0.00001,
    boolean_labels: None,
    predictable: true,
};

static SMOKE: MetricProfile = MetricProfile {
    key: "smoke",
    label: "Humo",
    unit: "ppm",
    decimals: 6,
    axis_step: 0.00001,
    boolean_labels: None,
    predictable: true,
};

static LIGHT: MetricProfile = MetricProfile {
    key: "light",
    label: "Luz",
    unit: "",
    decimals: 0,
    axis_step: 1.0,
    boolean_labels: Some(("Encendido", "Apagado")),
    predictable: false,
};

static MOTION: MetricProfile = MetricProfile {
    key: "motion",
    label: "Movimiento",
    unit: "",
    decimals: 0,
    axis_step: 1.0,
    boolean_labels: Some(("Sí", "No")),
    predictable: false,
};

static AIR_QUALITY: MetricProfile = MetricProfile {
    key: "airQuality",
    label: "Calidad del Aire",
    unit: "%",
    decimals: 1,
    axis_step: 0.1,
    boolean_labels: None,
    predictable: true,
};

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        MetricKind::Temperature,
        MetricKind::Humidity,
        MetricKind::Co,
        MetricKind::Lpg,
        MetricKind::Smoke,
        MetricKind::Light,
        MetricKind::Motion,
        MetricKind::AirQuality,
    ];

    pub fn profile(self) -> &'static MetricProfile {
        match self {
            MetricKind::Temperature => &TEMPERATURE,
            MetricKind::Humidity => &HUMIDITY,
            MetricKind::Co => &CO,
            MetricKind::Lpg => &LPG,
            MetricKind::Smoke => &SMOKE,
            MetricKind::Light => &LIGHT,
            MetricKind::Motion => &MOTION,
            MetricKind::AirQuality => &AIR_QUALITY,
        }
    }

    pub fn key(self) -> &'static str {
        self.profile().key
    }

    pub fn is_boolean(self) -> bool {
        self.profile().boolean_labels.is_some()
    }

    pub fn is_predictable(self) -> bool {
        self.profile().predictable
    }

    pub fn decimals(self) -> usize {
        self.profile().decimals
    }

    pub fn axis_step(self) -> f64 {
        self.profile().axis_step
    }

    /// Numeric value of this metric for a reading (booleans map to 0/1)
    pub fn extract(self, reading: &Reading) -> f64 {
        match self {
            MetricKind::Temperature => reading.temperature,
            MetricKind::Humidity => reading.humidity,
            MetricKind::Co => reading.co,
            MetricKind::Lpg => reading.lpg,
            MetricKind::Smoke => reading.smoke,
            MetricKind::Light => bool_value(reading.light),
            MetricKind::Motion => bool_value(reading.motion),
            MetricKind::AirQuality => reading.air_quality(),
        }
    }

    /// Round a value to the metric's display precision
    pub fn round(self, value: f64) -> f64 {
        let factor = 10f64.powi(self.decimals() as i32);
        (value * factor).round() / factor
    }

    /// Human readable value, e.g. `"21.50"` or `"Encendido"`
    pub fn format(self, value: f64) -> String {
        match self.profile().boolean_labels {
            Some((on, off)) => {
                if value >= 0.5 {
                    on.to_string()
                } else {
                    off.to_string()
                }
            }
            None => format!("{:.*}", self.decimals(), value),
        }
    }
}

fn bool_value(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown metric: {0}. Valid metrics: temp, humidity, co, lpg, smoke, light, motion, airQuality")]
pub struct UnknownMetric(pub String);

impl FromStr for MetricKind {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "temp" | "temperature" => Ok(MetricKind::Temperature),
            "humidity" => Ok(MetricKind::Humidity),
            "co" => Ok(MetricKind::Co),
            "lpg" => Ok(MetricKind::Lpg),
            "smoke" => Ok(MetricKind::Smoke),
            "light" => Ok(MetricKind::Light),
            "motion" => Ok(MetricKind::Motion),
            "airquality" | "air_quality" | "air-quality" => Ok(MetricKind::AirQuality),
            _ => Err(UnknownMetric(s.to_string())),
        }
    }
}

/// Input DTO for manually ingested readings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReadingInput {
    #[serde(rename = "temp")]
    #[validate(range(min = -40.0, max = 85.0, message = "Temperature must be between -40 and 85°C"))]
    pub temperature: f64,

    #[validate(range(min = 0.0, max = 100.0, message = "Humidity must be between 0 and 100%"))]
    pub humidity: f64,

    #[validate(range(min = 0.0, max = 1.0, message = "CO must be between 0 and 1"))]
    pub co: f64,

    #[validate(range(min = 0.0, max = 1.0, message = "LPG must be between 0 and 1"))]
    pub lpg: f64,

    #[validate(range(min = 0.0, max = 1.0, message = "Smoke must be between 0 and 1"))]
    pub smoke: f64,

    #[serde(default)]
    pub light: bool,

    #[serde(default)]
    pub motion: bool,

    /// Optional client-provided timestamp (defaults to server time)
    #[serde(rename = "ts", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ReadingInput {
    pub fn into_reading(self, device_id: &str) -> Reading {
        Reading {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            device_id: device_id.to_string(),
            temperature: self.temperature,
            humidity: self.humidity,
            co: self.co,
            lpg: self.lpg,
            smoke: self.smoke,
            light: self.light,
            motion: self.motion,
        }
    }
}

/// Snapshot pushed to WebSocket clients whenever the dashboard changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardUpdate {
    pub revision: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub latest: Vec<Reading>,
}

/// WebSocket message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    /// New readings were merged into the dashboard
    DashboardUpdate(DashboardUpdate),
    /// Connection acknowledgment
    Connected { client_id: String },
    /// Upstream rejected the session token; polling has stopped
    SessionExpired { message: String },
    /// Error message
    Error { message: String },
    /// Heartbeat/ping
    Ping,
    /// Heartbeat/pong response
    Pong,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub session_expired: bool,
    pub device_count: usize,
    pub connected_clients: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_air_quality_formula() {
        let score = air_quality_index(0.001, 0.0005, 0.0);
        assert!((score - 99.85).abs() < 1e-9);
    }

    #[test]
    fn test_air_quality_clamps() {
        assert_eq!(air_quality_index(0.0, 0.0, 0.0), 100.0);
        assert_eq!(air_quality_index(5.0, 0.0, 0.0), 0.0);
        assert_eq!(air_quality_index(0.0, 0.0, 0.02), 99.5);
    }

    #[test]
    fn test_reading_wire_format() {
        let json = r#"{
            "ts": "2020-07-12T00:01:34.385Z",
            "device": "b8:27:eb:bf:9d:51",
            "co": 0.0049,
            "humidity": 51.0,
            "light": false,
            "lpg": 0.0076,
            "motion": false,
            "smoke": 0.0204,
            "temp": 22.7
        }"#;

        let reading: Reading = serde_json::from_str(json).unwrap();

        assert_eq!(reading.device_id, "b8:27:eb:bf:9d:51");
        assert_eq!(reading.temperature, 22.7);
        assert_eq!(reading.smoke, 0.0204);
        assert!(!reading.light);
    }

    #[test]
    fn test_malformed_values_decode_to_zero() {
        let json = r#"{
            "ts": "2024-01-01T00:00:00Z",
            "device": "x",
            "temp": null,
            "humidity": "n/a",
            "light": 1.0,
            "motion": "true"
        }"#;

        let reading: Reading = serde_json::from_str(json).unwrap();

        assert_eq!(reading.temperature, 0.0);
        assert_eq!(reading.humidity, 0.0);
        assert_eq!(reading.co, 0.0);
        assert!(reading.light);
        assert!(reading.motion);
    }

    #[test]
    fn test_empty_payload_means_no_data() {
        assert!(Reading::from_payload(serde_json::json!({})).unwrap().is_none());
        assert!(Reading::from_payload(Value::Null).unwrap().is_none());
    }

    #[test]
    fn test_metric_extract_and_format() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut reading = Reading::new("x", ts);
        reading.temperature = 21.456;
        reading.light = true;

        assert_eq!(MetricKind::Temperature.format(MetricKind::Temperature.extract(&reading)), "21.46");
        assert_eq!(MetricKind::Light.extract(&reading), 1.0);
        assert_eq!(MetricKind::Light.format(1.0), "Encendido");
        assert_eq!(MetricKind::Motion.format(0.0), "No");
        assert_eq!(MetricKind::Co.format(0.0049), "0.004900");
        assert_eq!(MetricKind::AirQuality.extract(&reading), 100.0);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("temp".parse::<MetricKind>(), Ok(MetricKind::Temperature));
        assert_eq!("airQuality".parse::<MetricKind>(), Ok(MetricKind::AirQuality));
        assert!("pressure".parse::<MetricKind>().is_err());
    }

    #[test]
    fn test_metric_serde_keys() {
        let json = serde_json::to_string(&MetricKind::AirQuality).unwrap();
        assert_eq!(json, "\"airQuality\"");
        let back: MetricKind = serde_json::from_str("\"temp\"").unwrap();
        assert_eq!(back, MetricKind::Temperature);
    }

    #[test]
    fn test_reading_input_validation() {
        let input = ReadingInput {
            temperature: 120.0,
            humidity: 50.0,
            co: 0.004,
            lpg: 0.007,
            smoke: 0.02,
            light: false,
            motion: false,
            timestamp: None,
        };

        assert!(input.validate().is_err());
    }
}
