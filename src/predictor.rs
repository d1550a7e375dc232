//! Linear trend predictor
//!
//! Forecasts the next sample of every numeric metric by extrapolating the
//! two most recent readings, keeps a ledger of emitted forecasts per
//! `(device, metric)` and fills in the observed value once a reading lands
//! on the forecast instant.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::{air_quality_index, MetricKind, Reading};

/// A reading within this distance of a forecast instant reconciles it
pub const RECONCILE_TOLERANCE_MS: i64 = 1_000;

/// Default forecast horizon, one poll interval ahead
pub const DEFAULT_LOOKAHEAD_SECS: u64 = 30;

/// One forecast for a `(device, metric)` pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Instant the forecast is for
    pub timestamp: DateTime<Utc>,
    pub predicted_value: f64,
    /// Observed value, filled in by reconciliation
    pub actual_value: Option<f64>,
}

impl Prediction {
    pub fn is_open(&self) -> bool {
        self.actual_value.is_none()
    }

    /// Absolute forecast error once reconciled
    pub fn error(&self) -> Option<f64> {
        self.actual_value.map(|a| (a - self.predicted_value).abs())
    }
}

/// Counters produced by one [`TrendPredictor::observe`] call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserveSummary {
    pub reconciled: usize,
    pub expired: usize,
    pub evicted: usize,
    pub emitted: usize,
}

/// `latest + (latest - previous)`
pub fn extrapolate(previous: f64, latest: f64) -> f64 {
    latest + (latest - previous)
}

/// Next value of `metric` from the last two readings of a window.
///
/// Returns `None` for boolean metrics and for windows shorter than two
/// readings. Air quality extrapolates its gas inputs and applies the score
/// formula to the extrapolated values.
pub fn forecast(window: &[&Reading], metric: MetricKind) -> Option<f64> {
    if !metric.is_predictable() || window.len() < 2 {
        return None;
    }

    let latest = window[window.len() - 1];
    let previous = window[window.len() - 2];

    let value = match metric {
        MetricKind::AirQuality => air_quality_index(
            extrapolate(previous.co, latest.co),
            extrapolate(previous.lpg, latest.lpg),
            extrapolate(previous.smoke, latest.smoke),
        ),
        _ => extrapolate(metric.extract(previous), metric.extract(latest)),
    };

    Some(value)
}

/// Forecast ledgers for every `(device, metric)` pair
#[derive(Debug)]
pub struct TrendPredictor {
    lookahead: Duration,
    tolerance_ms: i64,
    ledgers: HashMap<(String, MetricKind), Vec<Prediction>>,
}

impl TrendPredictor {
    pub fn new(lookahead: std::time::Duration) -> Self {
        Self {
            lookahead: Duration::from_std(lookahead)
                .unwrap_or_else(|_| Duration::seconds(DEFAULT_LOOKAHEAD_SECS as i64)),
            tolerance_ms: RECONCILE_TOLERANCE_MS,
            ledgers: HashMap::new(),
        }
    }

    /// Metrics that take part in prediction
    pub fn metrics() -> impl Iterator<Item = MetricKind> {
        MetricKind::ALL.into_iter().filter(|m| m.is_predictable())
    }

    /// Fold a newly stored reading into every ledger of its device.
    ///
    /// `window` is the device history after the reading was appended, in
    /// timestamp order.
    pub fn observe(&mut self, device_id: &str, reading: &Reading, window: &[&Reading]) -> ObserveSummary {
        let mut summary = ObserveSummary::default();
        let (oldest, newest) = match (window.first(), window.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return summary,
        };
        let tolerance = Duration::milliseconds(self.tolerance_ms);

        for metric in Self::metrics() {
            let ledger = self.ledgers.entry((device_id.to_string(), metric)).or_default();

            let actual = metric.extract(reading);
            for prediction in ledger.iter_mut().filter(|p| p.is_open()) {
                let delta_ms = (prediction.timestamp - reading.timestamp)
                    .num_milliseconds()
                    .abs();
                if delta_ms <= self.tolerance_ms {
                    prediction.actual_value = Some(actual);
                    summary.reconciled += 1;
                }
            }

            // Open forecasts whose instant passed without a matching reading
            let before = ledger.len();
            ledger.retain(|p| !(p.is_open() && p.timestamp <= newest + tolerance));
            summary.expired += before - ledger.len();

            let before = ledger.len();
            ledger.retain(|p| p.timestamp >= oldest);
            summary.evicted += before - ledger.len();

            if let Some(value) = forecast(window, metric) {
                let Some(target) = newest.checked_add_signed(self.lookahead) else {
                    warn!(device_id = %device_id, lookahead = %self.lookahead, "Forecast target out of range");
                    continue;
                };
                match ledger.iter_mut().find(|p| p.timestamp == target) {
                    Some(existing) => {
                        if existing.is_open() {
                            existing.predicted_value = value;
                        }
                    }
                    None => {
                        // Only one open forecast may exist per pair
                        ledger.retain(|p| !p.is_open());
                        ledger.push(Prediction {
                            timestamp: target,
                            predicted_value: value,
                            actual_value: None,
                        });
                        ledger.sort_by_key(|p| p.timestamp);
                        summary.emitted += 1;
                    }
                }
            }
        }

        debug!(
            device_id = %device_id,
            reconciled = summary.reconciled,
            expired = summary.expired,
            evicted = summary.evicted,
            emitted = summary.emitted,
            "Predictor observed reading"
        );

        summary
    }

    /// All retained forecasts for a pair, oldest first
    pub fn ledger(&self, device_id: &str, metric: MetricKind) -> &[Prediction] {
        self.ledgers
            .get(&(device_id.to_string(), metric))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The pending forecast for a pair, if any
    pub fn open_prediction(&self, device_id: &str, metric: MetricKind) -> Option<&Prediction> {
        self.ledger(device_id, metric).last().filter(|p| p.is_open())
    }

    /// Mean absolute error over reconciled forecasts
    pub fn mean_absolute_error(&self, device_id: &str, metric: MetricKind) -> Option<f64> {
        let errors: Vec<f64> = self
            .ledger(device_id, metric)
            .iter()
            .filter_map(Prediction::error)
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some(errors.iter().sum::<f64>() / errors.len() as f64)
    }

    /// Replace a ledger with persisted forecasts
    pub fn restore_ledger(&mut self, device_id: &str, metric: MetricKind, mut predictions: Vec<Prediction>) {
        predictions.sort_by_key(|p| p.timestamp);
        predictions.dedup_by_key(|p| p.timestamp);

        // Keep only the newest open forecast
        if let Some(last_open) = predictions.iter().rposition(|p| p.is_open()) {
            let mut index = 0;
            predictions.retain(|p| {
                let keep = !p.is_open() || index == last_open;
                index += 1;
                keep
            });
        }

        self.ledgers.insert((device_id.to_string(), metric), predictions);
    }

    pub fn clear_device(&mut self, device_id: &str) {
        self.ledgers.retain(|(id, _), _| id != device_id);
    }

    pub fn retain_devices(&mut self, known: &[String]) {
        self.ledgers.retain(|(id, _), _| known.contains(id));
    }
}

impl Default for TrendPredictor {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(DEFAULT_LOOKAHEAD_SECS))
    }
}
