//! Chart data assembly
//!
//! Turns a device history window and a prediction ledger into one
//! time-aligned axis with a sparse actual series and a sparse predicted
//! series, ready for a line chart. Everything here is a pure function of its
//! inputs and can be recomputed on every render.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{MetricKind, Reading};
use crate::predictor::Prediction;

/// Number of most recent readings plotted
pub const CHART_WINDOW: usize = 50;

/// Fraction of the value range added above and below the data
const AXIS_PADDING: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// Renderable series for one metric
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub metric: MetricKind,
    pub label: String,
    pub unit: String,
    /// `HH:MM:SS` tick labels
    pub labels: Vec<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub actual: Vec<Option<f64>>,
    pub predicted: Vec<Option<f64>>,
    pub actual_display: Vec<Option<String>>,
    pub predicted_display: Vec<Option<String>>,
    pub axis: AxisRange,
}

impl ChartData {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[derive(Default)]
struct Slot {
    actual: Option<f64>,
    predicted: Option<f64>,
}

/// Merge history and forecasts for `metric` into aligned series.
///
/// Only the last [`CHART_WINDOW`] readings of `history` are plotted; all
/// `predictions` are. When several readings share a timestamp the later one
/// wins.
pub fn assemble(history: &[&Reading], predictions: &[Prediction], metric: MetricKind) -> ChartData {
    let skip = history.len().saturating_sub(CHART_WINDOW);
    let mut slots: BTreeMap<DateTime<Utc>, Slot> = BTreeMap::new();

    for reading in &history[skip..] {
        slots.entry(reading.timestamp).or_default().actual = Some(metric.extract(reading));
    }
    for prediction in predictions {
        slots.entry(prediction.timestamp).or_default().predicted = Some(prediction.predicted_value);
    }

    let mut data = ChartData {
        metric,
        label: metric.profile().label.to_string(),
        unit: metric.profile().unit.to_string(),
        labels: Vec::with_capacity(slots.len()),
        timestamps: Vec::with_capacity(slots.len()),
        actual: Vec::with_capacity(slots.len()),
        predicted: Vec::with_capacity(slots.len()),
        actual_display: Vec::with_capacity(slots.len()),
        predicted_display: Vec::with_capacity(slots.len()),
        axis: AxisRange {
            min: 0.0,
            max: 0.0,
            step: metric.axis_step(),
        },
    };

    for (timestamp, slot) in slots {
        let actual = slot.actual.map(|v| metric.round(v));
        let predicted = slot.predicted.map(|v| metric.round(v));

        data.labels.push(timestamp.format("%H:%M:%S").to_string());
        data.timestamps.push(timestamp);
        data.actual_display.push(actual.map(|v| metric.format(v)));
        data.predicted_display.push(predicted.map(|v| metric.format(v)));
        data.actual.push(actual);
        data.predicted.push(predicted);
    }

    let values: Vec<f64> = data
        .actual
        .iter()
        .chain(data.predicted.iter())
        .flatten()
        .copied()
        .collect();
    data.axis = axis_range(metric, &values);

    data
}

/// Y axis bounds for a set of plotted values
pub fn axis_range(metric: MetricKind, values: &[f64]) -> AxisRange {
    let step = metric.axis_step();

    if metric.is_boolean() {
        return AxisRange { min: 0.0, max: 1.0, step };
    }
    if values.is_empty() {
        return AxisRange { min: 0.0, max: 100.0, step };
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut padding = (max - min) * AXIS_PADDING;
    if padding <= 0.0 {
        padding = max.abs() * AXIS_PADDING;
    }
    if padding <= 0.0 {
        padding = step;
    }

    AxisRange {
        min: (min - padding).max(0.0),
        max: max + padding,
        step,
    }
}
