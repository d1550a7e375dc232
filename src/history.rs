//! Bounded per-device reading history
//!
//! Keeps the most recent [`MAX_HISTORY_ENTRIES`] readings for every device in
//! timestamp order, evicting the oldest entry first.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::models::{MetricKind, Reading};

/// Maximum number of readings retained per device
pub const MAX_HISTORY_ENTRIES: usize = 100;

/// Rolling history for every known device
#[derive(Debug)]
pub struct DeviceHistoryStore {
    histories: HashMap<String, VecDeque<Reading>>,
    capacity: usize,
}

impl DeviceHistoryStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            histories: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a reading to a device history, creating it on first use.
    ///
    /// Readings with the same timestamp as the last entry are kept. A reading
    /// older than the newest entry is inserted at its timestamp position so
    /// the sequence stays ordered regardless of arrival order.
    pub fn append(&mut self, device_id: &str, reading: Reading) {
        let capacity = self.capacity;

        let history = self
            .histories
            .entry(device_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity));

        let in_order = history
            .back()
            .map(|last| reading.timestamp >= last.timestamp)
            .unwrap_or(true);

        if in_order {
            history.push_back(reading);
        } else {
            let position = history.partition_point(|r| r.timestamp <= reading.timestamp);
            debug!(
                device_id = %device_id,
                position,
                "Inserting out-of-order reading"
            );
            history.insert(position, reading);
        }

        while history.len() > capacity {
            history.pop_front();
        }
    }

    /// Ordered readings for a device (empty for unknown devices)
    pub fn get(&self, device_id: &str) -> Vec<&Reading> {
        self.histories
            .get(device_id)
            .map(|h| h.iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, device_id: &str) -> usize {
        self.histories.get(device_id).map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, device_id: &str) -> bool {
        self.len(device_id) == 0
    }

    /// Most recent reading for a device
    pub fn latest(&self, device_id: &str) -> Option<&Reading> {
        self.histories.get(device_id).and_then(|h| h.back())
    }

    /// Drop histories of devices that are no longer known.
    ///
    /// Returns the removed device ids.
    pub fn retain_devices(&mut self, known: &[String]) -> Vec<String> {
        let stale: Vec<String> = self
            .histories
            .keys()
            .filter(|id| !known.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            self.histories.remove(id);
        }
        stale
    }

    pub fn clear(&mut self, device_id: &str) {
        self.histories.remove(device_id);
    }

    /// Copy of a device history for persistence
    pub fn snapshot(&self, device_id: &str) -> Vec<Reading> {
        self.histories
            .get(device_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace a device history with persisted readings
    pub fn restore(&mut self, device_id: &str, mut readings: Vec<Reading>) {
        readings.sort_by_key(|r| r.timestamp);
        let skip = readings.len().saturating_sub(self.capacity);
        let history: VecDeque<Reading> = readings.into_iter().skip(skip).collect();
        self.histories.insert(device_id.to_string(), history);
    }

    /// Per-metric summary over the retained window
    pub fn statistics(&self, device_id: &str) -> Vec<MetricStatistics> {
        let history = self.get(device_id);
        MetricKind::ALL
            .iter()
            .filter(|m| !m.is_boolean())
            .map(|&metric| MetricStatistics::compute(metric, &history))
            .collect()
    }

    /// Average temperature and humidity per UTC day
    pub fn daily_averages(&self, device_id: &str) -> Vec<DailyAverage> {
        let mut buckets: BTreeMap<NaiveDate, (f64, f64, usize)> = BTreeMap::new();
        for reading in self.get(device_id) {
            let bucket = buckets
                .entry(reading.timestamp.date_naive())
                .or_insert((0.0, 0.0, 0));
            bucket.0 += reading.temperature;
            bucket.1 += reading.humidity;
            bucket.2 += 1;
        }

        buckets
            .into_iter()
            .map(|(day, (temp_sum, hum_sum, count))| DailyAverage {
                device_id: device_id.to_string(),
                day,
                avg_temperature: temp_sum / count as f64,
                avg_humidity: hum_sum / count as f64,
                samples: count,
            })
            .collect()
    }
}

impl Default for DeviceHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistical summary of one metric
#[derive(Debug, Clone, Serialize)]
pub struct MetricStatistics {
    pub metric: MetricKind,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl MetricStatistics {
    fn compute(metric: MetricKind, history: &[&Reading]) -> Self {
        if history.is_empty() {
            return Self {
                metric,
                count: 0,
                min: 0.0,
                max: 0.0,
                avg: 0.0,
            };
        }

        let values: Vec<f64> = history.iter().map(|r| metric.extract(r)).collect();
        let sum: f64 = values.iter().sum();

        Self {
            metric,
            count: values.len(),
            min: values.iter().copied().fold(f64::MAX, f64::min),
            max: values.iter().copied().fold(f64::MIN, f64::max),
            avg: sum / values.len() as f64,
        }
    }
}

/// Daily average of one device
#[derive(Debug, Clone, Serialize)]
pub struct DailyAverage {
    pub device_id: String,
    pub day: NaiveDate,
    pub avg_temperature: f64,
    pub avg_humidity: f64,
    pub samples: usize,
}
