//! Dashboard session state
//!
//! Owns the per-device histories, the prediction ledgers, visibility flags
//! and device selection, and writes every change through to the injected
//! [`Store`]. Shared between the poller, the REST handlers and WebSocket
//! sessions behind a [`tokio::sync::RwLock`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::chart::{self, ChartData};
use crate::history::DeviceHistoryStore;
use crate::models::{DashboardUpdate, MetricKind, Reading};
use crate::predictor::{ObserveSummary, Prediction, TrendPredictor};
use crate::store::{
    self, history_key, predictions_key, Store, StoreError, KEY_DEVICES, KEY_SELECTED_DEVICE,
    KEY_VISIBILITY,
};
use crate::visibility::VisibilityState;

pub type SharedDashboard = Arc<RwLock<Dashboard>>;

/// Forecast ledger of one `(device, metric)` pair with its accuracy
#[derive(Debug, Clone, Serialize)]
pub struct PredictionReport {
    pub device_id: String,
    pub metric: MetricKind,
    pub predictions: Vec<Prediction>,
    pub open: Option<Prediction>,
    pub mean_absolute_error: Option<f64>,
}

pub struct Dashboard {
    history: DeviceHistoryStore,
    predictor: TrendPredictor,
    visibility: VisibilityState,
    devices: Vec<String>,
    selected_device: Option<String>,
    store: Arc<dyn Store>,
    start_time: DateTime<Utc>,
    revision: u64,
    session_expired: bool,
    last_poll: Option<DateTime<Utc>>,
    connected_clients: Vec<String>,
}

impl Dashboard {
    /// Build the dashboard, restoring whatever the store holds
    pub fn new(store: Arc<dyn Store>, lookahead: Duration) -> Self {
        info!("Initializing dashboard state");

        let mut dashboard = Self {
            history: DeviceHistoryStore::new(),
            predictor: TrendPredictor::new(lookahead),
            visibility: VisibilityState::new(),
            devices: Vec::new(),
            selected_device: None,
            store,
            start_time: Utc::now(),
            revision: 0,
            session_expired: false,
            last_poll: None,
            connected_clients: Vec::new(),
        };
        dashboard.restore();
        dashboard
    }

    pub fn shared(self) -> SharedDashboard {
        Arc::new(RwLock::new(self))
    }

    fn restore(&mut self) {
        self.devices = self.load_or_log(KEY_DEVICES).unwrap_or_default();
        self.selected_device = self
            .load_or_log::<Option<String>>(KEY_SELECTED_DEVICE)
            .flatten();
        self.visibility = self.load_or_log(KEY_VISIBILITY).unwrap_or_default();

        for device_id in self.devices.clone() {
            if let Some(readings) = self.load_or_log::<Vec<Reading>>(&history_key(&device_id)) {
                self.history.restore(&device_id, readings);
            }
            for metric in TrendPredictor::metrics() {
                let key = predictions_key(&device_id, metric.key());
                if let Some(ledger) = self.load_or_log::<Vec<Prediction>>(&key) {
                    self.predictor.restore_ledger(&device_id, metric, ledger);
                }
            }
        }

        if self
            .selected_device
            .as_ref()
            .map(|d| !self.devices.contains(d))
            .unwrap_or(false)
        {
            self.selected_device = None;
        }

        info!(
            devices = self.devices.len(),
            selected = ?self.selected_device,
            "Restored persisted dashboard state"
        );
    }

    fn load_or_log<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match store::load(self.store.as_ref(), key) {
            Ok(value) => value,
            Err(StoreError::VersionMismatch { found, expected }) => {
                warn!(key = %key, found, expected, "Ignoring persisted value with unknown version");
                None
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to load persisted value");
                None
            }
        }
    }

    fn persist<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = store::save(self.store.as_ref(), key, value) {
            error!(key = %key, error = %e, "Failed to persist dashboard state");
        }
    }

    fn persist_device(&self, device_id: &str) {
        self.persist(&history_key(device_id), &self.history.snapshot(device_id));
        for metric in TrendPredictor::metrics() {
            self.persist(
                &predictions_key(device_id, metric.key()),
                &self.predictor.ledger(device_id, metric),
            );
        }
    }

    fn forget_device(&self, device_id: &str) -> Result<(), StoreError> {
        self.store.delete(&history_key(device_id))?;
        for metric in TrendPredictor::metrics() {
            self.store.delete(&predictions_key(device_id, metric.key()))?;
        }
        Ok(())
    }

    /// Replace the known device list.
    ///
    /// Visibility, histories and ledgers of devices that disappeared are
    /// dropped, and the selection falls back to the first device.
    pub fn set_devices(&mut self, devices: Vec<String>) {
        let mut unique: Vec<String> = Vec::with_capacity(devices.len());
        for device in devices {
            if !device.is_empty() && !unique.contains(&device) {
                unique.push(device);
            }
        }

        let stale: Vec<String> = self
            .devices
            .iter()
            .filter(|d| !unique.contains(d))
            .cloned()
            .collect();

        self.devices = unique;
        self.visibility.reconcile(&self.devices);
        let mut removed = self.history.retain_devices(&self.devices);
        self.predictor.retain_devices(&self.devices);

        removed.extend(stale);
        removed.sort();
        removed.dedup();
        for device_id in &removed {
            if let Err(e) = self.forget_device(device_id) {
                error!(device_id = %device_id, error = %e, "Failed to delete device state");
            }
        }

        let selection_valid = self
            .selected_device
            .as_ref()
            .map(|d| self.devices.contains(d))
            .unwrap_or(false);
        if !selection_valid {
            self.selected_device = self.devices.first().cloned();
        }

        self.persist(KEY_DEVICES, &self.devices);
        self.persist(KEY_VISIBILITY, &self.visibility);
        self.persist(KEY_SELECTED_DEVICE, &self.selected_device);
        self.revision += 1;

        info!(
            devices = self.devices.len(),
            removed = removed.len(),
            "Device list updated"
        );
    }

    pub fn is_known(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| d == device_id)
    }

    /// Whether `reading` carries the timestamp of the newest stored reading
    pub fn is_latest(&self, device_id: &str, reading: &Reading) -> bool {
        self.history
            .latest(device_id)
            .map(|r| r.timestamp == reading.timestamp)
            .unwrap_or(false)
    }

    /// Store one reading and fold it into the prediction ledgers
    pub fn ingest(&mut self, device_id: &str, mut reading: Reading) -> ObserveSummary {
        if reading.device_id != device_id {
            reading.device_id = device_id.to_string();
        }

        self.history.append(device_id, reading.clone());
        let window = self.history.get(device_id);
        let summary = self.predictor.observe(device_id, &reading, &window);

        self.persist_device(device_id);
        self.revision += 1;

        debug!(
            device_id = %device_id,
            timestamp = %reading.timestamp,
            revision = self.revision,
            "Reading ingested"
        );

        summary
    }

    /// Apply the readings gathered by one poll cycle in timestamp order
    pub fn apply_cycle(&mut self, mut readings: Vec<Reading>, polled_at: DateTime<Utc>) {
        readings.sort_by_key(|r| r.timestamp);
        for reading in readings {
            let device_id = reading.device_id.clone();
            self.ingest(&device_id, reading);
        }
        self.last_poll = Some(polled_at);
    }

    pub fn chart(&self, device_id: &str, metric: MetricKind) -> ChartData {
        chart::assemble(
            &self.history.get(device_id),
            self.predictor.ledger(device_id, metric),
            metric,
        )
    }

    /// Charts for every visible metric of a device
    pub fn visible_charts(&self, device_id: &str) -> Vec<ChartData> {
        let history = self.history.get(device_id);
        self.visibility
            .visible_metrics(device_id)
            .into_iter()
            .map(|metric| chart::assemble(&history, self.predictor.ledger(device_id, metric), metric))
            .collect()
    }

    pub fn predictions(&self, device_id: &str, metric: MetricKind) -> PredictionReport {
        PredictionReport {
            device_id: device_id.to_string(),
            metric,
            predictions: self.predictor.ledger(device_id, metric).to_vec(),
            open: self.predictor.open_prediction(device_id, metric).cloned(),
            mean_absolute_error: self.predictor.mean_absolute_error(device_id, metric),
        }
    }

    /// Flip a visibility flag; `None` for unknown devices
    pub fn toggle_visibility(&mut self, device_id: &str, metric: MetricKind) -> Option<bool> {
        if !self.is_known(device_id) {
            return None;
        }
        let visible = self.visibility.toggle(device_id, metric);
        self.persist(KEY_VISIBILITY, &self.visibility);
        self.revision += 1;
        Some(visible)
    }

    /// Change the selected device; `false` for unknown devices
    pub fn select_device(&mut self, device_id: &str) -> bool {
        if !self.is_known(device_id) {
            return false;
        }
        self.selected_device = Some(device_id.to_string());
        self.persist(KEY_SELECTED_DEVICE, &self.selected_device);
        self.revision += 1;
        true
    }

    /// Drop a device history and its forecasts
    pub fn clear_history(&mut self, device_id: &str) -> Result<(), StoreError> {
        self.history.clear(device_id);
        self.predictor.clear_device(device_id);
        self.revision += 1;
        info!(device_id = %device_id, "History cleared");
        self.forget_device(device_id)
    }

    /// Record that upstream rejected the session. Returns `true` the first time.
    pub fn mark_session_expired(&mut self) -> bool {
        if self.session_expired {
            return false;
        }
        self.session_expired = true;
        self.revision += 1;
        warn!("Sensor API session expired");
        true
    }

    /// Latest reading of every known device
    pub fn latest_readings(&self) -> Vec<Reading> {
        self.devices
            .iter()
            .filter_map(|d| self.history.latest(d).cloned())
            .collect()
    }

    pub fn update(&self) -> DashboardUpdate {
        DashboardUpdate {
            revision: self.revision,
            last_poll: self.last_poll,
            latest: self.latest_readings(),
        }
    }

    pub fn history(&self) -> &DeviceHistoryStore {
        &self.history
    }

    pub fn predictor(&self) -> &TrendPredictor {
        &self.predictor
    }

    pub fn visibility(&self) -> &VisibilityState {
        &self.visibility
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn selected_device(&self) -> Option<&str> {
        self.selected_device.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn session_expired(&self) -> bool {
        self.session_expired
    }

    pub fn last_poll(&self) -> Option<DateTime<Utc>> {
        self.last_poll
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.start_time).num_seconds().max(0) as u64
    }

    /// Register a WebSocket client once its session has started
    pub fn add_client(&mut self, client_id: &str) {
        if !self.connected_clients.iter().any(|id| id == client_id) {
            self.connected_clients.push(client_id.to_string());
        }
        info!(client_id = %client_id, total = self.connected_clients.len(), "WebSocket client connected");
    }

    /// Remove a WebSocket client
    pub fn remove_client(&mut self, client_id: &str) {
        self.connected_clients.retain(|id| id != client_id);
        info!(client_id = %client_id, total = self.connected_clients.len(), "WebSocket client disconnected");
    }

    pub fn client_count(&self) -> usize {
        self.connected_clients.len()
    }
}
