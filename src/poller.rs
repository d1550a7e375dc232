//! Live poller
//!
//! Fetches the current reading of every known device once per poll
//! interval, concurrently and each under its own timeout, and merges the
//! results into the dashboard. A rejected session token stops the loop.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{ApiError, SensorApi};
use crate::config::PollerSettings;
use crate::dashboard::SharedDashboard;
use crate::models::Reading;

/// Outcome of one poll cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Devices that produced a reading
    pub updated: Vec<String>,
    /// Devices that answered without data
    pub empty: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
    pub session_expired: bool,
}

/// Why [`LivePoller::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    SessionExpired,
}

enum FetchOutcome {
    Reading(Reading),
    Empty,
    Failed(ApiError),
    TimedOut,
}

pub struct LivePoller {
    api: Arc<dyn SensorApi>,
    dashboard: SharedDashboard,
    settings: PollerSettings,
}

impl LivePoller {
    pub fn new(api: Arc<dyn SensorApi>, dashboard: SharedDashboard, settings: PollerSettings) -> Self {
        info!(
            poll_interval_secs = settings.poll_interval_secs,
            fetch_timeout_secs = settings.fetch_timeout_secs,
            device_refresh_secs = settings.device_refresh_secs,
            "Initializing live poller"
        );

        Self {
            api,
            dashboard,
            settings,
        }
    }

    /// Reload the device list from upstream, returning the device count
    pub async fn refresh_devices(&self) -> Result<usize, ApiError> {
        let devices = timeout(self.settings.fetch_timeout(), self.api.list_devices())
            .await
            .map_err(|_| ApiError::Timeout)??;

        let mut dashboard = self.dashboard.write().await;
        dashboard.set_devices(devices);
        Ok(dashboard.devices().len())
    }

    async fn fetch(&self, device_id: String) -> (String, FetchOutcome) {
        let outcome = match timeout(self.settings.fetch_timeout(), self.api.current_reading(&device_id)).await {
            Ok(Ok(Some(mut reading))) => {
                reading.device_id = device_id.clone();
                FetchOutcome::Reading(reading)
            }
            Ok(Ok(None)) => FetchOutcome::Empty,
            Ok(Err(e)) => FetchOutcome::Failed(e),
            Err(_) => FetchOutcome::TimedOut,
        };
        (device_id, outcome)
    }

    /// Run a single poll cycle over every known device
    pub async fn poll_once(&self) -> CycleReport {
        let devices = self.dashboard.read().await.devices().to_vec();
        let results = join_all(devices.into_iter().map(|d| self.fetch(d))).await;

        let mut report = CycleReport::default();
        let mut readings = Vec::with_capacity(results.len());
        let mut dashboard = self.dashboard.write().await;

        for (device_id, outcome) in results {
            match outcome {
                FetchOutcome::Reading(reading) if dashboard.is_latest(&device_id, &reading) => {
                    // Upstream repeats its newest row until the device reports again
                    debug!(device_id = %device_id, timestamp = %reading.timestamp, "Reading unchanged since last poll");
                    report.empty.push(device_id);
                }
                FetchOutcome::Reading(reading) => {
                    readings.push(reading);
                    report.updated.push(device_id);
                }
                FetchOutcome::Empty => {
                    debug!(device_id = %device_id, "Device returned no data");
                    report.empty.push(device_id);
                }
                FetchOutcome::TimedOut => {
                    warn!(device_id = %device_id, "Device fetch timed out");
                    report.timed_out.push(device_id);
                }
                FetchOutcome::Failed(e) => {
                    if e.is_auth_failure() {
                        report.session_expired = true;
                    }
                    warn!(device_id = %device_id, error = %e, "Device fetch failed");
                    report.failed.push(device_id);
                }
            }
        }

        dashboard.apply_cycle(readings, Utc::now());
        if report.session_expired {
            dashboard.mark_session_expired();
        }

        info!(
            updated = report.updated.len(),
            empty = report.empty.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            revision = dashboard.revision(),
            "Poll cycle complete"
        );

        report
    }

    /// Poll until upstream rejects the session
    pub async fn run(self) -> PollerExit {
        info!("Starting live poller loop");

        let mut ticker = interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_refresh: Option<Instant> = None;

        loop {
            ticker.tick().await;

            let refresh_due = last_refresh
                .map(|at| at.elapsed() >= self.settings.device_refresh())
                .unwrap_or(true);
            if refresh_due {
                match self.refresh_devices().await {
                    Ok(count) => {
                        info!(devices = count, "Device list refreshed");
                        last_refresh = Some(Instant::now());
                    }
                    Err(e) if e.is_auth_failure() => {
                        self.dashboard.write().await.mark_session_expired();
                        break;
                    }
                    // Retried on the next tick; known devices keep polling
                    Err(e) => warn!(error = %e, "Device list refresh failed"),
                }
            }

            if self.poll_once().await.session_expired {
                break;
            }
        }

        warn!("Live poller stopped: session expired");
        PollerExit::SessionExpired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::Dashboard;
    use crate::models::MetricKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[derive(Clone)]
    enum Behavior {
        Temperature(f64),
        Fixed(DateTime<Utc>, f64),
        Empty,
        Fail,
        Forbidden,
        Unauthorized,
        Hang,
    }

    struct MockApi {
        devices: Vec<String>,
        behaviors: Mutex<HashMap<String, Behavior>>,
        reading_calls: AtomicUsize,
    }

    impl MockApi {
        fn new(behaviors: &[(&str, Behavior)]) -> Self {
            Self {
                devices: behaviors.iter().map(|(d, _)| d.to_string()).collect(),
                behaviors: Mutex::new(
                    behaviors
                        .iter()
                        .map(|(d, b)| (d.to_string(), b.clone()))
                        .collect(),
                ),
                reading_calls: AtomicUsize::new(0),
            }
        }

        fn set(&self, device: &str, behavior: Behavior) {
            self.behaviors.lock().unwrap().insert(device.to_string(), behavior);
        }
    }

    #[async_trait]
    impl SensorApi for MockApi {
        async fn list_devices(&self) -> Result<Vec<String>, ApiError> {
            Ok(self.devices.clone())
        }

        async fn current_reading(&self, device_id: &str) -> Result<Option<Reading>, ApiError> {
            self.reading_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behaviors.lock().unwrap().get(device_id).cloned();
            match behavior {
                Some(Behavior::Temperature(t)) => {
                    let mut reading = Reading::new("", Utc::now());
                    reading.temperature = t;
                    Ok(Some(reading))
                }
                Some(Behavior::Fixed(ts, t)) => {
                    let mut reading = Reading::new("", ts);
                    reading.temperature = t;
                    Ok(Some(reading))
                }
                Some(Behavior::Empty) | None => Ok(None),
                Some(Behavior::Fail) => Err(ApiError::Status {
                    status: 500,
                    message: "boom".into(),
                }),
                Some(Behavior::Forbidden) => Err(ApiError::Forbidden(device_id.to_string())),
                Some(Behavior::Unauthorized) => Err(ApiError::Unauthorized),
                Some(Behavior::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
            }
        }
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            poll_interval_secs: 30,
            fetch_timeout_secs: 5,
            lookahead_secs: 30,
            device_refresh_secs: 300,
        }
    }

    async fn poller_for(api: Arc<MockApi>) -> (LivePoller, SharedDashboard) {
        let dashboard = Dashboard::new(Arc::new(MemoryStore::new()), Duration::from_secs(30)).shared();
        let poller = LivePoller::new(api, dashboard.clone(), settings());
        assert_ok!(poller.refresh_devices().await);
        (poller, dashboard)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_device_does_not_block_others() {
        let api = Arc::new(MockApi::new(&[
            ("A", Behavior::Temperature(21.0)),
            ("B", Behavior::Fail),
            ("C", Behavior::Hang),
            ("D", Behavior::Empty),
            ("E", Behavior::Forbidden),
        ]));
        let (poller, dashboard) = poller_for(api).await;

        let report = poller.poll_once().await;

        assert_eq!(report.updated, vec!["A"]);
        assert_eq!(report.failed, vec!["B", "E"]);
        assert_eq!(report.timed_out, vec!["C"]);
        assert_eq!(report.empty, vec!["D"]);
        assert!(!report.session_expired);

        let dashboard = dashboard.read().await;
        assert_eq!(dashboard.history().len("A"), 1);
        assert_eq!(dashboard.history().latest("A").unwrap().device_id, "A");
        assert!(dashboard.history().is_empty("B"));
        assert!(dashboard.last_poll().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_cycles_emit_prediction() {
        let api = Arc::new(MockApi::new(&[("A", Behavior::Temperature(20.0))]));
        let (poller, dashboard) = poller_for(api.clone()).await;

        poller.poll_once().await;
        api.set("A", Behavior::Temperature(22.0));
        poller.poll_once().await;

        let dashboard = dashboard.read().await;
        let open = dashboard
            .predictor()
            .open_prediction("A", MetricKind::Temperature)
            .cloned()
            .unwrap();
        assert_eq!(open.predicted_value, 24.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_reading_is_not_ingested_twice() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        let api = Arc::new(MockApi::new(&[("A", Behavior::Fixed(t0, 20.0))]));
        let (poller, dashboard) = poller_for(api.clone()).await;

        poller.poll_once().await;
        api.set("A", Behavior::Fixed(t1, 22.0));
        assert_eq!(poller.poll_once().await.updated, vec!["A"]);
        let revision = dashboard.read().await.revision();

        let report = poller.poll_once().await;

        assert!(report.updated.is_empty());
        assert_eq!(report.empty, vec!["A"]);

        let dashboard = dashboard.read().await;
        assert_eq!(dashboard.history().len("A"), 2);
        assert_eq!(dashboard.revision(), revision);
        let open = dashboard
            .predictor()
            .open_prediction("A", MetricKind::Temperature)
            .cloned()
            .unwrap();
        assert_eq!(open.timestamp, t0 + chrono::Duration::seconds(60));
        assert_eq!(open.predicted_value, 24.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_halts_and_expires_once() {
        let api = Arc::new(MockApi::new(&[
            ("A", Behavior::Temperature(21.0)),
            ("B", Behavior::Unauthorized),
        ]));
        let (poller, dashboard) = poller_for(api.clone()).await;
        let revision_before = dashboard.read().await.revision();

        let exit = poller.run().await;

        assert_eq!(exit, PollerExit::SessionExpired);
        assert_eq!(api.reading_calls.load(Ordering::SeqCst), 2);

        let dashboard = dashboard.read().await;
        assert!(dashboard.session_expired());
        assert_eq!(dashboard.history().len("A"), 1);
        // device refresh, one ingest, one expiry
        assert_eq!(dashboard.revision(), revision_before + 3);
    }
}
