//! Per-device metric visibility
//!
//! Tracks which `(device, metric)` series the dashboard should materialize.
//! The first device ever seen starts with every metric visible; devices
//! discovered later start hidden.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::models::MetricKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisibilityState {
    /// Visible metrics keyed by device id
    devices: BTreeMap<String, BTreeSet<MetricKind>>,
    /// Set once the first device has received the all-visible default
    #[serde(default)]
    seeded: bool,
}

impl VisibilityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip one flag, returning the new visibility
    pub fn toggle(&mut self, device_id: &str, metric: MetricKind) -> bool {
        let visible = self.devices.entry(device_id.to_string()).or_default();
        if visible.remove(&metric) {
            false
        } else {
            visible.insert(metric);
            true
        }
    }

    pub fn is_visible(&self, device_id: &str, metric: MetricKind) -> bool {
        self.devices
            .get(device_id)
            .map(|v| v.contains(&metric))
            .unwrap_or(false)
    }

    /// Tracked device ids in order
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Visible metrics of a device in display order
    pub fn visible_metrics(&self, device_id: &str) -> Vec<MetricKind> {
        self.devices
            .get(device_id)
            .map(|v| v.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Align the tracked devices with the current device list.
    ///
    /// Stale devices are dropped and new ones are added hidden, except for
    /// the very first device ever seen which gets every metric.
    pub fn reconcile(&mut self, known: &[String]) {
        self.devices.retain(|id, _| known.contains(id));

        for device_id in known {
            if self.devices.contains_key(device_id) {
                continue;
            }
            let metrics = if self.seeded {
                BTreeSet::new()
            } else {
                self.seeded = true;
                info!(device_id = %device_id, "Showing all metrics for first device");
                MetricKind::ALL.iter().copied().collect()
            };
            self.devices.insert(device_id.clone(), metrics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_device_defaults_visible() {
        let mut state = VisibilityState::new();
        state.reconcile(&devices(&["A", "B"]));

        for metric in MetricKind::ALL {
            assert!(state.is_visible("A", metric));
            assert!(!state.is_visible("B", metric));
        }
    }

    #[test]
    fn test_toggle() {
        let mut state = VisibilityState::new();
        state.reconcile(&devices(&["A", "B"]));

        assert!(state.toggle("B", MetricKind::Humidity));
        assert!(state.is_visible("B", MetricKind::Humidity));
        assert!(!state.toggle("B", MetricKind::Humidity));
        assert!(!state.is_visible("B", MetricKind::Humidity));
    }

    #[test]
    fn test_reconcile_drops_stale_and_hides_new() {
        let mut state = VisibilityState::new();
        state.reconcile(&devices(&["A"]));
        state.reconcile(&devices(&["C"]));

        assert!(state.visible_metrics("A").is_empty());
        assert!(!state.is_visible("A", MetricKind::Temperature));
        assert!(state.visible_metrics("C").is_empty());
    }

    #[test]
    fn test_user_choices_survive_reconcile() {
        let mut state = VisibilityState::new();
        state.reconcile(&devices(&["A", "B"]));
        state.toggle("A", MetricKind::Co);
        state.reconcile(&devices(&["A", "B", "C"]));

        assert!(!state.is_visible("A", MetricKind::Co));
        assert!(state.is_visible("A", MetricKind::Temperature));
    }

    #[test]
    fn test_persisted_form_roundtrips() {
        let mut state = VisibilityState::new();
        state.reconcile(&devices(&["A", "B"]));

        let json = serde_json::to_string(&state).unwrap();
        let restored: VisibilityState = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, state);
    }
}
