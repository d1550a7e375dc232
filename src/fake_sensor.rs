//! Simulated sensor fleet
//!
//! Stands in for the upstream sensor API when no `SENSOR_API_URL` is
//! configured. Each device drifts around its own indoor baseline:
//!
//! - temperature and humidity follow a slow sine drift with Gaussian noise,
//!   humidity inversely correlated with temperature
//! - CO, LPG and smoke hover around low background concentrations with
//!   occasional short spikes
//! - light and motion flip state now and then
//!
//! Every call to [`SensorApi::current_reading`] advances the device by one
//! step and stamps the reading with the current time.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::client::{ApiError, ApiResult, SensorApi};
use crate::models::Reading;

/// Per-device simulation state
#[derive(Debug, Clone)]
struct DeviceModel {
    base_temperature: f64,
    base_humidity: f64,
    base_co: f64,
    base_lpg: f64,
    drift: f64,
    light: bool,
    motion: bool,
    ticks: u64,
}

impl DeviceModel {
    fn new(rng: &mut StdRng) -> Self {
        Self {
            base_temperature: rng.gen_range(19.0..25.0),
            base_humidity: rng.gen_range(40.0..65.0),
            base_co: rng.gen_range(0.002..0.006),
            base_lpg: rng.gen_range(0.004..0.008),
            drift: rng.gen_range(0.0..std::f64::consts::TAU),
            light: rng.gen_bool(0.5),
            motion: false,
            ticks: 0,
        }
    }
}

/// Standard deviations of the per-step noise
const TEMPERATURE_NOISE: f64 = 0.3;
const HUMIDITY_NOISE: f64 = 1.5;
const GAS_NOISE: f64 = 0.0005;

fn gaussian(rng: &mut StdRng, std_dev: f64) -> f64 {
    let z: f64 = rng.sample(StandardNormal);
    z * std_dev
}

struct SimulatorState {
    rng: StdRng,
    devices: HashMap<String, DeviceModel>,
}

/// [`SensorApi`] backed by generated data
pub struct SimulatedSensorApi {
    device_ids: Vec<String>,
    state: Mutex<SimulatorState>,
}

impl SimulatedSensorApi {
    pub fn new(device_ids: Vec<String>) -> Self {
        Self::with_rng(device_ids, StdRng::from_entropy())
    }

    /// Deterministic simulator for tests
    pub fn seeded(device_ids: Vec<String>, seed: u64) -> Self {
        Self::with_rng(device_ids, StdRng::seed_from_u64(seed))
    }

    fn with_rng(device_ids: Vec<String>, mut rng: StdRng) -> Self {
        info!(devices = device_ids.len(), "Initializing simulated sensor fleet");

        let devices = device_ids
            .iter()
            .map(|id| (id.clone(), DeviceModel::new(&mut rng)))
            .collect();

        Self {
            device_ids,
            state: Mutex::new(SimulatorState { rng, devices }),
        }
    }

    fn step(&self, device_id: &str) -> ApiResult<Option<Reading>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ApiError::Malformed("simulator state poisoned".into()))?;
        let SimulatorState { rng, devices } = &mut *state;

        let model = match devices.get_mut(device_id) {
            Some(model) => model,
            None => return Err(ApiError::Forbidden(device_id.to_string())),
        };

        model.ticks += 1;
        model.drift = (model.drift + 0.05) % std::f64::consts::TAU;

        let temp_drift = model.drift.sin() * 2.0;
        let temperature = (model.base_temperature + temp_drift + gaussian(rng, TEMPERATURE_NOISE))
            .clamp(-10.0, 50.0);
        let humidity = (model.base_humidity - temp_drift * 2.0 + gaussian(rng, HUMIDITY_NOISE))
            .clamp(5.0, 95.0);

        // Rare gas events, e.g. a stove left on
        let spike = if rng.gen::<f64>() < 0.03 {
            rng.gen_range(0.005..0.02)
        } else {
            0.0
        };
        let co = (model.base_co + spike + gaussian(rng, GAS_NOISE)).max(0.0);
        let lpg = (model.base_lpg + spike * 1.5 + gaussian(rng, GAS_NOISE)).max(0.0);
        let smoke = if spike > 0.0 {
            spike * 2.0
        } else {
            (gaussian(rng, GAS_NOISE) * 0.5).max(0.0)
        };

        if rng.gen::<f64>() < 0.05 {
            model.light = !model.light;
        }
        model.motion = rng.gen::<f64>() < 0.2;

        let mut reading = Reading::new(device_id, Utc::now());
        reading.temperature = (temperature * 10.0).round() / 10.0;
        reading.humidity = (humidity * 10.0).round() / 10.0;
        reading.co = co;
        reading.lpg = lpg;
        reading.smoke = smoke;
        reading.light = model.light;
        reading.motion = model.motion;

        debug!(
            device_id = %device_id,
            tick = model.ticks,
            temperature = reading.temperature,
            humidity = reading.humidity,
            co = reading.co,
            "Generated simulated reading"
        );

        Ok(Some(reading))
    }
}

#[async_trait]
impl SensorApi for SimulatedSensorApi {
    async fn list_devices(&self) -> ApiResult<Vec<String>> {
        Ok(self.device_ids.clone())
    }

    async fn current_reading(&self, device_id: &str) -> ApiResult<Option<Reading>> {
        self.step(device_id)
    }
}
