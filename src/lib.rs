//! envdash - Environmental IoT Dashboard backend
//!
//! Polls a fleet of environmental sensors (temperature, humidity, CO, LPG,
//! smoke, light, motion), keeps a bounded rolling history per device,
//! forecasts the next sample with a two-point linear trend and serves
//! chart-ready series over REST and WebSocket.

pub mod chart;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod fake_sensor;
pub mod handlers;
pub mod history;
pub mod models;
pub mod poller;
pub mod predictor;
pub mod store;
pub mod validation;
pub mod visibility;
pub mod websocket;
