//! envdash - Environmental IoT Dashboard backend
//!
//! Polls environmental sensors, keeps a rolling per-device history with
//! linear-trend forecasts and serves chart-ready series over REST and
//! WebSocket.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use envdash::client::{HttpSensorApi, SensorApi};
use envdash::config::Settings;
use envdash::dashboard::Dashboard;
use envdash::fake_sensor::SimulatedSensorApi;
use envdash::handlers;
use envdash::poller::LivePoller;
use envdash::store::{FileStore, MemoryStore, Store};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenv::dotenv().ok();

    // Logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,envdash=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();

    // Load configuration
    let settings = Settings::from_env().context("Failed to load configuration")?;
    let bind_address = format!("{}:{}", settings.server.host, settings.server.port);

    info!("Starting envdash backend");
    info!("Binding server to {}", bind_address);

    // Persistence
    let store: Arc<dyn Store> = match &settings.storage.data_dir {
        Some(dir) => {
            info!(data_dir = %dir.display(), "Persisting dashboard state to disk");
            Arc::new(FileStore::open(dir).context("Failed to open data directory")?)
        }
        None => {
            warn!("DATA_DIR not set; dashboard state will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    // Shared dashboard state
    let dashboard = Dashboard::new(store, settings.poller.lookahead()).shared();

    // Upstream sensor API or simulator
    let api: Arc<dyn SensorApi> =
        match HttpSensorApi::from_settings(&settings.api, settings.poller.fetch_timeout())
            .context("Invalid sensor API settings")?
        {
            Some(api) => {
                info!(base_url = %api.base_url(), "Polling sensor API");
                Arc::new(api)
            }
            None => {
                info!("SENSOR_API_URL not set; using simulated sensors");
                Arc::new(SimulatedSensorApi::new(settings.simulator.devices.clone()))
            }
        };

    // ---------------------------------------------------------------------
    // Live poller background task
    // ---------------------------------------------------------------------
    let poller = LivePoller::new(api, dashboard.clone(), settings.poller.clone());

    actix_rt::spawn(async move {
        let exit = poller.run().await;
        warn!(reason = ?exit, "Live poller exited");
    });

    // ---------------------------------------------------------------------
    // HTTP + WebSocket server
    // ---------------------------------------------------------------------
    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(dashboard.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .configure(handlers::configure_routes)
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {}", bind_address))?
    .run()
    .await?;

    Ok(())
}
