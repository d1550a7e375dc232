//! HTTP request handlers
//!
//! Implements REST API endpoints for the dashboard.

use actix_web::{web, HttpRequest, HttpResponse, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::dashboard::{Dashboard, SharedDashboard};
use crate::error::{AppError, AppResult};
use crate::models::{HealthCheck, MetricKind, Reading, ReadingInput};
use crate::validation::{parse_metric, validate_device_id, validate_pagination, validate_reading_input};
use crate::websocket::WsSession;

/// Configure all application routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(health_check))
            // Devices
            .route("/devices", web::get().to(list_devices))
            .route("/devices/selected", web::put().to(select_device))
            .route("/devices/{device}/latest", web::get().to(get_latest_reading))
            .route("/devices/{device}/history", web::get().to(get_reading_history))
            .route("/devices/{device}/history", web::delete().to(clear_history))
            .route("/devices/{device}/readings", web::post().to(ingest_reading))
            .route("/devices/{device}/statistics", web::get().to(get_statistics))
            .route("/devices/{device}/daily-averages", web::get().to(get_daily_averages))
            // Forecasts and charts
            .route(
                "/devices/{device}/predictions/{metric}",
                web::get().to(get_predictions),
            )
            .route("/devices/{device}/charts", web::get().to(get_visible_charts))
            .route("/devices/{device}/charts/{metric}", web::get().to(get_chart))
            // Visibility
            .route("/visibility", web::get().to(get_visibility))
            .route(
                "/visibility/{device}/{metric}/toggle",
                web::post().to(toggle_visibility),
            ),
    )
    // WebSocket endpoint
    .route("/ws", web::get().to(websocket_handler));
}

/// Reject malformed and unknown device ids
fn known_device(dashboard: &Dashboard, device_id: &str) -> AppResult<()> {
    validate_device_id(device_id)?;
    if !dashboard.is_known(device_id) {
        return Err(AppError::NotFound(format!("Unknown device: {}", device_id)));
    }
    Ok(())
}

/// Health check endpoint
///
/// GET /api/health
pub async fn health_check(dashboard: web::Data<SharedDashboard>) -> Result<HttpResponse, AppError> {
    let dashboard = dashboard.read().await;

    let health = HealthCheck {
        status: if dashboard.session_expired() {
            "degraded".to_string()
        } else {
            "healthy".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        uptime_seconds: dashboard.uptime_seconds(),
        last_poll: dashboard.last_poll(),
        session_expired: dashboard.session_expired(),
        device_count: dashboard.devices().len(),
        connected_clients: dashboard.client_count(),
    };

    Ok(HttpResponse::Ok().json(health))
}

#[derive(Serialize)]
struct DeviceList<'a> {
    devices: &'a [String],
    selected: Option<&'a str>,
}

/// GET /api/devices
pub async fn list_devices(dashboard: web::Data<SharedDashboard>) -> Result<HttpResponse, AppError> {
    let dashboard = dashboard.read().await;

    Ok(HttpResponse::Ok().json(DeviceList {
        devices: dashboard.devices(),
        selected: dashboard.selected_device(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectDevice {
    pub device: String,
}

/// PUT /api/devices/selected
pub async fn select_device(
    dashboard: web::Data<SharedDashboard>,
    body: web::Json<SelectDevice>,
) -> Result<HttpResponse, AppError> {
    validate_device_id(&body.device)?;

    let mut dashboard = dashboard.write().await;
    if !dashboard.select_device(&body.device) {
        return Err(AppError::NotFound(format!("Unknown device: {}", body.device)));
    }

    info!(device_id = %body.device, "Device selected");

    Ok(HttpResponse::Ok().json(DeviceList {
        devices: dashboard.devices(),
        selected: dashboard.selected_device(),
    }))
}

/// GET /api/devices/{device}/latest
pub async fn get_latest_reading(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let dashboard = dashboard.read().await;
    known_device(&dashboard, &device_id)?;

    match dashboard.history().latest(&device_id) {
        Some(reading) => Ok(HttpResponse::Ok().json(reading)),
        None => Err(AppError::NotFound(format!(
            "No readings available for device {}",
            device_id
        ))),
    }
}

/// Query parameters for reading history
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
struct PaginatedResponse<T> {
    data: Vec<T>,
    page: u32,
    limit: u32,
    total: u32,
    total_pages: u32,
}

/// Get reading history, oldest first
///
/// GET /api/devices/{device}/history?page=1&limit=100
pub async fn get_reading_history(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let (page, limit) = validate_pagination(query.page, query.limit)?;

    let dashboard = dashboard.read().await;
    known_device(&dashboard, &device_id)?;
    let readings: Vec<&Reading> = dashboard.history().get(&device_id);

    let total = readings.len();
    let start = ((page - 1) * limit) as usize;
    let end = (start + limit as usize).min(total);

    let paginated: Vec<_> = if start < total {
        readings[start..end].to_vec()
    } else {
        Vec::new()
    };

    Ok(HttpResponse::Ok().json(PaginatedResponse {
        data: paginated,
        page,
        limit,
        total: total as u32,
        total_pages: ((total as f64) / (limit as f64)).ceil() as u32,
    }))
}

/// DELETE /api/devices/{device}/history
pub async fn clear_history(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let mut dashboard = dashboard.write().await;
    known_device(&dashboard, &device_id)?;

    dashboard.clear_history(&device_id)?;

    Ok(HttpResponse::NoContent().finish())
}

#[derive(Serialize)]
struct IngestResponse {
    success: bool,
    device_id: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    predictions_emitted: usize,
    predictions_reconciled: usize,
    correlation_id: String,
}

/// Ingest a reading by hand
///
/// POST /api/devices/{device}/readings
pub async fn ingest_reading(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<String>,
    body: web::Json<ReadingInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let correlation_id = extract_correlation_id(&req);

    info!(
        correlation_id = %correlation_id,
        device_id = %device_id,
        "Received manual reading"
    );

    validate_reading_input(&body)?;
    let reading = body.into_inner().into_reading(&device_id);
    let timestamp = reading.timestamp;

    let summary = {
        let mut dashboard = dashboard.write().await;
        known_device(&dashboard, &device_id)?;
        dashboard.ingest(&device_id, reading)
    };

    info!(
        correlation_id = %correlation_id,
        device_id = %device_id,
        emitted = summary.emitted,
        reconciled = summary.reconciled,
        "Manual reading ingested"
    );

    Ok(HttpResponse::Created().json(IngestResponse {
        success: true,
        device_id,
        timestamp,
        predictions_emitted: summary.emitted,
        predictions_reconciled: summary.reconciled,
        correlation_id,
    }))
}

/// GET /api/devices/{device}/statistics
pub async fn get_statistics(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let dashboard = dashboard.read().await;
    known_device(&dashboard, &device_id)?;

    Ok(HttpResponse::Ok().json(dashboard.history().statistics(&device_id)))
}

/// GET /api/devices/{device}/daily-averages
pub async fn get_daily_averages(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let dashboard = dashboard.read().await;
    known_device(&dashboard, &device_id)?;

    Ok(HttpResponse::Ok().json(dashboard.history().daily_averages(&device_id)))
}

/// GET /api/devices/{device}/predictions/{metric}
pub async fn get_predictions(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (device_id, metric) = path.into_inner();
    let metric = parse_metric(&metric)?;
    if !metric.is_predictable() {
        return Err(AppError::BadRequest(format!(
            "Metric {} is not forecast",
            metric
        )));
    }

    let dashboard = dashboard.read().await;
    known_device(&dashboard, &device_id)?;

    Ok(HttpResponse::Ok().json(dashboard.predictions(&device_id, metric)))
}

/// GET /api/devices/{device}/charts/{metric}
pub async fn get_chart(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (device_id, metric) = path.into_inner();
    let metric = parse_metric(&metric)?;

    let dashboard = dashboard.read().await;
    known_device(&dashboard, &device_id)?;

    Ok(HttpResponse::Ok().json(dashboard.chart(&device_id, metric)))
}

/// Charts of the visible metrics only
///
/// GET /api/devices/{device}/charts
pub async fn get_visible_charts(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device_id = path.into_inner();
    let dashboard = dashboard.read().await;
    known_device(&dashboard, &device_id)?;

    Ok(HttpResponse::Ok().json(dashboard.visible_charts(&device_id)))
}

/// GET /api/visibility
pub async fn get_visibility(dashboard: web::Data<SharedDashboard>) -> Result<HttpResponse, AppError> {
    let dashboard = dashboard.read().await;
    let visibility = dashboard.visibility();

    let flags: BTreeMap<&str, Vec<MetricKind>> = visibility
        .devices()
        .map(|device| (device, visibility.visible_metrics(device)))
        .collect();

    Ok(HttpResponse::Ok().json(flags))
}

#[derive(Serialize)]
struct ToggleResponse {
    device_id: String,
    metric: MetricKind,
    visible: bool,
}

/// POST /api/visibility/{device}/{metric}/toggle
pub async fn toggle_visibility(
    dashboard: web::Data<SharedDashboard>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (device_id, metric) = path.into_inner();
    validate_device_id(&device_id)?;
    let metric = parse_metric(&metric)?;

    let visible = dashboard
        .write()
        .await
        .toggle_visibility(&device_id, metric)
        .ok_or_else(|| AppError::NotFound(format!("Unknown device: {}", device_id)))?;

    Ok(HttpResponse::Ok().json(ToggleResponse {
        device_id,
        metric,
        visible,
    }))
}

/// WebSocket upgrade handler
///
/// GET /ws
pub async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    dashboard: web::Data<SharedDashboard>,
) -> Result<HttpResponse, actix_web::Error> {
    let client_id = Uuid::new_v4().to_string();

    info!(client_id = %client_id, "WebSocket connection request");

    let ws_session = WsSession::new(client_id, dashboard.get_ref().clone());

    actix_web_actors::ws::start(ws_session, &req, stream)
}

/// Extract or generate correlation ID from request headers
fn extract_correlation_id(req: &HttpRequest) -> String {
    req.headers()
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use actix_web::{http::StatusCode, test, App};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Value;
    use std::sync::Arc;

    fn dashboard(devices: &[&str]) -> SharedDashboard {
        let mut dashboard = Dashboard::new(Arc::new(MemoryStore::new()), std::time::Duration::from_secs(30));
        dashboard.set_devices(devices.iter().map(|d| d.to_string()).collect());
        dashboard.shared()
    }

    fn input(temperature: f64, seconds: i64) -> ReadingInput {
        ReadingInput {
            temperature,
            humidity: 55.0,
            co: 0.004,
            lpg: 0.006,
            smoke: 0.0,
            light: false,
            motion: false,
            timestamp: Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(seconds)),
        }
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A"])))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["device_count"], 1);
    }

    #[actix_web::test]
    async fn test_failed_ws_handshakes_register_no_clients() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A"])))
                .configure(configure_routes),
        )
        .await;

        for _ in 0..5 {
            let req = test::TestRequest::get().uri("/ws").to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }

        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["connected_clients"], 0);
    }

    #[actix_web::test]
    async fn test_ingest_then_predict_and_chart() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A"])))
                .configure(configure_routes),
        )
        .await;

        for (temperature, seconds) in [(20.0, 0), (22.0, 30)] {
            let req = test::TestRequest::post()
                .uri("/api/devices/A/readings")
                .set_json(input(temperature, seconds))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }

        let req = test::TestRequest::get()
            .uri("/api/devices/A/predictions/temp")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["open"]["predicted_value"], 24.0);

        let req = test::TestRequest::get()
            .uri("/api/devices/A/charts/temp")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["labels"].as_array().unwrap().len(), 3);
        assert_eq!(body["predicted"][2], 24.0);
        assert!(body["actual"][2].is_null());
    }

    #[actix_web::test]
    async fn test_ingest_invalid_data() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A"])))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/devices/A/readings")
            .set_json(input(100.0, 0))
            .to_request();

        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_unknown_device_and_metric() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A"])))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/devices/Z/latest").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri("/api/devices/A/charts/pressure")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/api/devices/A/predictions/light")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_get_latest_no_data() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A"])))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/devices/A/latest").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_visibility_toggle_and_visible_charts() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A", "B"])))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/devices/B/charts").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert!(body.as_array().unwrap().is_empty());

        let req = test::TestRequest::post()
            .uri("/api/visibility/B/humidity/toggle")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["visible"], true);

        let req = test::TestRequest::get().uri("/api/devices/B/charts").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body[0]["metric"], "humidity");

        let req = test::TestRequest::get().uri("/api/visibility").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["A"].as_array().unwrap().len(), MetricKind::ALL.len());
    }

    #[actix_web::test]
    async fn test_select_device_and_history() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(dashboard(&["A", "B"])))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/api/devices/selected")
            .set_json(SelectDevice { device: "B".into() })
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["selected"], "B");

        let req = test::TestRequest::post()
            .uri("/api/devices/B/readings")
            .set_json(input(21.0, 0))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get()
            .uri("/api/devices/B/history?page=1&limit=10")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["data"][0]["temp"], 21.0);

        let req = test::TestRequest::delete()
            .uri("/api/devices/B/history")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }
}
