//! Upstream sensor API client
//!
//! The dashboard consumes two endpoints of the sensor backend: the list of
//! devices the session may read and the latest reading of one device.
//! [`SensorApi`] abstracts over the real HTTP backend and the simulator.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{ApiSettings, AuthScheme};
use crate::models::Reading;

/// Error type for sensor API calls
#[derive(Debug, Error)]
pub enum ApiError {
    /// The session token was rejected (HTTP 401)
    #[error("Session token rejected by sensor API")]
    Unauthorized,

    /// The session may not read this device (HTTP 403)
    #[error("Access denied to device {0}")]
    Forbidden(String),

    #[error("Sensor API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Sensor API request timed out")]
    Timeout,

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed sensor payload: {0}")]
    Malformed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether this error ends the whole session rather than one fetch
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

/// Result type for sensor API calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Source of device lists and current readings
#[async_trait]
pub trait SensorApi: Send + Sync {
    /// Device ids the session may read
    async fn list_devices(&self) -> ApiResult<Vec<String>>;

    /// Latest reading of one device, `None` when the device has no data yet
    async fn current_reading(&self, device_id: &str) -> ApiResult<Option<Reading>>;
}

/// HTTP client for the sensor backend REST API
#[derive(Debug, Clone)]
pub struct HttpSensorApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
    auth_scheme: AuthScheme,
}

impl HttpSensorApi {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        auth_scheme: AuthScheme,
        timeout: Duration,
    ) -> ApiResult<Self> {
        let raw = base_url.trim_end_matches('/');
        let base_url = Url::parse(raw).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", raw, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(raw.to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            token,
            auth_scheme,
        })
    }

    pub fn from_settings(settings: &ApiSettings, timeout: Duration) -> ApiResult<Option<Self>> {
        match &settings.base_url {
            Some(url) => Self::new(url, settings.token.clone(), settings.auth_scheme, timeout).map(Some),
            None => Ok(None),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Append path segments to the base URL, percent-encoding each one
    fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.token, self.auth_scheme) {
            (Some(token), AuthScheme::Bearer) => request.bearer_auth(token),
            (Some(token), AuthScheme::HeaderToken) => request.header("x-auth-token", token),
            (None, _) => request,
        }
    }

    async fn get_json(&self, url: Url, device_id: Option<&str>) -> ApiResult<Value> {
        debug!(url = %url, "Requesting sensor API");

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| if e.is_timeout() { ApiError::Timeout } else { ApiError::Transport(e) })?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::FORBIDDEN => Err(ApiError::Forbidden(device_id.unwrap_or_default().to_string())),
            status if !status.is_success() => {
                let message = response.text().await.unwrap_or_default();
                Err(ApiError::Status {
                    status: status.as_u16(),
                    message,
                })
            }
            _ => Ok(response.json::<Value>().await?),
        }
    }
}

#[async_trait]
impl SensorApi for HttpSensorApi {
    async fn list_devices(&self) -> ApiResult<Vec<String>> {
        let payload = self.get_json(self.endpoint(&["devices"])?, None).await?;
        serde_json::from_value(payload).map_err(|e| ApiError::Malformed(e.to_string()))
    }

    async fn current_reading(&self, device_id: &str) -> ApiResult<Option<Reading>> {
        let url = self.endpoint(&["realtime", device_id])?;
        let payload = self.get_json(url, Some(device_id)).await?;

        let reading = Reading::from_payload(payload).map_err(|e| ApiError::Malformed(e.to_string()))?;
        Ok(reading.map(|mut r| {
            if r.device_id.is_empty() {
                r.device_id = device_id.to_string();
            }
            r
        }))
    }
}
