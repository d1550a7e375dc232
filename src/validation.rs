//! Input validation module
//!
//! Validates manually ingested readings and path/query parameters of the
//! REST API.

use crate::error::{AppError, AppResult};
use crate::models::{MetricKind, ReadingInput};
use tracing::{debug, warn};
use validator::Validate;

/// Longest accepted device identifier
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Largest page size accepted by history endpoints
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Validate a manually submitted reading
pub fn validate_reading_input(input: &ReadingInput) -> AppResult<()> {
    if let Err(validation_errors) = input.validate() {
        let error_messages: Vec<String> = validation_errors
            .field_errors()
            .iter()
            .map(|(field, errors)| {
                let msgs: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.message.as_ref().map(|c| c.as_ref()))
                    .collect();
                format!("{}: {}", field, msgs.join(", "))
            })
            .collect();

        warn!(errors = ?error_messages, "Reading input validation failed");
        return Err(AppError::ValidationError(error_messages.join("; ")));
    }

    let values = [
        ("temp", input.temperature),
        ("humidity", input.humidity),
        ("co", input.co),
        ("lpg", input.lpg),
        ("smoke", input.smoke),
    ];
    for (field, value) in values {
        if !value.is_finite() {
            return Err(AppError::ValidationError(format!(
                "{} must be a finite number",
                field
            )));
        }
    }

    debug!("Reading input validation passed");
    Ok(())
}

/// Validate a device identifier taken from a request path
pub fn validate_device_id(device_id: &str) -> AppResult<()> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(AppError::ValidationError(format!(
            "Device id must be between 1 and {} characters",
            MAX_DEVICE_ID_LEN
        )));
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.');
    if !device_id.chars().all(allowed) {
        return Err(AppError::ValidationError(format!(
            "Device id {:?} contains invalid characters",
            device_id
        )));
    }

    Ok(())
}

/// Parse a metric name from a request path
pub fn parse_metric(name: &str) -> AppResult<MetricKind> {
    Ok(name.parse::<MetricKind>()?)
}

/// Validate pagination parameters
pub fn validate_pagination(page: Option<u32>, limit: Option<u32>) -> AppResult<(u32, u32)> {
    let page = page.unwrap_or(1);
    let limit = limit.unwrap_or(MAX_PAGE_LIMIT);

    if page == 0 {
        return Err(AppError::ValidationError(
            "Page number must be greater than 0".to_string(),
        ));
    }

    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(AppError::ValidationError(format!(
            "Limit must be between 1 and {}",
            MAX_PAGE_LIMIT
        )));
    }

    Ok((page, limit))
}
