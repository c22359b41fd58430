use serde::Deserialize;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

/// `?lat=..&lon=..`, kept as raw strings so bad input maps to a JSON 400.
#[derive(Debug, Default, Deserialize)]
pub struct NearQuery {
    pub lat: Option<String>,
    pub lon: Option<String>,
}

impl NearQuery {
    pub fn coordinates(&self) -> Result<(f64, f64), axum::response::Response> {
        Ok((
            parse_coordinate("lat", self.lat.as_deref())?,
            parse_coordinate("lon", self.lon.as_deref())?,
        ))
    }
}

fn parse_coordinate(name: &str, raw: Option<&str>) -> Result<f64, axum::response::Response> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "missing_parameter",
            format!("query parameter '{name}' is required"),
        )
    })?;

    raw.parse::<f64>().map_err(|_| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_parameter",
            format!("query parameter '{name}' must be a number, got '{raw}'"),
        )
    })
}
