//! InfluxDB v2 backend over its HTTP API.
//!
//! - Writes: line protocol to `/api/v2/write`, nanosecond precision
//! - Queries: Flux to `/api/v2/query`, answered as CSV with a header row
//! - Readiness: `/health`

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use geobus_core::VehicleEvent;

use crate::config::InfluxConfig;

use super::point::{RangeQuery, TelemetryPoint, event_from_pairs};
use super::r#trait::{StoreError, TelemetryStore};

#[derive(Debug, Clone)]
pub struct InfluxTelemetryStore {
    client: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxTelemetryStore {
    pub fn new(config: InfluxConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Unreachable(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.config.token)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(StoreError::Rejected(format!("{status}: {}", body.trim())))
        }
    }
}

#[async_trait]
impl TelemetryStore for InfluxTelemetryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.send(self.client.get(self.endpoint("/health"))).await.map(|_| ())
    }

    async fn write(&self, point: &TelemetryPoint) -> Result<(), StoreError> {
        let line = line_protocol(point)?;
        let request = self
            .client
            .post(self.endpoint("/api/v2/write"))
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line);

        self.send(request).await.map(|_| ())
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<VehicleEvent>, StoreError> {
        let flux = flux_query(&self.config.bucket, query);
        debug!(query = %flux, "running flux query");

        let request = self
            .client
            .post(self.endpoint("/api/v2/query"))
            .query(&[("org", self.config.org.as_str())])
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .header(reqwest::header::ACCEPT, "application/csv")
            .json(&json!({
                "query": flux,
                "type": "flux",
                "dialect": {
                    "header": true,
                    "annotations": [],
                    "delimiter": ",",
                },
            }));

        let body = self.send(request).await?;
        parse_csv(&body)
    }
}

/// Render one point as a line of InfluxDB line protocol.
///
/// Empty tag values are omitted; fields are always written as strings.
pub fn line_protocol(point: &TelemetryPoint) -> Result<String, StoreError> {
    let mut line = escape_key(point.measurement);

    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    let fields: Vec<String> = point
        .fields
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", escape_key(key), escape_field(value)))
        .collect();
    if fields.is_empty() {
        return Err(StoreError::Rejected("point has no fields".to_string()));
    }

    let nanos = point
        .timestamp
        .timestamp_nanos_opt()
        .ok_or_else(|| StoreError::Rejected("timestamp out of range".to_string()))?;

    line.push(' ');
    line.push_str(&fields.join(","));
    line.push(' ');
    line.push_str(&nanos.to_string());
    Ok(line)
}

fn escape_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_field(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn flux_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '$' => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Flux for a [`RangeQuery`]: one row per point, columns pivoted from fields.
pub fn flux_query(bucket: &str, query: &RangeQuery) -> String {
    format!(
        "from(bucket: {bucket})\n\
         \x20 |> range(start: -{window}s)\n\
         \x20 |> filter(fn: (r) => r._measurement == {measurement})\n\
         \x20 |> filter(fn: (r) => r[{tag}] == {value})\n\
         \x20 |> pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")\n\
         \x20 |> group()\n\
         \x20 |> sort(columns: [\"_time\"])",
        bucket = flux_string(bucket),
        window = query.window.as_secs().max(1),
        measurement = flux_string(super::point::MEASUREMENT),
        tag = flux_string(query.tag.key.as_str()),
        value = flux_string(&query.tag.value),
    )
}

/// Parse a CSV query response into events.
///
/// A response may hold several tables; each starts with its own header row
/// (`,result,table,...`).
pub fn parse_csv(body: &str) -> Result<Vec<VehicleEvent>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut header: Option<csv::StringRecord> = None;
    let mut events = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        if record.iter().all(str::is_empty) {
            header = None;
            continue;
        }
        if record.get(1) == Some("result") && record.get(2) == Some("table") {
            header = Some(record);
            continue;
        }
        let Some(columns) = header.as_ref() else {
            return Err(StoreError::InvalidResponse(
                "data row before header row".to_string(),
            ));
        };
        events.push(event_from_pairs(columns.iter().zip(record.iter())));
    }

    Ok(events)
}
