use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    response::{IntoResponse, Response},
};

use geobus_core::StopRef;

use crate::app::dto::NearQuery;
use crate::app::errors;
use crate::app::services::AppServices;

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/vehicles?lat=..&lon=..
///
/// Records from the last window inside the caller's GeoCell.
pub async fn near(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<NearQuery>,
) -> Response {
    let (lat, lon) = match query.coordinates() {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match services.queries.near(lat, lon).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => errors::query_error_to_response(err),
    }
}

/// POST /api/stops/vehicles
///
/// Body: `[{"nextStop": "..."}, ...]`. Answers with the last matching record, or
/// `null` when no stop has any.
pub async fn from_stops(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<Vec<StopRef>>, JsonRejection>,
) -> Response {
    let Json(stops) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match services.queries.from_stops(&stops).await {
        Ok(found) => Json(found).into_response(),
        Err(err) => errors::query_error_to_response(err),
    }
}

/// GET /api/vehicles/:vehicle_id
pub async fn history(
    Extension(services): Extension<Arc<AppServices>>,
    Path(vehicle_id): Path<String>,
) -> Response {
    match services.queries.vehicle_history(&vehicle_id).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => errors::query_error_to_response(err),
    }
}
