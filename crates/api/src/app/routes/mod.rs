use axum::{
    Router,
    routing::{get, post},
};

pub mod live;
pub mod system;
pub mod vehicles;

/// Router for the query and live endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/api/vehicles", get(vehicles::near))
        .route("/api/vehicles/:vehicle_id", get(vehicles::history))
        .route("/api/stops/vehicles", post(vehicles::from_stops))
        .route("/ws/vehicles", get(live::upgrade))
}
