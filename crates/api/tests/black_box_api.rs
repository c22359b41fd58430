use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use geobus_api::app::{AppServices, build_app};
use geobus_core::{VehicleEvent, encode};
use geobus_events::InMemoryBroker;
use geobus_infra::store::{InMemoryTelemetryStore, TelemetryPoint};
use geobus_infra::{AppConfig, Pipeline};
use reqwest::StatusCode;
use serde_json::json;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

const SAMPLE: &str =
    "/gtfsrt/vp/fi/HSL/HSL/bus/1001/0/Center/T1/StopA/08:00:00/Bus42/60;24/1/2/3/1/red";

struct TestServer {
    base_url: String,
    ws_url: String,
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryTelemetryStore>,
    _pipeline: Pipeline,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = AppConfig {
            handshake_timeout: Duration::from_secs(2),
            ..AppConfig::in_memory()
        };
        let running = Pipeline::in_memory(&config)
            .await
            .expect("failed to start in-memory pipeline");
        let services = Arc::new(AppServices::new(&running.pipeline, &config));

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/ws/vehicles"),
            broker: running.broker,
            store: running.store,
            _pipeline: running.pipeline,
            handle,
        }
    }

    fn seed(&self, event: VehicleEvent) {
        self.store
            .insert(TelemetryPoint::from_event(&event, Utc::now()))
            .expect("seed insert failed");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn vehicle(id: &str, stop: &str, head: &str) -> VehicleEvent {
    VehicleEvent {
        vehicle_id: id.to_string(),
        next_stop: stop.to_string(),
        geohash_head: head.to_string(),
        route_id: "1001".to_string(),
        ..VehicleEvent::default()
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REST
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_pipeline_stats() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pipeline"]["ingest"]["received"], 0);
    assert_eq!(body["pipeline"]["subscriptions"]["active"], 0);
}

#[tokio::test]
async fn near_returns_records_from_the_callers_cell() {
    let server = TestServer::spawn().await;
    server.seed(vehicle("Bus42", "StopA", "60;24"));
    server.seed(vehicle("Bus7", "StopB", "59;24"));
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/vehicles?lat=60.1699&lon=24.9384", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await.unwrap();
    let records = body.as_array().expect("array body");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["vehicleId"], "Bus42");
    assert_eq!(records[0]["geohashHead"], "60;24");
}

#[tokio::test]
async fn near_rejects_missing_garbage_and_out_of_range_coordinates() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let cases = [
        ("lat=60.1", "missing_parameter"),
        ("lat=abc&lon=24.9", "invalid_parameter"),
        ("lat=95&lon=24.9", "validation_error"),
    ];
    for (query, code) in cases {
        let resp = client
            .get(format!("{}/api/vehicles?{query}", server.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "query {query}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], code, "query {query}");
    }
}

#[tokio::test]
async fn stops_lookup_returns_last_match_or_null() {
    let server = TestServer::spawn().await;
    server.seed(vehicle("Bus1", "StopA", "60;24"));
    server.seed(vehicle("Bus2", "StopC", "60;24"));
    let client = reqwest::Client::new();
    let url = format!("{}/api/stops/vehicles", server.base_url);

    let resp = client
        .post(&url)
        .json(&json!([{"nextStop": "StopA"}, {"nextStop": "StopB"}, {"nextStop": "StopC"}]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["vehicleId"], "Bus2");

    let resp = client
        .post(&url)
        .json(&json!([{"nextStop": "Nowhere"}]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body.is_null());
}

#[tokio::test]
async fn stops_lookup_rejects_empty_list_and_bad_json() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/stops/vehicles", server.base_url);

    let resp = client.post(&url).json(&json!([])).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");
}

#[tokio::test]
async fn vehicle_history_lists_one_vehicle_in_time_order() {
    let server = TestServer::spawn().await;
    server.seed(vehicle("Bus42", "StopA", "60;24"));
    server.seed(vehicle("Bus7", "StopA", "60;24"));
    server.seed(vehicle("Bus42", "StopB", "60;24"));
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/vehicles/Bus42", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await.unwrap();
    let stops: Vec<&str> = body
        .as_array()
        .expect("array body")
        .iter()
        .map(|r| r["nextStop"].as_str().unwrap())
        .collect();
    assert_eq!(stops, vec!["StopA", "StopB"]);
}

#[tokio::test]
async fn unreachable_store_maps_to_bad_gateway() {
    let server = TestServer::spawn().await;
    server.store.set_failing(true);
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/vehicles?lat=60.1&lon=24.9", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "store_unavailable");
}

// ─────────────────────────────────────────────────────────────────────────────
// Live feed
// ─────────────────────────────────────────────────────────────────────────────

type Client = WebSocket<MaybeTlsStream<TcpStream>>;

async fn ws_connect(url: &str, hello: &'static str) -> Client {
    let url = url.to_string();
    tokio::task::spawn_blocking(move || {
        let (mut socket, _) = tungstenite::connect(url).expect("ws connect failed");
        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream
                .set_read_timeout(Some(Duration::from_secs(3)))
                .unwrap();
        }
        socket.send(Message::text(hello)).expect("ws send failed");
        socket
    })
    .await
    .unwrap()
}

/// Next data frame, or `None` once the server closed the connection.
async fn ws_next(mut socket: Client) -> (Client, Option<String>) {
    tokio::task::spawn_blocking(move || {
        loop {
            match socket.read() {
                Ok(Message::Text(text)) => return (socket, Some(text.to_string())),
                Ok(Message::Close(_)) | Err(_) => return (socket, None),
                Ok(_) => continue,
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn live_client_receives_updates_for_its_cell() {
    let server = TestServer::spawn().await;
    let socket = ws_connect(&server.ws_url, r#"{"latitude": 60.1699, "longitude": 24.9384}"#).await;

    let filter = encode(60.1699, 24.9384);
    let broker = server.broker.clone();
    eventually("live subscription", || broker.is_subscribed(&filter)).await;

    assert!(server.broker.publish(SAMPLE));

    let (_socket, frame) = ws_next(socket).await;
    let frame = frame.expect("expected a vehicle update");
    let record: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(record["vehicleId"], "Bus42");
    assert_eq!(record["nextStop"], "StopA");
    assert_eq!(record["geohashHead"], "60;24");
}

#[tokio::test]
async fn live_client_disconnect_releases_the_subscription() {
    let server = TestServer::spawn().await;
    let socket = ws_connect(&server.ws_url, r#"{"latitude": 60.1699, "longitude": 24.9384}"#).await;

    let filter = encode(60.1699, 24.9384);
    let broker = server.broker.clone();
    eventually("live subscription", || broker.is_subscribed(&filter)).await;

    tokio::task::spawn_blocking(move || {
        let mut socket = socket;
        let _ = socket.close(None);
        let _ = socket.flush();
    })
    .await
    .unwrap();

    let broker = server.broker.clone();
    eventually("release", || !broker.is_subscribed(&filter)).await;
}

#[tokio::test]
async fn live_client_with_invalid_coordinates_is_closed() {
    let server = TestServer::spawn().await;
    let socket = ws_connect(&server.ws_url, r#"{"latitude": 200.0, "longitude": 24.9}"#).await;

    let (_socket, frame) = ws_next(socket).await;
    assert!(frame.is_none());
    assert!(server.broker.subscriptions().is_empty());
}

#[tokio::test]
async fn live_client_sending_garbage_is_closed() {
    let server = TestServer::spawn().await;
    let socket = ws_connect(&server.ws_url, "hello").await;

    let (_socket, frame) = ws_next(socket).await;
    assert!(frame.is_none());
    assert_eq!(server.broker.subscribe_calls(), 0);
}
