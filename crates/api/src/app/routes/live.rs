//! Live vehicle feed over WebSocket.
//!
//! Protocol:
//! 1. Client sends one text message `{"latitude": f, "longitude": f}` (optionally
//!    `"precision": 0..=3`) within the handshake timeout.
//! 2. Server pushes one JSON vehicle record per matching update until either side
//!    closes.
//!
//! Any setup failure (bad handshake, timeout, subscription error) closes the
//! connection without a payload.

use std::sync::Arc;

use axum::{
    extract::{
        Extension,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use geobus_core::ClientCoordinates;

use crate::app::services::AppServices;

/// GET /ws/vehicles
pub async fn upgrade(
    Extension(services): Extension<Arc<AppServices>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| session(socket, services))
}

async fn session(socket: WebSocket, services: Arc<AppServices>) {
    let (mut sink, mut stream) = socket.split();

    let coords = match tokio::time::timeout(services.handshake_timeout, handshake(&mut stream)).await {
        Ok(Ok(coords)) => coords,
        Ok(Err(reason)) => {
            warn!(reason = %reason, "live handshake rejected");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
        Err(_) => {
            warn!("live handshake timed out");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let mut subscription = match services.subscriptions.open(&coords).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(error = %err, "live subscription failed");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let subscription_id = subscription.id();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(event.as_ref()) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode vehicle event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    debug!(subscription_id = %subscription_id, "client went away mid-send");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let dropped = subscription.dropped();
    subscription.close().await;
    let _ = sink.send(Message::Close(None)).await;
    info!(subscription_id = %subscription_id, dropped, "live session ended");
}

/// Wait for the coordinates message, skipping control frames.
async fn handshake<S>(stream: &mut S) -> Result<ClientCoordinates, String>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| format!("receive failed: {e}"))?;
        return match message {
            Message::Text(text) => parse_coordinates(text.as_bytes()),
            Message::Binary(bytes) => parse_coordinates(&bytes),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => Err("client closed before sending coordinates".to_string()),
        };
    }
    Err("connection ended before sending coordinates".to_string())
}

fn parse_coordinates(raw: &[u8]) -> Result<ClientCoordinates, String> {
    let coords: ClientCoordinates =
        serde_json::from_slice(raw).map_err(|e| format!("invalid coordinates message: {e}"))?;
    coords.validate().map_err(|e| e.to_string())?;
    Ok(coords)
}
