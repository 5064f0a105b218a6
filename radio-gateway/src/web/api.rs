//! HTTP endpoints: audio streaming, status, station list.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use crate::stream::manager::AttachError;
use crate::stream::session::SubscriberHandle;
use crate::web::state::WebState;

/// Chunks buffered between the station fan-out and one client socket.
const CLIENT_QUEUE_CHUNKS: usize = 32;

/// `GET /stream/{id}` — attach to the station and stream MP3 until the
/// client disconnects, the stream fails upstream, or the server stops.
pub async fn stream(
    Path(station_id): Path<String>,
    State(state): State<Arc<WebState>>,
) -> Response {
    let station = match state.registry.lookup(&station_id).await {
        Some(station) => station,
        None => return (StatusCode::NOT_FOUND, "unknown station").into_response(),
    };

    let handle = match state.manager.attach(&station_id).await {
        Ok(handle) => handle,
        Err(e @ AttachError::NotFound(_)) => {
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
        Err(e) => {
            warn!("[Web] attach failed for '{}': {}", station_id, e);
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    info!("[Web] streaming '{}' ({})", station_id, station.name);
    let body = Body::from_stream(ReceiverStream::new(forward(handle)));

    Response::builder()
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("icy-name", urlencoding::encode(&station.name).to_string())
        .body(body)
        .unwrap()
}

/// Bridge one subscriber into a bounded per-client queue.
///
/// The forwarding task owns the handle, so detach happens exactly once, on
/// whichever exit path ends the stream: client gone (queue closed), pipeline
/// gone (cancel token), or this subscriber falling too far behind (lag).
fn forward(mut handle: SubscriberHandle) -> mpsc::Receiver<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CLIENT_QUEUE_CHUNKS);

    tokio::spawn(async move {
        let cancel = handle.cancel_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[Web] stream '{}' ended by pipeline", handle.station_id());
                    break;
                }
                chunk = handle.recv() => match chunk {
                    Ok(bytes) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            debug!("[Web] client left '{}'", handle.station_id());
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(behind)) => {
                        // Per-subscriber drop: this client stalls, the other
                        // listeners of the station keep playing.
                        warn!(
                            "[Web] dropping slow subscriber of '{}' ({} chunks behind)",
                            handle.station_id(),
                            behind
                        );
                        handle.pipeline().metrics().record_dropped_subscriber();
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        handle.detach().await;
    });

    rx
}

/// `GET /status` — server status snapshot.
pub async fn status(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(state.status().await)
}

/// `GET /stations` — the catalog with each station's local stream URL.
pub async fn stations(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot().await;
    let mut stations: Vec<_> = snapshot.values().collect();
    stations.sort_by(|a, b| a.id.cmp(&b.id));

    let list: Vec<serde_json::Value> = stations
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "subtitle": s.subtitle,
                "province": s.province,
                "image_url": s.image_url,
                "stream_url": state.stream_url(&s.id),
            })
        })
        .collect();

    Json(json!({
        "count": list.len(),
        "stations": list,
    }))
}
