//! HTTP surface of the gateway.

pub mod api;
pub mod state;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

pub use state::{ServerStatus, WebState};

/// Build the gateway router. CORS is wide open: the server binds loopback
/// only and the desktop UI calls it from an arbitrary origin.
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/stream/:id", get(api::stream))
        .route("/status", get(api::status))
        .route("/stations", get(api::stations))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{StreamConfig, TranscoderConfig};
    use crate::registry::{Station, StationRegistry};
    use crate::stream::manager::SessionManager;
    use axum::body::to_bytes;
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> Arc<WebState> {
        let registry = Arc::new(StationRegistry::new());
        registry
            .load(vec![Station {
                id: "cnr1".to_string(),
                name: "中国之声".to_string(),
                subtitle: String::new(),
                province: "央广".to_string(),
                image_url: String::new(),
                upstream_url: "http://radio.example/cnr1.m3u8".to_string(),
            }])
            .await;

        let config = StreamConfig {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            ..StreamConfig::default()
        };
        let transcoder = TranscoderConfig {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                "while :; do printf AAAA; sleep 0.01; done".to_string(),
            ],
        };
        let manager = SessionManager::new(Arc::clone(&registry), config, transcoder);
        Arc::new(WebState::new(registry, manager, 3000))
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let state = test_state().await;
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(Request::get("/status").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["running"], true);
        assert_eq!(status["port"], 3000);
        assert_eq!(status["active_streams"], 0);
        assert_eq!(status["total_stations"], 1);
    }

    #[tokio::test]
    async fn stations_include_local_stream_url() {
        let state = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                Request::get("/stations")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let list: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(list["count"], 1);
        assert_eq!(
            list["stations"][0]["stream_url"],
            "http://127.0.0.1:3000/stream/cnr1"
        );
    }

    #[tokio::test]
    async fn unknown_station_is_404() {
        let state = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                Request::get("/stream/nonexistent-id")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_responds_with_mpeg_headers() {
        let state = test_state().await;
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(
                Request::get("/stream/cnr1")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "audio/mpeg"
        );
        assert!(response.headers().contains_key("icy-name"));

        // Dropping the body disconnects the subscriber; the session drains
        // after its idle grace rather than immediately.
        drop(response);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while state.manager.active_streams().await != 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "subscriber not released"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        state.manager.teardown_all().await;
    }
}
