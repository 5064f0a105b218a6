//! Shared state for the HTTP gateway.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::registry::StationRegistry;
use crate::stream::manager::SessionManager;

/// Point-in-time server status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub running: bool,
    pub port: u16,
    /// Sessions with at least one subscriber.
    pub active_streams: usize,
    pub total_stations: usize,
}

/// State shared by all request handlers.
pub struct WebState {
    pub registry: Arc<StationRegistry>,
    pub manager: SessionManager,
    pub port: u16,
}

impl WebState {
    pub fn new(registry: Arc<StationRegistry>, manager: SessionManager, port: u16) -> Self {
        Self {
            registry,
            manager,
            port,
        }
    }

    /// The stable local address of a station's MP3 stream. Generated player
    /// configuration embeds this exact form.
    pub fn stream_url(&self, station_id: &str) -> String {
        format!("http://127.0.0.1:{}/stream/{}", self.port, station_id)
    }

    /// Status as seen over HTTP. Reads only counters and the registry
    /// snapshot, so it never waits on stream I/O.
    pub async fn status(&self) -> ServerStatus {
        ServerStatus {
            running: true,
            port: self.port,
            active_streams: self.manager.active_streams().await,
            total_stations: self.registry.len().await,
        }
    }
}
