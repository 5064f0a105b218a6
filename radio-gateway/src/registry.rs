//! Station catalog with wholesale snapshot replacement.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A single radio station as delivered by the catalog crawler.
///
/// Immutable once loaded; identity is `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub image_url: String,
    /// Upstream playlist (m3u8) the transcoder reads from.
    pub upstream_url: String,
}

/// Snapshot-swapped station catalog.
///
/// The crawler delivers station lists wholesale; `load` replaces the entire
/// snapshot at once and never merges. Readers clone the current `Arc` and
/// keep a consistent view for as long as they hold it, so a concurrent
/// reload can never show them a mix of old and new stations.
pub struct StationRegistry {
    snapshot: RwLock<Arc<HashMap<String, Station>>>,
}

impl StationRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Replace the whole catalog.
    pub async fn load(&self, stations: Vec<Station>) {
        let map: HashMap<String, Station> = stations
            .into_iter()
            .map(|station| (station.id.clone(), station))
            .collect();
        let count = map.len();

        *self.snapshot.write().await = Arc::new(map);
        info!("[Registry] loaded {} station(s)", count);
    }

    pub async fn lookup(&self, id: &str) -> Option<Station> {
        self.snapshot.read().await.get(id).cloned()
    }

    /// Current snapshot, shared without copying the map.
    pub async fn snapshot(&self) -> Arc<HashMap<String, Station>> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.is_empty()
    }
}

impl Default for StationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
