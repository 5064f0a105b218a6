//! Throughput and lifecycle counters.
//!
//! Pipeline-level counters are reported when a pipeline shuts down;
//! gateway-level counters track session churn across the whole process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;

/// Counters for a single transcoding pipeline.
pub struct PipelineMetrics {
    start_time: Instant,
    bytes_out: AtomicU64,
    chunks_out: AtomicU64,
    subscribers_dropped: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            bytes_out: AtomicU64::new(0),
            chunks_out: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
        })
    }

    /// Record one chunk read from the transcoder.
    pub fn record_chunk(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, Ordering::Relaxed);
        self.chunks_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a subscriber disconnected for falling behind.
    pub fn record_dropped_subscriber(&self) {
        self.subscribers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn chunks_out(&self) -> u64 {
        self.chunks_out.load(Ordering::Relaxed)
    }

    pub fn subscribers_dropped(&self) -> u64 {
        self.subscribers_dropped.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Output rate in bytes per second over the pipeline's lifetime.
    pub fn rate_bytes_per_sec(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.01 {
            return 0.0;
        }
        self.bytes_out() as f64 / elapsed
    }

    /// Log a human-readable end-of-life report.
    pub fn print_report(&self, station_id: &str) {
        info!(
            "[Pipeline {}] report: uptime={:.1}s, bytes={}, chunks={}, rate={:.1} kB/s, dropped_subscribers={}",
            station_id,
            self.uptime().as_secs_f64(),
            self.bytes_out(),
            self.chunks_out(),
            self.rate_bytes_per_sec() / 1000.0,
            self.subscribers_dropped()
        );
    }
}

/// Gateway-wide counters.
pub struct SystemMetrics {
    sessions_started: AtomicU64,
    sessions_active: AtomicU64,
    pipelines_spawned: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl SystemMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions_started: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            pipelines_spawned: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
        })
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record one transcoder subprocess spawn (initial or restart).
    pub fn record_spawn(&self) {
        self.pipelines_spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn sessions_active(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    pub fn pipelines_spawned(&self) -> u64 {
        self.pipelines_spawned.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn print_report(&self) {
        info!(
            "[System] sessions={} (active={}), spawns={}, total_bytes={}",
            self.sessions_started(),
            self.sessions_active(),
            self.pipelines_spawned(),
            self.bytes_transferred()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_chunk(4096);
        metrics.record_chunk(1024);
        metrics.record_dropped_subscriber();

        assert_eq!(metrics.bytes_out(), 5120);
        assert_eq!(metrics.chunks_out(), 2);
        assert_eq!(metrics.subscribers_dropped(), 1);

        std::thread::sleep(Duration::from_millis(20));
        assert!(metrics.rate_bytes_per_sec() > 0.0);
    }

    #[test]
    fn system_counters() {
        let metrics = SystemMetrics::new();
        metrics.session_started();
        metrics.session_started();
        metrics.session_ended();
        metrics.record_spawn();

        assert_eq!(metrics.sessions_started(), 2);
        assert_eq!(metrics.sessions_active(), 1);
        assert_eq!(metrics.pipelines_spawned(), 1);

        metrics.add_bytes_transferred(9000);
        assert_eq!(metrics.bytes_transferred(), 9000);
    }
}
