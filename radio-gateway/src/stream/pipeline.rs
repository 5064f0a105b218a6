//! Transcoding pipeline: one external subprocess per station, fanned out to
//! any number of subscribers.
//!
//! A pipeline owns its subprocess for the subprocess's entire lifetime. A
//! supervisor task reads the piped stdout into a broadcast channel and
//! restarts the subprocess with bounded exponential backoff when it dies
//! unexpectedly. Exhausting the retry budget fails the pipeline and releases
//! every subscriber; stopping it deliberately kills the subprocess and waits
//! a bounded time for it to be reaped.

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{StreamConfig, TranscoderConfig};
use crate::metrics::{PipelineMetrics, SystemMetrics};

/// Size of each chunk read from the transcoder's stdout.
const CHUNK_SIZE: usize = 4096;

/// Bound on waiting for the supervisor task during `stop`.
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The transcoder could not be started within the retry budget.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// Externally observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    /// Retry budget exhausted; subscribers have been released.
    Failed,
    /// Stopped deliberately (idle teardown or server stop).
    Stopped,
}

pub struct TranscodePipeline {
    station_id: String,
    tx: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    state_tx: watch::Sender<PipelineState>,
    spawn_count: AtomicU32,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<PipelineMetrics>,
    system: Arc<SystemMetrics>,
}

impl TranscodePipeline {
    /// Spawn the transcoder for `upstream_url` and start supervising it.
    ///
    /// The initial spawn shares the same retry budget as mid-stream
    /// restarts; if it cannot be spawned within the budget the error is
    /// returned synchronously and nothing is left running.
    pub async fn start(
        station_id: &str,
        upstream_url: &str,
        transcoder: TranscoderConfig,
        config: StreamConfig,
        system: Arc<SystemMetrics>,
    ) -> Result<Arc<Self>, PipelineError> {
        let mut attempt: u32 = 0;
        let child = loop {
            match spawn_transcoder(&transcoder, upstream_url) {
                Ok(child) => break child,
                Err(e) => {
                    attempt += 1;
                    if attempt >= config.spawn_attempts {
                        warn!(
                            "[Pipeline {}] giving up after {} spawn attempt(s): {}",
                            station_id, attempt, e
                        );
                        return Err(PipelineError::UpstreamUnavailable(e.to_string()));
                    }
                    let delay = backoff_delay(&config, attempt);
                    warn!(
                        "[Pipeline {}] transcoder spawn failed (attempt {}): {}, retrying in {:?}",
                        station_id, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let (tx, _) = broadcast::channel(config.broadcast_capacity);
        let (state_tx, _) = watch::channel(PipelineState::Running);
        let pipeline = Arc::new(Self {
            station_id: station_id.to_string(),
            tx,
            cancel: CancellationToken::new(),
            state_tx,
            spawn_count: AtomicU32::new(1),
            supervisor: Mutex::new(None),
            metrics: PipelineMetrics::new(),
            system,
        });
        pipeline.system.record_spawn();
        info!(
            "[Pipeline {}] transcoder started (pid {:?})",
            station_id,
            child.id()
        );

        let handle = tokio::spawn(Arc::clone(&pipeline).run(
            child,
            attempt,
            upstream_url.to_string(),
            transcoder,
            config,
        ));
        *pipeline.supervisor.lock().await = Some(handle);

        Ok(pipeline)
    }

    /// Subscribe to the MP3 chunk stream, starting from "now".
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Token that fires when the pipeline stops or fails. Subscribers select
    /// on it so a dead pipeline never strands a client connection.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> PipelineState {
        *self.state_tx.borrow()
    }

    /// Wait until the pipeline reaches `Failed` or `Stopped`.
    pub async fn wait_terminal(&self) -> PipelineState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != PipelineState::Running {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Number of subprocesses spawned over this pipeline's lifetime.
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Stop the pipeline: unblock the reader, kill the subprocess, and wait
    /// for the supervisor to finish. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, handle)
                .await
                .is_err()
            {
                error!(
                    "[Pipeline {}] supervisor did not stop within {:?}",
                    self.station_id, SUPERVISOR_JOIN_TIMEOUT
                );
            }
        }
    }

    /// Supervisor loop: pump output, reap the subprocess, restart with
    /// backoff until cancelled or out of budget.
    async fn run(
        self: Arc<Self>,
        mut child: Child,
        mut attempt: u32,
        upstream_url: String,
        transcoder: TranscoderConfig,
        config: StreamConfig,
    ) {
        loop {
            let started = Instant::now();
            let outcome = match child.stdout.take() {
                Some(stdout) => self.pump(stdout).await,
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "transcoder stdout not piped",
                )),
            };
            self.reap(child, &config).await;

            if self.cancel.is_cancelled() {
                let _ = self.state_tx.send(PipelineState::Stopped);
                info!("[Pipeline {}] stopped", self.station_id);
                break;
            }

            match outcome {
                Ok(bytes) => debug!(
                    "[Pipeline {}] transcoder output ended after {} bytes",
                    self.station_id, bytes
                ),
                Err(ref e) => warn!(
                    "[Pipeline {}] transcoder read error: {}",
                    self.station_id, e
                ),
            }

            // A run that stayed healthy for a while earns a fresh budget.
            if started.elapsed() >= config.retry_reset_after {
                attempt = 0;
            }

            child = match self.respawn(&mut attempt, &upstream_url, &transcoder, &config).await {
                Some(child) => child,
                None => break,
            };
        }

        self.metrics.print_report(&self.station_id);
    }

    /// Restart the subprocess with backoff. Returns `None` when the pipeline
    /// reached a terminal state instead (cancelled or budget exhausted).
    async fn respawn(
        &self,
        attempt: &mut u32,
        upstream_url: &str,
        transcoder: &TranscoderConfig,
        config: &StreamConfig,
    ) -> Option<Child> {
        loop {
            *attempt += 1;
            if *attempt >= config.spawn_attempts {
                error!(
                    "[Pipeline {}] retry budget exhausted ({} attempts), failing",
                    self.station_id, attempt
                );
                let _ = self.state_tx.send(PipelineState::Failed);
                // Releases every subscriber of this station; other stations
                // are unaffected.
                self.cancel.cancel();
                return None;
            }

            let delay = backoff_delay(config, *attempt);
            debug!(
                "[Pipeline {}] restarting transcoder in {:?} (attempt {})",
                self.station_id, delay, attempt
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.state_tx.send(PipelineState::Stopped);
                    info!("[Pipeline {}] stopped while waiting to restart", self.station_id);
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match spawn_transcoder(transcoder, upstream_url) {
                Ok(child) => {
                    self.spawn_count.fetch_add(1, Ordering::SeqCst);
                    self.system.record_spawn();
                    info!(
                        "[Pipeline {}] transcoder restarted (pid {:?})",
                        self.station_id,
                        child.id()
                    );
                    return Some(child);
                }
                Err(e) => {
                    warn!(
                        "[Pipeline {}] transcoder restart failed (attempt {}): {}",
                        self.station_id, attempt, e
                    );
                }
            }
        }
    }

    /// Read stdout into the fan-out until EOF, error, or cancellation.
    /// Returns the number of bytes pumped from this subprocess.
    async fn pump(&self, stdout: ChildStdout) -> std::io::Result<u64> {
        let mut reader = tokio::io::BufReader::new(stdout);
        let mut buf = [0u8; CHUNK_SIZE];
        let mut total: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(total),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Ok(total),
                    Ok(n) => {
                        total += n as u64;
                        self.metrics.record_chunk(n as u64);
                        self.system.add_bytes_transferred(n as u64);
                        // A send error just means no receivers right now;
                        // lagging receivers handle their own disconnect.
                        let _ = self.tx.send(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Make sure the subprocess is gone: kill it and wait a bounded time.
    /// `kill_on_drop` is the backstop if even that fails.
    async fn reap(&self, mut child: Child, config: &StreamConfig) {
        if let Ok(Some(status)) = child.try_wait() {
            debug!("[Pipeline {}] transcoder exited: {}", self.station_id, status);
            return;
        }

        if let Err(e) = child.start_kill() {
            warn!("[Pipeline {}] failed to kill transcoder: {}", self.station_id, e);
        }
        match tokio::time::timeout(config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("[Pipeline {}] transcoder killed: {}", self.station_id, status)
            }
            Ok(Err(e)) => warn!("[Pipeline {}] wait failed: {}", self.station_id, e),
            Err(_) => error!(
                "[Pipeline {}] transcoder did not exit within {:?}",
                self.station_id, config.stop_grace
            ),
        }
    }
}

/// Delay before restart `attempt` (1-based): base doubled per attempt,
/// capped.
fn backoff_delay(config: &StreamConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    config
        .backoff_base
        .saturating_mul(1u32 << exp)
        .min(config.backoff_max)
}

/// Spawn the transcoder with stdout piped and everything else detached.
fn spawn_transcoder(
    transcoder: &TranscoderConfig,
    upstream_url: &str,
) -> std::io::Result<Child> {
    let mut cmd = Command::new(&transcoder.program);
    cmd.args(transcoder.build_args(upstream_url))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fast_config() -> StreamConfig {
        StreamConfig {
            spawn_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            retry_reset_after: Duration::from_secs(60),
            broadcast_capacity: 16,
            stop_grace: Duration::from_millis(500),
            ..StreamConfig::default()
        }
    }

    /// Shell stand-in for the transcoder; the URL placeholder is unused.
    fn shell(script: &str) -> TranscoderConfig {
        TranscoderConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = fast_config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(20));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn start_fails_when_program_is_missing() {
        let transcoder = TranscoderConfig {
            program: PathBuf::from("/nonexistent/transcoder-binary"),
            args: vec![],
        };
        let result = TranscodePipeline::start(
            "cnr1",
            "http://u/playlist.m3u8",
            transcoder,
            fast_config(),
            SystemMetrics::new(),
        )
        .await;

        assert!(matches!(result, Err(PipelineError::UpstreamUnavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subscribers_receive_output() {
        let pipeline = TranscodePipeline::start(
            "cnr1",
            "http://u/playlist.m3u8",
            shell("while :; do printf AAAA; sleep 0.01; done"),
            fast_config(),
            SystemMetrics::new(),
        )
        .await
        .unwrap();

        let mut rx = pipeline.subscribe();
        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no output before timeout")
            .unwrap();
        assert!(!chunk.is_empty());
        assert!(pipeline.metrics().bytes_out() > 0);

        pipeline.stop().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.cancel_token().is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exiting_transcoder_fails_after_budget() {
        let pipeline = TranscodePipeline::start(
            "cnr1",
            "http://u/playlist.m3u8",
            shell("exit 0"),
            fast_config(),
            SystemMetrics::new(),
        )
        .await
        .unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), pipeline.wait_terminal())
            .await
            .expect("no terminal state before timeout");
        assert_eq!(state, PipelineState::Failed);
        // Subscribers are released, not stranded.
        assert!(pipeline.cancel_token().is_cancelled());
        // Initial spawn plus restarts, bounded by the budget.
        assert!(pipeline.spawn_count() >= 1);
        assert!(pipeline.spawn_count() <= fast_config().spawn_attempts);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_subscriber_lags_while_others_keep_up() {
        let config = StreamConfig {
            broadcast_capacity: 4,
            ..fast_config()
        };
        let pipeline = TranscodePipeline::start(
            "cnr1",
            "http://u/playlist.m3u8",
            shell("while :; do printf AAAAAAAA; sleep 0.005; done"),
            config,
            SystemMetrics::new(),
        )
        .await
        .unwrap();

        let mut slow = pipeline.subscribe();
        let mut fast = pipeline.subscribe();

        // The fast subscriber drains continuously; the slow one never polls.
        let mut received = 0usize;
        let deadline = Instant::now() + Duration::from_secs(5);
        while received < 20 && Instant::now() < deadline {
            if let Ok(Ok(chunk)) =
                tokio::time::timeout(Duration::from_secs(1), fast.recv()).await
            {
                assert!(!chunk.is_empty());
                received += 1;
            }
        }
        assert_eq!(received, 20, "fast subscriber starved");

        // By now the idle subscriber has overflowed its queue.
        match slow.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }

        pipeline.stop().await;
    }
}
