//! Session manager: at most one live pipeline per station, single-flight
//! creation, idle-grace teardown.
//!
//! Lock discipline: the session table mutex is only ever held for map
//! lookups and edits, and the per-session control mutex only for the
//! attach/detach/teardown decision. When both are needed they are acquired
//! table-first. Pipeline creation runs under the control mutex alone — that
//! wait *is* the single-flight: concurrent attachers for the same station
//! queue on it and share the outcome, while other stations stay untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::{StreamConfig, TranscoderConfig};
use crate::metrics::SystemMetrics;
use crate::registry::StationRegistry;
use crate::stream::pipeline::{PipelineState, TranscodePipeline};
use crate::stream::session::{SessionCtl, SessionState, StreamSession, SubscriberHandle};

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("unknown station: {0}")]
    NotFound(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("too many concurrent streams")]
    ResourceExhausted,
}

/// Cheaply cloneable handle to the shared session table.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    registry: Arc<StationRegistry>,
    sessions: Mutex<HashMap<String, Arc<StreamSession>>>,
    stream_config: StreamConfig,
    transcoder: TranscoderConfig,
    metrics: Arc<SystemMetrics>,
    next_generation: AtomicU64,
}

impl SessionManager {
    pub fn new(
        registry: Arc<StationRegistry>,
        stream_config: StreamConfig,
        transcoder: TranscoderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                sessions: Mutex::new(HashMap::new()),
                stream_config,
                transcoder,
                metrics: SystemMetrics::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<SystemMetrics> {
        &self.inner.metrics
    }

    /// Attach a new subscriber to `station_id`, creating the session and its
    /// pipeline if this is the first listener.
    pub async fn attach(&self, station_id: &str) -> Result<SubscriberHandle, AttachError> {
        let station = self
            .inner
            .registry
            .lookup(station_id)
            .await
            .ok_or_else(|| AttachError::NotFound(station_id.to_string()))?;

        loop {
            let (session, creator_guard) = self.checkout_session(station_id).await?;
            let is_creator = creator_guard.is_some();
            let mut ctl = match creator_guard {
                Some(guard) => guard,
                None => session.control.clone().lock_owned().await,
            };

            match ctl.state {
                SessionState::Draining => {
                    // Lost a race against teardown; the table entry is gone
                    // or going, so go around and create a fresh session.
                    drop(ctl);
                    continue;
                }
                SessionState::Failed => {
                    // This is the creation attempt we queued behind; share
                    // its outcome rather than retrying on our own.
                    return Err(AttachError::UpstreamUnavailable(format!(
                        "transcoding for '{}' failed",
                        station_id
                    )));
                }
                // Only the creator can observe Starting: the control guard
                // is taken before the session is published.
                SessionState::Starting if !is_creator => {
                    drop(ctl);
                    continue;
                }
                SessionState::Starting | SessionState::Running => {}
            }

            if is_creator {
                match TranscodePipeline::start(
                    station_id,
                    &station.upstream_url,
                    self.inner.transcoder.clone(),
                    self.inner.stream_config.clone(),
                    Arc::clone(&self.inner.metrics),
                )
                .await
                {
                    Ok(pipeline) => {
                        ctl.state = SessionState::Running;
                        ctl.pipeline = Some(Arc::clone(&pipeline));
                        self.inner.metrics.session_started();
                        self.spawn_failure_watcher(Arc::clone(&session), pipeline);
                        info!("[Manager] session started for '{}'", station_id);
                    }
                    Err(e) => {
                        ctl.state = SessionState::Failed;
                        drop(ctl);
                        self.remove_entry(&session).await;
                        return Err(AttachError::UpstreamUnavailable(e.to_string()));
                    }
                }
            }

            let pipeline = match ctl.pipeline.clone() {
                Some(pipeline) if pipeline.state() == PipelineState::Running => pipeline,
                _ => {
                    // The pipeline died between our lookup and the control
                    // lock; retire the entry and start over.
                    if ctl.state == SessionState::Running {
                        ctl.state = SessionState::Draining;
                        self.inner.metrics.session_ended();
                    }
                    drop(ctl);
                    self.remove_entry(&session).await;
                    continue;
                }
            };

            ctl.subscriber_count += 1;
            ctl.idle_epoch += 1;
            session.set_subscriber_mirror(ctl.subscriber_count);
            debug!(
                "[Manager] subscriber attached to '{}' (total: {})",
                station_id, ctl.subscriber_count
            );

            return Ok(SubscriberHandle {
                rx: pipeline.subscribe(),
                cancel: pipeline.cancel_token(),
                pipeline,
                session: Arc::clone(&session),
                manager: self.clone(),
                detached: false,
            });
        }
    }

    /// Fetch the session for `id`, or publish a new one. For a new session
    /// the control guard is acquired *before* publication, which is what
    /// makes creation single-flight: followers queue on the guard and wake
    /// to the creation outcome.
    async fn checkout_session(
        &self,
        id: &str,
    ) -> Result<(Arc<StreamSession>, Option<OwnedMutexGuard<SessionCtl>>), AttachError> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(existing) = sessions.get(id) {
            return Ok((Arc::clone(existing), None));
        }

        if sessions.len() >= self.inner.stream_config.max_sessions {
            self.evict_idle(&mut sessions);
            if sessions.len() >= self.inner.stream_config.max_sessions {
                warn!(
                    "[Manager] session table at capacity ({}/{})",
                    sessions.len(),
                    self.inner.stream_config.max_sessions
                );
                return Err(AttachError::ResourceExhausted);
            }
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let session = StreamSession::new(id, generation);
        let guard = session
            .control
            .clone()
            .try_lock_owned()
            .expect("control of an unpublished session is uncontended");
        sessions.insert(id.to_string(), Arc::clone(&session));
        Ok((session, Some(guard)))
    }

    /// Free up table slots by retiring sessions that currently have no
    /// subscribers. Their pending idle timers become stale no-ops.
    fn evict_idle(&self, sessions: &mut HashMap<String, Arc<StreamSession>>) {
        let mut stopping = Vec::new();
        sessions.retain(|id, session| {
            if session.subscriber_count() > 0 {
                return true;
            }
            let Ok(mut ctl) = session.control.clone().try_lock_owned() else {
                return true;
            };
            if ctl.subscriber_count != 0 || ctl.state != SessionState::Running {
                return true;
            }
            ctl.state = SessionState::Draining;
            self.inner.metrics.session_ended();
            info!("[Manager] evicting idle session '{}' to free capacity", id);
            if let Some(pipeline) = ctl.pipeline.take() {
                stopping.push(pipeline);
            }
            false
        });

        for pipeline in stopping {
            tokio::spawn(async move { pipeline.stop().await });
        }
    }

    /// Drop one subscriber; arms the idle-grace timer when the count hits
    /// zero. Called from `SubscriberHandle`.
    pub(crate) async fn release(&self, session: Arc<StreamSession>) {
        let mut ctl = session.control.clone().lock_owned().await;
        if ctl.subscriber_count == 0 {
            return;
        }
        ctl.subscriber_count -= 1;
        session.set_subscriber_mirror(ctl.subscriber_count);
        debug!(
            "[Manager] subscriber detached from '{}' (remaining: {})",
            session.station_id, ctl.subscriber_count
        );

        if ctl.subscriber_count == 0 && ctl.state == SessionState::Running {
            ctl.idle_epoch += 1;
            let epoch = ctl.idle_epoch;
            ctl.last_zero_at = Some(Instant::now());
            drop(ctl);

            let manager = self.clone();
            let grace = self.inner.stream_config.idle_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                manager.reap_idle(session, epoch).await;
            });
        }
    }

    /// Idle timer body: tear the session down iff it is still the published
    /// one, still subscriber-free, and no attach has bumped the epoch since
    /// the timer was armed. An attach and an expiry arriving together are
    /// serialized by the two locks — whichever side loses sees the other's
    /// writes and backs off.
    async fn reap_idle(&self, session: Arc<StreamSession>, epoch: u64) {
        let pipeline = {
            let mut sessions = self.inner.sessions.lock().await;
            let current = match sessions.get(&session.station_id) {
                Some(current) if Arc::ptr_eq(current, &session) => current,
                _ => return,
            };
            let mut ctl = current.control.clone().lock_owned().await;
            if ctl.subscriber_count != 0
                || ctl.idle_epoch != epoch
                || ctl.state != SessionState::Running
            {
                return;
            }
            ctl.state = SessionState::Draining;
            sessions.remove(&session.station_id);
            self.inner.metrics.session_ended();
            info!(
                "[Manager] idle grace expired for '{}' (idle {:?}), tearing down",
                session.station_id,
                ctl.last_zero_at.map(|t| t.elapsed()).unwrap_or_default()
            );
            ctl.pipeline.take()
        };

        if let Some(pipeline) = pipeline {
            pipeline.stop().await;
        }
    }

    /// When a pipeline fails on its own (retry budget exhausted), retire its
    /// session so the table never holds a zombie and a later attach starts
    /// from scratch.
    fn spawn_failure_watcher(
        &self,
        session: Arc<StreamSession>,
        pipeline: Arc<TranscodePipeline>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            if pipeline.wait_terminal().await == PipelineState::Failed {
                manager.remove_failed(session).await;
            }
        });
    }

    async fn remove_failed(&self, session: Arc<StreamSession>) {
        let mut sessions = self.inner.sessions.lock().await;
        let mut ctl = session.control.clone().lock_owned().await;
        if ctl.state != SessionState::Running {
            return;
        }
        ctl.state = SessionState::Failed;
        self.inner.metrics.session_ended();
        warn!(
            "[Manager] pipeline for '{}' failed, removing session",
            session.station_id
        );
        if let Some(current) = sessions.get(&session.station_id) {
            if Arc::ptr_eq(current, &session) {
                sessions.remove(&session.station_id);
            }
        }
    }

    /// Remove `session`'s table entry if it is still the published one.
    async fn remove_entry(&self, session: &Arc<StreamSession>) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(current) = sessions.get(&session.station_id) {
            if Arc::ptr_eq(current, session) {
                sessions.remove(&session.station_id);
            }
        }
    }

    /// Force every session down, regardless of subscribers. Used by server
    /// stop; completes within the pipelines' bounded stop time.
    pub async fn teardown_all(&self) {
        let sessions: Vec<Arc<StreamSession>> = {
            let mut table = self.inner.sessions.lock().await;
            table.drain().map(|(_, session)| session).collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!("[Manager] tearing down {} session(s)", sessions.len());

        let metrics = Arc::clone(&self.inner.metrics);
        let stops = sessions.into_iter().map(|session| {
            let metrics = Arc::clone(&metrics);
            async move {
                let pipeline = {
                    let mut ctl = session.control.clone().lock_owned().await;
                    if ctl.state == SessionState::Running {
                        metrics.session_ended();
                    }
                    ctl.state = SessionState::Draining;
                    ctl.pipeline.take()
                };
                if let Some(pipeline) = pipeline {
                    pipeline.stop().await;
                }
            }
        });
        join_all(stops).await;
        self.inner.metrics.print_report();
    }

    /// Number of sessions with at least one subscriber.
    pub async fn active_streams(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .await
            .values()
            .filter(|session| session.subscriber_count() > 0)
            .count()
    }

    /// Number of live sessions, idle ones included.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::Station;
    use std::path::PathBuf;
    use std::time::Duration;

    const FEEDER: &str = "while :; do printf AAAA; sleep 0.01; done";

    fn station(id: &str) -> Station {
        Station {
            id: id.to_string(),
            name: format!("Station {}", id),
            subtitle: String::new(),
            province: String::new(),
            image_url: String::new(),
            upstream_url: format!("http://radio.example/{}.m3u8", id),
        }
    }

    async fn manager_with(grace: Duration, script: &str, max_sessions: usize) -> SessionManager {
        let registry = Arc::new(StationRegistry::new());
        registry.load(vec![station("cnr1"), station("cnr2")]).await;

        let config = StreamConfig {
            idle_grace: grace,
            spawn_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            retry_reset_after: Duration::from_secs(60),
            broadcast_capacity: 64,
            max_sessions,
            stop_grace: Duration::from_millis(500),
        };
        let transcoder = TranscoderConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
        };
        SessionManager::new(registry, config, transcoder)
    }

    #[tokio::test]
    async fn unknown_station_spawns_nothing() {
        let manager = manager_with(Duration::from_secs(30), FEEDER, 16).await;

        let result = manager.attach("nonexistent-id").await;
        assert!(matches!(result, Err(AttachError::NotFound(_))));
        assert_eq!(manager.metrics().pipelines_spawned(), 0);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_attaches_share_one_pipeline() {
        let manager = manager_with(Duration::from_secs(30), FEEDER, 16).await;

        let attaches = (0..8).map(|_| {
            let manager = manager.clone();
            async move { manager.attach("cnr1").await }
        });
        let handles: Vec<SubscriberHandle> = join_all(attaches)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .expect("every attach succeeds");

        let generation = handles[0].generation();
        assert!(handles.iter().all(|h| h.generation() == generation));
        assert_eq!(manager.metrics().pipelines_spawned(), 1);
        assert_eq!(manager.metrics().sessions_started(), 1);
        assert_eq!(manager.active_streams().await, 1);

        // Every subscriber hears the same pipeline.
        for mut handle in handles {
            let chunk = tokio::time::timeout(Duration::from_secs(5), handle.recv())
                .await
                .expect("audio before timeout")
                .unwrap();
            assert!(!chunk.is_empty());
            handle.detach().await;
        }
        assert_eq!(manager.active_streams().await, 0);
    }

    #[tokio::test]
    async fn reconnect_within_grace_reuses_pipeline() {
        let manager = manager_with(Duration::from_millis(500), FEEDER, 16).await;

        let first = manager.attach("cnr1").await.unwrap();
        let generation = first.generation();
        first.detach().await;

        // Well inside the grace window: same session, no second spawn.
        let second = manager.attach("cnr1").await.unwrap();
        assert_eq!(second.generation(), generation);
        assert_eq!(manager.metrics().pipelines_spawned(), 1);
        second.detach().await;
    }

    #[tokio::test]
    async fn idle_grace_expiry_tears_down_and_respawns() {
        let manager = manager_with(Duration::from_millis(50), FEEDER, 16).await;

        let first = manager.attach("cnr1").await.unwrap();
        let generation = first.generation();
        first.detach().await;

        // Past the grace window the session is gone.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.session_count().await, 0);

        let second = manager.attach("cnr1").await.unwrap();
        assert_ne!(second.generation(), generation);
        assert_eq!(manager.metrics().pipelines_spawned(), 2);
        second.detach().await;
    }

    #[tokio::test]
    async fn teardown_all_releases_subscribers() {
        let manager = manager_with(Duration::from_secs(30), FEEDER, 16).await;

        let one = manager.attach("cnr1").await.unwrap();
        let two = manager.attach("cnr2").await.unwrap();
        assert_eq!(manager.active_streams().await, 2);

        manager.teardown_all().await;
        assert_eq!(manager.session_count().await, 0);
        assert_eq!(manager.active_streams().await, 0);
        assert!(one.cancel_token().is_cancelled());
        assert!(two.cancel_token().is_cancelled());
        assert_eq!(manager.metrics().sessions_active(), 0);

        one.detach().await;
        two.detach().await;
    }

    #[tokio::test]
    async fn failed_pipeline_removes_session_and_allows_retry() {
        // A transcoder that exits immediately burns through the budget.
        let manager = manager_with(Duration::from_secs(30), "exit 0", 16).await;

        let handle = manager.attach("cnr1").await.unwrap();
        let cancel = handle.cancel_token();

        // Budget exhaustion cancels the pipeline and retires the session.
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("pipeline fails before timeout");
        handle.detach().await;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while manager.session_count().await != 0 {
            assert!(std::time::Instant::now() < deadline, "session not removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A later attach starts over from scratch.
        let retry = manager.attach("cnr1").await.unwrap();
        assert!(manager.metrics().pipelines_spawned() > 1);
        retry.detach().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_shared_by_waiters() {
        let registry = Arc::new(StationRegistry::new());
        registry.load(vec![station("cnr1")]).await;
        let config = StreamConfig {
            spawn_attempts: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
            ..StreamConfig::default()
        };
        let transcoder = TranscoderConfig {
            program: PathBuf::from("/nonexistent/transcoder-binary"),
            args: vec![],
        };
        let manager = SessionManager::new(registry, config, transcoder);

        let attaches = (0..4).map(|_| {
            let manager = manager.clone();
            async move { manager.attach("cnr1").await }
        });
        for result in join_all(attaches).await {
            assert!(matches!(result, Err(AttachError::UpstreamUnavailable(_))));
        }
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn capacity_evicts_idle_then_rejects() {
        let manager = manager_with(Duration::from_secs(30), FEEDER, 1).await;

        // Fill the single slot, then go idle.
        let first = manager.attach("cnr1").await.unwrap();
        first.detach().await;
        assert_eq!(manager.session_count().await, 1);

        // The idle session is evicted to make room.
        let second = manager.attach("cnr2").await.unwrap();
        assert_eq!(manager.session_count().await, 1);

        // With the slot held by an active stream, a third station is refused.
        let third = manager.attach("cnr1").await;
        assert!(matches!(third, Err(AttachError::ResourceExhausted)));
        second.detach().await;
    }
}
