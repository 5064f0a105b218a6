//! Per-station session state and subscriber handles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::stream::manager::SessionManager;
use crate::stream::pipeline::TranscodePipeline;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The first attacher is creating the pipeline.
    Starting,
    Running,
    /// The pipeline exhausted its retry budget.
    Failed,
    /// Being torn down; never gains subscribers again.
    Draining,
}

/// Mutable part of a session, guarded by the control mutex.
///
/// The control mutex is the per-station serialization point: it guards the
/// create/reuse/destroy decision and the subscriber count, and is never held
/// across subprocess or socket I/O.
pub struct SessionCtl {
    pub state: SessionState,
    pub pipeline: Option<Arc<TranscodePipeline>>,
    pub subscriber_count: u32,
    /// Bumped on every attach and on every detach-to-zero. An idle timer
    /// captures the epoch when it is armed and only fires if it is still
    /// current, so a reconnect can never lose the race to a stale timer.
    pub idle_epoch: u64,
    pub last_zero_at: Option<Instant>,
}

/// The live binding between one station id and its at-most-one pipeline.
pub struct StreamSession {
    pub station_id: String,
    /// Distinguishes successive sessions for the same station id.
    pub generation: u64,
    pub(crate) control: Arc<Mutex<SessionCtl>>,
    /// Lock-free mirror of `subscriber_count` for status snapshots; written
    /// only under the control mutex.
    subscribers: AtomicU32,
}

impl StreamSession {
    pub(crate) fn new(station_id: &str, generation: u64) -> Arc<Self> {
        Arc::new(Self {
            station_id: station_id.to_string(),
            generation,
            control: Arc::new(Mutex::new(SessionCtl {
                state: SessionState::Starting,
                pipeline: None,
                subscriber_count: 0,
                idle_epoch: 0,
                last_zero_at: None,
            })),
            subscribers: AtomicU32::new(0),
        })
    }

    pub fn subscriber_count(&self) -> u32 {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub(crate) fn set_subscriber_mirror(&self, count: u32) {
        self.subscribers.store(count, Ordering::SeqCst);
    }
}

/// A live attachment to a station's fan-out.
///
/// Dropping the handle releases the subscription; [`detach`] does the same
/// synchronously. Either way the session sees exactly one release.
///
/// [`detach`]: SubscriberHandle::detach
pub struct SubscriberHandle {
    pub(crate) rx: broadcast::Receiver<Bytes>,
    pub(crate) cancel: CancellationToken,
    pub(crate) pipeline: Arc<TranscodePipeline>,
    pub(crate) session: Arc<StreamSession>,
    pub(crate) manager: SessionManager,
    pub(crate) detached: bool,
}

impl SubscriberHandle {
    pub fn station_id(&self) -> &str {
        &self.session.station_id
    }

    /// Generation of the session this subscriber joined. Two handles with
    /// the same generation share one pipeline.
    pub fn generation(&self) -> u64 {
        self.session.generation
    }

    pub fn pipeline(&self) -> &Arc<TranscodePipeline> {
        &self.pipeline
    }

    /// Fires when the pipeline stops or fails; consumers select on it so a
    /// dead pipeline terminates their response instead of stranding it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next chunk of transcoded audio. `Lagged` means this subscriber fell
    /// behind its queue bound and should disconnect.
    pub async fn recv(&mut self) -> Result<Bytes, broadcast::error::RecvError> {
        self.rx.recv().await
    }

    /// Release the subscription now.
    pub async fn detach(mut self) {
        self.detached = true;
        let manager = self.manager.clone();
        let session = Arc::clone(&self.session);
        manager.release(session).await;
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        if !self.detached {
            let manager = self.manager.clone();
            let session = Arc::clone(&self.session);
            tokio::spawn(async move {
                manager.release(session).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_starting_and_empty() {
        let session = StreamSession::new("cnr1", 7);
        assert_eq!(session.station_id, "cnr1");
        assert_eq!(session.generation, 7);
        assert_eq!(session.subscriber_count(), 0);

        let ctl = session.control.try_lock().unwrap();
        assert_eq!(ctl.state, SessionState::Starting);
        assert!(ctl.pipeline.is_none());
        assert_eq!(ctl.idle_epoch, 0);
    }

    #[test]
    fn subscriber_mirror_tracks_writes() {
        let session = StreamSession::new("cnr1", 1);
        session.set_subscriber_mirror(3);
        assert_eq!(session.subscriber_count(), 3);
        session.set_subscriber_mirror(0);
        assert_eq!(session.subscriber_count(), 0);
    }
}
