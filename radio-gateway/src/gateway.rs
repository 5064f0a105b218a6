//! Lifecycle controller: the HTTP gateway as a start/stoppable unit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::registry::StationRegistry;
use crate::stream::manager::SessionManager;
use crate::web::{self, ServerStatus, WebState};

/// Bound on waiting for the HTTP server task during `stop`.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Owns the listener and ties its lifetime to the session manager: starting
/// binds the port, stopping unbinds it and tears every session down.
pub struct StreamGateway {
    port: u16,
    registry: Arc<StationRegistry>,
    manager: SessionManager,
    shutdown_tx: Option<oneshot::Sender<()>>,
    serve_handle: Option<JoinHandle<()>>,
    bound_port: Option<u16>,
}

impl StreamGateway {
    pub fn new(port: u16, registry: Arc<StationRegistry>, manager: SessionManager) -> Self {
        Self {
            port,
            registry,
            manager,
            shutdown_tx: None,
            serve_handle: None,
            bound_port: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Port actually bound (differs from the configured one when it is 0).
    pub fn port(&self) -> u16 {
        self.bound_port.unwrap_or(self.port)
    }

    /// Bind the loopback listener and start serving.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        if self.is_running() {
            return Err(LifecycleError::AlreadyRunning);
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound_port = listener.local_addr()?.port();

        let state = Arc::new(WebState::new(
            Arc::clone(&self.registry),
            self.manager.clone(),
            bound_port,
        ));
        let app = web::router(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await;
            if let Err(e) = result {
                error!("[Gateway] server error: {}", e);
            }
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.serve_handle = Some(handle);
        self.bound_port = Some(bound_port);
        info!("[Gateway] listening on http://127.0.0.1:{}", bound_port);
        Ok(())
    }

    /// Unbind the listener and tear every session down.
    pub async fn stop(&mut self) -> Result<(), LifecycleError> {
        let shutdown_tx = self.shutdown_tx.take().ok_or(LifecycleError::NotRunning)?;
        let _ = shutdown_tx.send(());

        // Live audio responses never end on their own, so graceful shutdown
        // would wait forever: tearing the sessions down ends every body and
        // lets the server drain within the pipelines' bounded stop time.
        self.manager.teardown_all().await;

        if let Some(mut handle) = self.serve_handle.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    "[Gateway] server did not drain within {:?}, aborting",
                    SHUTDOWN_TIMEOUT
                );
                handle.abort();
            }
        }

        self.bound_port = None;
        info!("[Gateway] stopped");
        Ok(())
    }

    /// Consistent status snapshot; always succeeds.
    pub async fn status(&self) -> ServerStatus {
        ServerStatus {
            running: self.is_running(),
            port: self.port(),
            active_streams: self.manager.active_streams().await,
            total_stations: self.registry.len().await,
        }
    }
}
