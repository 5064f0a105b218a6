//! Stream session management.
//!
//! This module provides:
//! - [`SessionManager`]: station id → at most one live session, with
//!   single-flight creation and idle-grace teardown
//! - [`TranscodePipeline`]: the supervised transcoder subprocess with
//!   broadcast fan-out
//! - [`SubscriberHandle`]: one listener's attachment to a session

pub mod manager;
pub mod pipeline;
pub mod session;

pub use manager::{AttachError, SessionManager};
#[allow(unused_imports)]
pub use pipeline::{PipelineState, TranscodePipeline};
#[allow(unused_imports)]
pub use session::{SessionState, StreamSession, SubscriberHandle};
