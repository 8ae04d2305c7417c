//! The task abstraction shared by executables and pod forwards.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::message::Sink;

/// A unit of supervised work.
///
/// A task owns its OS-level resources (process groups, tunnels) and must release them
/// when `terminate` is called or the `cancel` token passed to `launch` fires.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Stable identity used to tag every message the task emits.
    fn identity(&self) -> &str;

    /// Runs the task until cancellation, termination or a fatal error.
    async fn launch(&self, cancel: CancellationToken, sink: Sink) -> Result<(), TaskError>;

    /// Emits a `Stopped` message and releases the task's resources.
    async fn terminate(&self, sink: &Sink) -> Result<(), TaskError>;
}

/// Shared handle to a task.
pub type TaskRef = Arc<dyn Runnable>;
