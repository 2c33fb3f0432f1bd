//! Background task lifecycle
//!
//! Pollers and reconnect supervisors run as tokio tasks stopped through a
//! [`CancellationToken`]. Stopping never aborts the task; the owner waits a
//! bounded time for the task's `JoinHandle` to confirm the exit.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Smallest wait increment used when confirming a stop
const MIN_STOP_STEP: Duration = Duration::from_millis(100);

/// Number of wait increments before a stop is reported unconfirmed
const STOP_STEPS: u32 = 20;

/// How long a stop waits for a task running at `interval`
pub fn stop_bound(interval: Duration) -> Duration {
    (interval / 2).max(MIN_STOP_STEP) * STOP_STEPS
}

/// Outcome of a stop request
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// Task exited; carries its result
    Stopped(Result<()>),
    /// Task did not exit within the bound
    Unconfirmed,
    /// Stop was already requested earlier
    AlreadyStopped,
}

impl StopOutcome {
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, StopOutcome::Unconfirmed)
    }
}

/// Cancellation signal plus the handle confirming exit
#[derive(Debug, Default)]
pub struct TaskControl {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn attach(&self, handle: JoinHandle<Result<()>>) {
        *self.handle.lock() = Some(handle);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the task has exited, or if it was never attached
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Cancel and wait up to `bound` for the task to exit
    ///
    /// The handle is taken exactly once; later calls report `AlreadyStopped`.
    pub async fn stop(&self, bound: Duration) -> StopOutcome {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return StopOutcome::AlreadyStopped;
        };
        match tokio::time::timeout(bound, handle).await {
            Ok(Ok(result)) => StopOutcome::Stopped(result),
            Ok(Err(join_err)) => StopOutcome::Stopped(Err(join_err.into())),
            Err(_) => StopOutcome::Unconfirmed,
        }
    }

    /// Wait for the task to exit on its own, without cancelling it
    pub async fn join(&self) -> Option<Result<()>> {
        let handle = self.handle.lock().take()?;
        Some(handle.await.unwrap_or_else(|e| Err(e.into())))
    }
}
