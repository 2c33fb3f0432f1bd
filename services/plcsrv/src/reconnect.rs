//! Reconnect supervisor
//!
//! Keeps trying to open a tag's channel at the tag's reconnect interval. Once
//! the channel opens it marks the tag connected, starts a [`Poller`] and exits.
//! Connect-class failures are retried quietly; any other hardware fault is
//! handed to error recovery and ends the supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::error::Result;
use crate::lifecycle::{stop_bound, StopOutcome, TaskControl};
use crate::poller::Poller;
use crate::registry::ConnectionRegistry;
use crate::tag::Tag;

static NEXT_SUPERVISOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Retrying,
    Succeeded,
    Failed,
}

pub struct ReconnectSupervisor {
    id: u64,
    tag_name: String,
    interval: Duration,
    attempts: AtomicU64,
    state: Mutex<SupervisorState>,
    task: TaskControl,
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("id", &self.id)
            .field("tag_name", &self.tag_name)
            .field("attempts", &self.attempts())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ReconnectSupervisor {
    /// Create an idle supervisor for `tag`; [`start`](Self::start) launches it
    pub fn new(tag: &Tag) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SUPERVISOR_ID.fetch_add(1, Ordering::Relaxed),
            tag_name: tag.name().to_string(),
            interval: tag.reconnect_interval(),
            attempts: AtomicU64::new(0),
            state: Mutex::new(SupervisorState::Retrying),
            task: TaskControl::new(),
        })
    }

    /// Launch the retry loop
    ///
    /// The caller registers the supervisor first so the loop's own
    /// deregistration on exit always finds it.
    pub fn start(
        self: &Arc<Self>,
        registry: Arc<ConnectionRegistry>,
        channel: Arc<Channel>,
        tag: Arc<Tag>,
    ) {
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = worker.run(&registry, channel, tag).await;
            registry.deregister_supervisor(&worker.tag_name, worker.id);
            result
        });
        self.task.attach(handle);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    /// Open attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait a bounded time for the retry loop to exit
    pub async fn stop(&self) -> StopOutcome {
        if self.task.is_cancelled() {
            info!("Reconnect supervisor for {} already stopped", self.tag_name);
            return StopOutcome::AlreadyStopped;
        }
        let bound = stop_bound(self.interval);
        let outcome = self.task.stop(bound).await;
        match &outcome {
            StopOutcome::Unconfirmed => warn!(
                "Reconnect supervisor for {} stop requested but exit not confirmed within {}ms",
                self.tag_name,
                bound.as_millis()
            ),
            _ => debug!("Reconnect supervisor for {} stopped", self.tag_name),
        }
        outcome
    }

    /// Wait for the loop to end by itself
    pub async fn join(&self) -> Option<Result<()>> {
        self.task.join().await
    }

    async fn run(
        &self,
        registry: &Arc<ConnectionRegistry>,
        channel: Arc<Channel>,
        tag: Arc<Tag>,
    ) -> Result<()> {
        let token = self.task.token();
        let first_attempt = Instant::now();
        let address = registry.controller_address()?;

        info!(
            "Reconnect supervisor for {} started, attempts every {}ms",
            self.tag_name,
            self.interval.as_millis()
        );

        while !token.is_cancelled() {
            let attempt_start = Instant::now();
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            let opened = if channel.is_connected() {
                Ok(())
            } else {
                channel.open(&address).await
            };

            match opened {
                Ok(()) => {
                    if token.is_cancelled() {
                        // Stopped while the open was in flight
                        if let Err(e) = channel.close().await {
                            debug!("Reconnect supervisor close of {} failed: {}", self.tag_name, e);
                        }
                        break;
                    }
                    let elapsed = first_attempt.elapsed();
                    registry.update_connection_status(&self.tag_name, true);
                    info!(
                        "Reconnect supervisor opened {} after {:.3}s ({} attempts)",
                        channel,
                        elapsed.as_secs_f64(),
                        attempt
                    );

                    let poller = Poller::spawn(registry.poller_params(tag, channel));
                    registry.register_poller(poller);
                    *self.state.lock() = SupervisorState::Succeeded;
                    return Ok(());
                },
                Err(e) if e.is_connect() => {
                    debug!(
                        "Reconnect supervisor for {} still unable to reach '{}' (attempt {}): {}",
                        self.tag_name, address, attempt, e
                    );
                },
                Err(e) if e.is_hardware() => {
                    warn!(
                        "Reconnect supervisor for {} got {} error, handing off to recovery",
                        self.tag_name,
                        e.plcio_kind().map_or("hardware", |k| k.as_str())
                    );
                    *self.state.lock() = SupervisorState::Failed;
                    registry.recovery().interrupt(&self.tag_name, e);
                    return Ok(());
                },
                Err(e) => {
                    error!(
                        "Reconnect supervisor for {} cannot recover, terminating: {}",
                        self.tag_name, e
                    );
                    *self.state.lock() = SupervisorState::Failed;
                    return Err(e);
                },
            }

            let delay = self.interval.saturating_sub(attempt_start.elapsed());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }

        debug!(
            "Reconnect supervisor for {} cancelled after {} attempts",
            self.tag_name,
            self.attempts()
        );
        Ok(())
    }
}
