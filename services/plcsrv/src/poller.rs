//! Periodic tag reader
//!
//! A [`Poller`] reads one tag through its channel at a fixed interval and
//! publishes the decoded values. Timeouts raise an alarm, other hardware
//! faults go to the injected error callback, and a channel that stays
//! disconnected for [`MAX_RUNS_CH_NOT_CONNECTED`] ticks ends the poller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::error::{PlcError, Result};
use crate::hardware::{PlcCall, CLOSED};
use crate::health::{HealthReporter, ALARM_SOURCE};
use crate::lifecycle::{stop_bound, StopOutcome, TaskControl};
use crate::store::{enabled_key, ValueStore};
use crate::tag::Tag;

/// Consecutive disconnected ticks before the poller gives up
pub const MAX_RUNS_CH_NOT_CONNECTED: u32 = 30;

/// Floor on the delay between ticks
pub const MIN_TICK_DELAY: Duration = Duration::from_millis(20);

/// Receives hardware errors; must return without blocking
pub type ErrorCallback = Arc<dyn Fn(PlcError) + Send + Sync>;

/// Receives the outcome of every tick
pub type ReadCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub ticks: u64,
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub timeouts: u64,
    /// Current run of ticks with a disconnected channel
    pub disconnected_runs: u32,
}

/// Everything a poller needs
pub struct PollerParams {
    pub channel: Arc<Channel>,
    pub tag: Arc<Tag>,
    pub interval: Duration,
    pub store: Arc<dyn ValueStore>,
    pub reporter: Arc<dyn HealthReporter>,
    pub on_error: ErrorCallback,
    pub on_read: Option<ReadCallback>,
}

pub struct Poller {
    tag_name: String,
    interval: Duration,
    state: Mutex<PollerState>,
    tag_read: AtomicBool,
    stats: Mutex<PollerStats>,
    task: TaskControl,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("tag_name", &self.tag_name)
            .field("interval", &self.interval)
            .field("state", &self.state())
            .field("tag_read", &self.is_tag_read())
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Start polling on a new task
    pub fn spawn(params: PollerParams) -> Arc<Self> {
        let poller = Arc::new(Self {
            tag_name: params.tag.name().to_string(),
            interval: params.interval,
            state: Mutex::new(PollerState::Idle),
            tag_read: AtomicBool::new(false),
            stats: Mutex::new(PollerStats::default()),
            task: TaskControl::new(),
        });

        let connection = params.channel.connection_number();
        *poller.state.lock() = PollerState::Running;
        let worker = Arc::clone(&poller);
        let handle = tokio::spawn(async move { worker.run(params).await });
        poller.task.attach(handle);

        info!(
            "Poller {} started on ch#{} every {}ms",
            poller.tag_name,
            connection,
            poller.interval.as_millis()
        );
        poller
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock()
    }

    /// Result of the most recent tick
    pub fn is_tag_read(&self) -> bool {
        self.tag_read.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PollerStats {
        self.stats.lock().clone()
    }

    /// True once the polling task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait a bounded time for the polling task to exit
    pub async fn stop(&self) -> StopOutcome {
        if self.task.is_cancelled() {
            debug!("Poller {} already stopped", self.tag_name);
            return StopOutcome::AlreadyStopped;
        }
        let bound = stop_bound(self.interval);
        let outcome = self.task.stop(bound).await;
        *self.state.lock() = PollerState::Stopped;
        match &outcome {
            StopOutcome::Unconfirmed => warn!(
                "Poller {} stop requested but exit not confirmed within {}ms",
                self.tag_name,
                bound.as_millis()
            ),
            _ => debug!("Poller {} stopped", self.tag_name),
        }
        outcome
    }

    /// Wait for the task to end by itself
    pub async fn join(&self) -> Option<Result<()>> {
        self.task.join().await
    }

    fn signal(&self, on_read: &Option<ReadCallback>, read: bool) {
        self.tag_read.store(read, Ordering::SeqCst);
        if let Some(cb) = on_read {
            cb(read);
        }
    }

    async fn run(self: Arc<Self>, params: PollerParams) -> Result<()> {
        let PollerParams {
            channel,
            tag,
            interval,
            store,
            reporter,
            on_error,
            on_read,
        } = params;
        let token = self.task.token();
        let enabled_attr = enabled_key(tag.name());

        let mut enabled = store
            .get(&enabled_attr)
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !enabled {
            warn!(
                "Poller {} started while disabled; set {} to true to enable",
                self.tag_name, enabled_attr
            );
        }

        // Built once, connection number refreshed by the channel on each call
        let mut call = PlcCall::read(tag.name(), CLOSED, tag.byte_length());
        let mut runs_not_connected: u32 = 0;

        while !token.is_cancelled() {
            let started = Instant::now();
            self.stats.lock().ticks += 1;

            let now_enabled = store
                .get(&enabled_attr)
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if now_enabled != enabled {
                enabled = now_enabled;
                info!(
                    "Poller {} reading now {} (ch#{}, {}ms)",
                    self.tag_name,
                    if enabled { "enabled" } else { "disabled" },
                    channel.connection_number(),
                    interval.as_millis()
                );
            }

            if !enabled {
                self.signal(&on_read, false);
            } else if channel.is_connected() {
                runs_not_connected = 0;
                self.stats.lock().disconnected_runs = 0;
                self.read_once(&channel, &tag, &mut call, &store, &reporter, &on_error, &on_read)
                    .await;
            } else {
                runs_not_connected += 1;
                self.stats.lock().disconnected_runs = runs_not_connected;
                self.signal(&on_read, false);
                warn!(
                    "Poller {} cannot read, channel disconnected (run #{})",
                    self.tag_name, runs_not_connected
                );
                if runs_not_connected >= MAX_RUNS_CH_NOT_CONNECTED {
                    warn!(
                        "Poller {} exiting after {} runs with a disconnected channel",
                        self.tag_name, MAX_RUNS_CH_NOT_CONNECTED
                    );
                    break;
                }
            }

            let elapsed = started.elapsed();
            let mut delay = interval.saturating_sub(elapsed);
            if delay < MIN_TICK_DELAY {
                delay = MIN_TICK_DELAY;
                let timing = channel.timing();
                debug!(
                    "Poller {} tick took {}ms, forcing {}ms delay (interval {}ms, wait {}us, op {}us)",
                    self.tag_name,
                    elapsed.as_millis(),
                    delay.as_millis(),
                    interval.as_millis(),
                    timing.wait_time.as_micros(),
                    timing.op_time.as_micros()
                );
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
            trace!(
                "Poller {} tick done, read={}",
                self.tag_name,
                self.is_tag_read()
            );
        }

        *self.state.lock() = PollerState::Stopped;
        debug!("Poller {} exited", self.tag_name);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_once(
        &self,
        channel: &Channel,
        tag: &Tag,
        call: &mut PlcCall,
        store: &Arc<dyn ValueStore>,
        reporter: &Arc<dyn HealthReporter>,
        on_error: &ErrorCallback,
        on_read: &Option<ReadCallback>,
    ) {
        let result = match channel.generic_call(call).await {
            Ok(()) => tag.decode(&call.data),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tag.publish(store.as_ref());
                self.stats.lock().reads_ok += 1;
                self.signal(on_read, true);
            },
            Err(e) => {
                self.stats.lock().reads_failed += 1;
                self.signal(on_read, false);
                if e.is_timeout() {
                    self.stats.lock().timeouts += 1;
                    reporter.raise_alarm(
                        ALARM_SOURCE,
                        &format!(
                            "Poller received timeout reading tag {} using {} (timeout={}ms). Continuing...",
                            self.tag_name,
                            channel,
                            tag.timeout_ms()
                        ),
                    );
                } else if e.is_hardware() {
                    debug!("Poller {} hardware error, handing off: {}", self.tag_name, e);
                    on_error(e);
                } else {
                    warn!("Poller {} unable to read tag: {}", self.tag_name, e);
                }
            },
        }
    }
}
