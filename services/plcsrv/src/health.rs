//! Health indicators and alarms
//!
//! Channels report through a [`HealthLatch`]: the indicator flips once on the
//! first failure and once on the first success after that, never on repeats.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Health category shared by every tag channel
pub const HEALTH_CAT_CHANNEL: &str = "GIS_CHANNEL_ERR";

/// Alarm source used for soft controller faults
pub const ALARM_SOURCE: &str = "GISS-ALARM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Good(String),
    Bad(String),
}

impl HealthStatus {
    pub fn is_good(&self) -> bool {
        matches!(self, HealthStatus::Good(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HealthStatus::Good(m) | HealthStatus::Bad(m) => m,
        }
    }
}

/// Health/alarm collaborator
pub trait HealthReporter: Send + Sync {
    /// Current status of a category; categories never set are good
    fn health(&self, category: &str) -> HealthStatus;

    fn set_health(&self, category: &str, status: HealthStatus);

    fn raise_alarm(&self, source: &str, message: &str);
}

/// Reporter that keeps the latest state in memory and logs every transition
#[derive(Debug, Default)]
pub struct TracingHealthReporter {
    states: DashMap<String, HealthStatus>,
    alarm_count: AtomicU64,
    last_alarm: Mutex<Option<String>>,
}

impl TracingHealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alarm_count(&self) -> u64 {
        self.alarm_count.load(Ordering::Relaxed)
    }

    pub fn last_alarm(&self) -> Option<String> {
        self.last_alarm.lock().clone()
    }
}

impl HealthReporter for TracingHealthReporter {
    fn health(&self, category: &str) -> HealthStatus {
        self.states
            .get(category)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| HealthStatus::Good(String::new()))
    }

    fn set_health(&self, category: &str, status: HealthStatus) {
        match &status {
            HealthStatus::Good(msg) => info!("Health {} -> good: {}", category, msg),
            HealthStatus::Bad(msg) => warn!("Health {} -> bad: {}", category, msg),
        }
        self.states.insert(category.to_string(), status);
    }

    fn raise_alarm(&self, source: &str, message: &str) {
        warn!("ALARM [{}] {}", source, message);
        self.alarm_count.fetch_add(1, Ordering::Relaxed);
        *self.last_alarm.lock() = Some(message.to_string());
    }
}

/// Latched good/bad indicator for one health category
pub struct HealthLatch {
    category: String,
    good: AtomicBool,
    reporter: Arc<dyn HealthReporter>,
}

impl std::fmt::Debug for HealthLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthLatch")
            .field("category", &self.category)
            .field("good", &self.is_good())
            .finish_non_exhaustive()
    }
}

impl HealthLatch {
    pub fn new(category: impl Into<String>, reporter: Arc<dyn HealthReporter>) -> Self {
        let category = category.into();
        let good = reporter.health(&category).is_good();
        Self {
            category,
            good: AtomicBool::new(good),
            reporter,
        }
    }

    pub fn is_good(&self) -> bool {
        self.good.load(Ordering::SeqCst)
    }

    /// Flip to bad; returns true if this call caused the transition
    pub fn record_failure(&self, msg: &str) -> bool {
        let flipped = self.good.swap(false, Ordering::SeqCst);
        if flipped {
            self.reporter
                .set_health(&self.category, HealthStatus::Bad(msg.to_string()));
        }
        flipped
    }

    /// Flip to good; returns true if this call caused the transition
    pub fn record_success(&self, msg: &str) -> bool {
        let flipped = !self.good.swap(true, Ordering::SeqCst);
        if flipped {
            self.reporter
                .set_health(&self.category, HealthStatus::Good(msg.to_string()));
        }
        flipped
    }

    pub fn reporter(&self) -> &Arc<dyn HealthReporter> {
        &self.reporter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_flips_once_per_transition() {
        let reporter = Arc::new(TracingHealthReporter::new());
        let latch = HealthLatch::new(HEALTH_CAT_CHANNEL, reporter.clone());
        assert!(latch.is_good());

        assert!(latch.record_failure("open failed"));
        assert!(!latch.record_failure("open failed again"));
        assert_eq!(
            reporter.health(HEALTH_CAT_CHANNEL),
            HealthStatus::Bad("open failed".to_string())
        );

        assert!(latch.record_success("opened"));
        assert!(!latch.record_success("read"));
        assert!(reporter.health(HEALTH_CAT_CHANNEL).is_good());
        assert_eq!(reporter.health(HEALTH_CAT_CHANNEL).message(), "opened");
    }

    #[test]
    fn test_latch_starts_from_reporter_state() {
        let reporter = Arc::new(TracingHealthReporter::new());
        reporter.set_health(HEALTH_CAT_CHANNEL, HealthStatus::Bad("earlier".into()));
        let latch = HealthLatch::new(HEALTH_CAT_CHANNEL, reporter);
        assert!(!latch.is_good());
    }

    #[test]
    fn test_alarm_recorded() {
        let reporter = TracingHealthReporter::new();
        reporter.raise_alarm(ALARM_SOURCE, "timeout reading STATUS");
        assert_eq!(reporter.alarm_count(), 1);
        assert_eq!(reporter.last_alarm().as_deref(), Some("timeout reading STATUS"));
    }
}
