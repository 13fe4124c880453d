//! Backend health circuit breaker.
//!
//! State transitions:
//! - Unknown → Healthy: a round-trip succeeded
//! - Unknown/Healthy → Unhealthy: a transport failure was observed
//! - Unhealthy → Unknown: cooldown elapsed (next call probes the backend)
//! - Unhealthy → Healthy: explicit reset after a successful round-trip

use crate::error::PortalError;
use crate::metrics::SharedMetrics;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No round-trip observed yet; calls are attempted
    Unknown,
    Healthy,
    /// Calls are skipped until the cooldown elapses
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

struct BreakerInner {
    state: HealthState,
    last_tripped_at: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    cooldown: Duration,
    metrics: Option<SharedMetrics>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: HealthState::Unknown,
                last_tripped_at: None,
            }),
            cooldown,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        metrics.breaker_healthy.set(1.0);
        self.metrics = Some(metrics);
        self
    }

    /// Whether a network call should be attempted right now
    pub fn is_healthy(&self) -> bool {
        self.state() != HealthState::Unhealthy
    }

    /// Current state, applying passive cooldown recovery
    pub fn state(&self) -> HealthState {
        let mut inner = self.inner.lock();
        if inner.state == HealthState::Unhealthy {
            let cooled = inner
                .last_tripped_at
                .map(|at| at.elapsed() >= self.cooldown)
                .unwrap_or(true);
            if cooled {
                inner.state = HealthState::Unknown;
                info!(
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Backend cooldown elapsed, allowing probe request"
                );
                self.export(HealthState::Unknown);
            }
        }
        inner.state
    }

    pub fn set_health(&self, healthy: bool) {
        let mut inner = self.inner.lock();
        if healthy {
            if inner.state != HealthState::Healthy {
                info!(previous = inner.state.as_str(), "Backend marked healthy");
            }
            inner.state = HealthState::Healthy;
            self.export(HealthState::Healthy);
        } else {
            if inner.state != HealthState::Unhealthy {
                warn!(
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Backend marked unhealthy, skipping network calls until cooldown"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.breaker_trips_total.inc();
                }
            }
            inner.state = HealthState::Unhealthy;
            inner.last_tripped_at = Some(Instant::now());
            self.export(HealthState::Unhealthy);
        }
    }

    pub fn record_success(&self) {
        self.set_health(true);
    }

    /// Trip on transport failures only; application errors prove the backend answered
    pub fn observe(&self, err: &PortalError) {
        if err.is_transport() {
            self.set_health(false);
        } else {
            debug!(error = %err, "Non-transport failure, health unchanged");
        }
    }

    pub fn last_tripped_at(&self) -> Option<Instant> {
        self.inner.lock().last_tripped_at
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn export(&self, state: HealthState) {
        if let Some(metrics) = &self.metrics {
            metrics
                .breaker_healthy
                .set(if state == HealthState::Unhealthy { 0.0 } else { 1.0 });
        }
    }
}
