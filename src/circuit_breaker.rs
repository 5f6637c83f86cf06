// ============================================================================
// Circuit Breaker
// ============================================================================
//
// One state machine per upstream service key (host:port), protecting the
// dispatcher from hammering a failing backend.
//
// States:
// - CLOSED: normal operation, requests pass through
// - OPEN: rejecting immediately until the recovery timeout elapses
// - HALF_OPEN: probing; three consecutive successes close the circuit,
//   any failure reopens it
//
// All counters live behind one lock so a transition and the counters it
// inspects move together. A breaker-level rejection is not a failure signal;
// only the wrapped call failing is.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::BreakerSettings;
use crate::error::{GatewayError, GatewayResult};

/// Consecutive successes required in HALF_OPEN before closing.
const HALF_OPEN_SUCCESS_QUORUM: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
}

/// Point-in-time view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    #[serde(rename = "failureCount")]
    pub failure_count: u32,
    #[serde(rename = "successCount")]
    pub success_count: u32,
    /// Milliseconds since the most recent failure, if any.
    #[serde(rename = "lastFailureMsAgo")]
    pub last_failure_ms_ago: Option<u64>,
    /// Milliseconds until the next probe is allowed, while OPEN.
    #[serde(rename = "retryInMs")]
    pub retry_in_ms: Option<u64>,
}

pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: &str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            service: service.to_string(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                next_attempt: None,
            }),
        }
    }

    /// Gate a call. `Ok` means proceed; an OPEN breaker whose recovery
    /// timeout has elapsed transitions to HALF_OPEN and lets the call
    /// through as a probe.
    pub async fn acquire(&self) -> GatewayResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let due = inner
                    .next_attempt
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!(service = %self.service, "circuit breaker probing (half-open)");
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= HALF_OPEN_SUCCESS_QUORUM {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt = None;
                    tracing::info!(service = %self.service, "circuit breaker closed after recovery");
                }
            }
            // a straggler finishing after the circuit reopened
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_attempt = Some(Instant::now() + self.recovery_timeout);
                    tracing::warn!(
                        service = %self.service,
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        recovery_secs = self.recovery_timeout.as_secs(),
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.next_attempt = Some(Instant::now() + self.recovery_timeout);
                tracing::warn!(service = %self.service, "circuit breaker reopened after failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Administrative reset: force CLOSED and clear every counter.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        inner.next_attempt = None;
        tracing::info!(service = %self.service, "circuit breaker reset");
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_ms_ago: inner
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            retry_in_ms: inner
                .next_attempt
                .filter(|_| inner.state == CircuitState::Open)
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Process-wide breaker table, lazily populated on first use of a service
/// key.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(service) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.settings.failure_threshold,
                    Duration::from_secs(self.settings.recovery_timeout_secs),
                ))
            })
            .clone()
    }

    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    /// Reset one breaker by service key; false when no such breaker exists.
    pub async fn reset(&self, service: &str) -> bool {
        let breaker = {
            let breakers = self.breakers.read().await;
            breakers.get(service).cloned()
        };
        match breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new("svc:9000", threshold, recovery)
    }

    async fn fail_times(cb: &CircuitBreaker, n: u32) {
        for _ in 0..n {
            cb.acquire().await.unwrap();
            cb.record_failure().await;
        }
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let cb = breaker(2, Duration::from_secs(30));
        cb.acquire().await.unwrap();
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let cb = breaker(2, Duration::from_secs(30));
        cb.acquire().await.unwrap();
        cb.record_failure().await;
        cb.acquire().await.unwrap();
        cb.record_success().await;
        assert_eq!(cb.snapshot().await.failure_count, 0);

        // a single further failure must not open a threshold-2 breaker
        cb.acquire().await.unwrap();
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_at_threshold_and_rejects() {
        let cb = breaker(2, Duration::from_secs(30));
        fail_times(&cb, 2).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        match cb.acquire().await {
            Err(GatewayError::CircuitOpen { service }) => assert_eq!(service, "svc:9000"),
            other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rejection_is_not_counted_as_failure() {
        let cb = breaker(2, Duration::from_secs(30));
        fail_times(&cb, 2).await;
        let failures_before = cb.snapshot().await.failure_count;

        for _ in 0..5 {
            assert!(cb.acquire().await.is_err());
        }
        assert_eq!(cb.snapshot().await.failure_count, failures_before);
    }

    #[tokio::test]
    async fn recovery_timeout_lets_a_probe_through() {
        let cb = breaker(1, Duration::from_millis(50));
        fail_times(&cb, 1).await;
        assert!(cb.acquire().await.is_err());

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(cb.acquire().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn quorum_of_successes_closes_from_half_open() {
        let cb = breaker(1, Duration::from_millis(20));
        fail_times(&cb, 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        for _ in 0..2 {
            cb.acquire().await.unwrap();
            cb.record_success().await;
            assert_eq!(cb.state().await, CircuitState::HalfOpen);
        }
        cb.acquire().await.unwrap();
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let cb = breaker(1, Duration::from_millis(20));
        fail_times(&cb, 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        cb.acquire().await.unwrap();
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.acquire().await.is_err());
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let cb = breaker(1, Duration::from_secs(30));
        fail_times(&cb, 1).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        cb.reset().await;
        let snapshot = cb.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(cb.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn registry_keeps_one_breaker_per_service() {
        let registry = BreakerRegistry::new(BreakerSettings {
            failure_threshold: 1,
            recovery_timeout_secs: 30,
            monitor_timeout_secs: 10,
        });

        let a = registry.get_or_create("users:3001").await;
        let b = registry.get_or_create("users:3001").await;
        assert!(Arc::ptr_eq(&a, &b));

        a.acquire().await.unwrap();
        a.record_failure().await;
        assert_eq!(b.state().await, CircuitState::Open);

        // a different service key is unaffected
        let c = registry.get_or_create("orders:3002").await;
        assert!(c.acquire().await.is_ok());

        assert!(registry.reset("users:3001").await);
        assert!(!registry.reset("nobody:1").await);
        assert_eq!(a.state().await, CircuitState::Closed);
    }
}
