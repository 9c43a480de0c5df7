use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::error::Error;

/// Circuit state for one operation label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy, requests allowed.
    Closed,
    /// Tripped, requests fail fast until the reopen time.
    Open,
    /// Cooldown expired, probing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// Hook invoked on every state change: (label, from, to).
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Clone)]
pub struct CircuitOptions {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_millis(60_000),
            on_state_change: None,
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// A named resilience checkpoint for a class of I/O.
pub struct CircuitBreaker {
    label: String,
    opts: CircuitOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, opts: CircuitOptions) -> Self {
        Self {
            label: label.into(),
            opts,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    fn set_state(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        info!("circuit '{}': {from} -> {to}", self.label);
        if let Some(hook) = &self.opts.on_state_change {
            hook(&self.label, from, to);
        }
    }

    /// Gate a call. While open, fails fast with `CircuitOpen` carrying the
    /// reopen time; once the open duration has elapsed the breaker moves to
    /// half-open and the call is let through.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state == CircuitState::Open {
            let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
            let elapsed = opened_at.elapsed();
            if elapsed >= self.opts.open_duration {
                inner.consecutive_successes = 0;
                self.set_state(&mut inner, CircuitState::HalfOpen);
            } else {
                let remaining = self.opts.open_duration - elapsed;
                let reopen_at = Utc::now()
                    + chrono::Duration::milliseconds(remaining.as_millis() as i64);
                return Err(anyhow::Error::new(Error::CircuitOpen {
                    operation: self.label.clone(),
                    reopen_at,
                }));
            }
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.opts.success_threshold {
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    self.set_state(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.opts.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        "circuit '{}' tripped after {} consecutive failures",
                        self.label, inner.consecutive_failures
                    );
                    self.set_state(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.set_state(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker: fail fast while open, record the outcome
    /// otherwise. A `CircuitOpen` error never invokes `f`.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.check()?;
        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }
}

/// One breaker per operation label (e.g. `ai-provider`, `github-api`,
/// `git-operations`), shared across the process.
///
/// Tests construct their own registry; production wires a single instance
/// through the engine and orchestrator.
pub struct CircuitRegistry {
    defaults: CircuitOptions,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(defaults: CircuitOptions) -> Self {
        Self { defaults, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, label: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(label.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(label, self.defaults.clone()))),
        )
    }

    /// (label, state) for every breaker created so far.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-op",
            CircuitOptions {
                failure_threshold: 5,
                success_threshold: 2,
                open_duration: Duration::from_millis(open_ms),
                on_state_change: None,
            },
        )
    }

    #[test]
    fn opens_after_threshold_without_invoking() {
        let cb = breaker(60_000);
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.check().unwrap_err();
        let core = err.downcast_ref::<Error>().expect("typed error");
        assert!(matches!(core, Error::CircuitOpen { .. }));
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let cb = breaker(60_000);
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_then_close() {
        let cb = breaker(10);
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(10);
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.check().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());
    }

    #[test]
    fn registry_returns_same_breaker_per_label() {
        let reg = CircuitRegistry::default();
        let a = reg.get("github-api");
        let b = reg.get("github-api");
        assert!(Arc::ptr_eq(&a, &b));
        a.record_failure();
        assert_eq!(reg.states().len(), 1);
    }

    #[tokio::test]
    async fn call_records_outcome() {
        let cb = breaker(60_000);
        for _ in 0..5 {
            let _: Result<()> = cb
                .call(|| async { Err(anyhow::Error::new(Error::Network("down".into()))) })
                .await;
        }
        // Sixth call fails fast without running the closure.
        let mut invoked = false;
        let result: Result<()> = cb
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert!(result.is_err());
        assert!(!invoked);
    }
}
