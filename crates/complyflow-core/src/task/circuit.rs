//! Per-resource circuit breaker around a [`TaskInvoker`].
//!
//! Each task resource gets its own breaker. After `failure_threshold`
//! consecutive backend failures the circuit opens and dispatch fails fast
//! with `States.CircuitOpen` until `open_duration` has elapsed; then a probe
//! is let through (HalfOpen). A successful probe closes the circuit, a
//! failed one reopens it.
//!
//! Only backend-health failures (`States.BackendUnavailable`,
//! `States.Timeout`) count toward tripping. A handler that ran and rejected
//! its input says nothing about backend health.

use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use complyflow_types::config::CircuitBreakerConfig;
use complyflow_types::workflow::InvocationMode;

use super::{TaskError, TaskInvoker};

/// Circuit breaker state for one resource.
#[derive(Debug, Clone)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward threshold.
    Closed { consecutive_failures: u32 },
    /// Dispatch refused until `wait_duration` has elapsed.
    Open {
        opened_at: Instant,
        wait_duration: Duration,
    },
    /// Probing: calls are allowed to test whether the backend recovered.
    HalfOpen,
}

/// Health tracking for a single task resource.
#[derive(Debug)]
pub struct ResourceHealth {
    pub resource: String,
    pub state: CircuitState,
    pub last_error: Option<String>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl ResourceHealth {
    pub fn new(resource: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            resource: resource.into(),
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            last_error: None,
            total_calls: 0,
            total_failures: 0,
            failure_threshold: config.failure_threshold.max(1),
            open_duration: Duration::from_secs(config.open_duration_secs),
        }
    }

    /// Check whether a call may be dispatched, moving Open -> HalfOpen once
    /// the wait has elapsed.
    pub fn is_available(&mut self) -> bool {
        match &self.state {
            CircuitState::Closed { .. } | CircuitState::HalfOpen => true,
            CircuitState::Open {
                opened_at,
                wait_duration,
            } => {
                if opened_at.elapsed() >= *wait_duration {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&mut self, error: &TaskError) {
        self.total_calls += 1;
        self.total_failures += 1;
        self.last_error = Some(error.to_string());

        match &self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let new_count = consecutive_failures + 1;
                if new_count >= self.failure_threshold {
                    tracing::warn!(
                        resource = self.resource.as_str(),
                        failures = new_count,
                        "circuit opened"
                    );
                    self.open();
                } else {
                    self.state = CircuitState::Closed {
                        consecutive_failures: new_count,
                    };
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(resource = self.resource.as_str(), "probe failed, circuit reopened");
                self.open();
            }
            CircuitState::Open { .. } => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open {
            opened_at: Instant::now(),
            wait_duration: self.open_duration,
        };
    }

    pub fn to_status(&self) -> CircuitStatus {
        let (state, consecutive_failures) = match &self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => ("closed", *consecutive_failures),
            CircuitState::Open { .. } => ("open", self.failure_threshold),
            CircuitState::HalfOpen => ("half_open", 0),
        };
        CircuitStatus {
            resource: self.resource.clone(),
            state: state.to_string(),
            consecutive_failures,
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable breaker snapshot for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub resource: String,
    pub state: String,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Decorates an invoker with a circuit breaker per resource.
pub struct CircuitBreakerInvoker<I> {
    inner: I,
    config: CircuitBreakerConfig,
    health: DashMap<String, ResourceHealth>,
}

impl<I: TaskInvoker> CircuitBreakerInvoker<I> {
    pub fn new(inner: I, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            config,
            health: DashMap::new(),
        }
    }

    /// Snapshot every breaker that has seen traffic, sorted by resource.
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let mut out: Vec<CircuitStatus> =
            self.health.iter().map(|entry| entry.to_status()).collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }

    fn admit(&self, resource: &str) -> bool {
        self.health
            .entry(resource.to_string())
            .or_insert_with(|| ResourceHealth::new(resource, &self.config))
            .is_available()
    }

    fn record(&self, resource: &str, outcome: &Result<Value, TaskError>) {
        let Some(mut health) = self.health.get_mut(resource) else {
            return;
        };
        match outcome {
            Ok(_) => health.record_success(),
            Err(err) if err.is_backend_failure() => health.record_failure(err),
            // The backend answered; only the task's logic failed.
            Err(_) => health.record_success(),
        }
    }
}

impl<I: TaskInvoker> TaskInvoker for CircuitBreakerInvoker<I> {
    fn invoke<'a>(
        &'a self,
        resource: &'a str,
        payload: Value,
        mode: InvocationMode,
    ) -> BoxFuture<'a, Result<Value, TaskError>> {
        Box::pin(async move {
            if !self.admit(resource) {
                tracing::debug!(resource, "circuit open, failing fast");
                return Err(TaskError::circuit_open(resource));
            }
            let outcome = self.inner.invoke(resource, payload, mode).await;
            self.record(resource, &outcome);
            outcome
        })
    }
}
