//! Resilient admission gate for model calls.
//!
//! Every model invocation made during a run goes through
//! [`ResilientCallGate::submit`]. The gate waits for a concurrency permit,
//! dispatches the call, classifies failures and retries with capped exponential
//! backoff. Callers only ever see `Some(text)` or `None`.
//!
//! Rate limiting is tracked per run in [`ResilienceState`]: after
//! `degrade_threshold` consecutive rate-limit failures the run switches to
//! degraded mode and admission drops to `degraded_permits` concurrent calls.
//! Degraded mode is never left within a run. Permits held at the moment of the
//! switch are retired as they come back.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::config::GateConfig;

/// Admission mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Degraded,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::Degraded => write!(f, "degraded"),
        }
    }
}

/// How a failed call is treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// Retryable; counts towards degraded mode.
    RateLimit,
    /// Retryable: timeout, 5xx, connection failure.
    Transient,
    /// Aborts the call without retrying.
    Fatal,
}

/// Classifies a client error for the retry loop.
pub fn classify(err: &AnthropicError) -> CallFailure {
    match err {
        AnthropicError::RateLimited { .. } => CallFailure::RateLimit,
        AnthropicError::ApiError { status, message } => {
            if *status == 429 || mentions_rate_limit(message) {
                CallFailure::RateLimit
            } else if *status >= 500 || *status == 408 {
                CallFailure::Transient
            } else {
                CallFailure::Fatal
            }
        }
        AnthropicError::NetworkError(e) => {
            if mentions_rate_limit(&e.to_string()) {
                CallFailure::RateLimit
            } else if e.is_timeout()
                || e.is_connect()
                || e.status().is_some_and(|s| s.is_server_error())
            {
                CallFailure::Transient
            } else {
                CallFailure::Fatal
            }
        }
        AnthropicError::EmptyResponse => CallFailure::Fatal,
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("too many requests")
}

/// Point-in-time copy of the run counters, for logs and the report metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResilienceSnapshot {
    pub consecutive_failure_count: u32,
    pub total_calls: u64,
    pub total_retries: u64,
    pub mode: Mode,
}

/// Run-scoped resilience counters and admission permits.
///
/// Create one per pipeline run and pass it by reference to every
/// [`ResilientCallGate::submit`] of that run.
pub struct ResilienceState {
    semaphore: Semaphore,
    /// Permits still to retire after the switch to degraded mode.
    debt: AtomicUsize,
    normal_permits: usize,
    degraded_permits: usize,
    threshold: u32,
    is_degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    total_calls: AtomicU64,
    total_retries: AtomicU64,
}

impl ResilienceState {
    pub fn new(config: &GateConfig) -> Self {
        let normal_permits = config.normal_permits.max(1);
        let degraded_permits = config.degraded_permits.clamp(1, normal_permits);
        Self {
            semaphore: Semaphore::new(normal_permits),
            debt: AtomicUsize::new(0),
            normal_permits,
            degraded_permits,
            threshold: config.degrade_threshold.max(1),
            is_degraded: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> Mode {
        if self.is_degraded.load(Ordering::SeqCst) {
            Mode::Degraded
        } else {
            Mode::Normal
        }
    }

    /// Concurrent calls admitted under the current mode.
    pub fn permits(&self) -> usize {
        match self.mode() {
            Mode::Normal => self.normal_permits,
            Mode::Degraded => self.degraded_permits,
        }
    }

    pub fn snapshot(&self) -> ResilienceSnapshot {
        ResilienceSnapshot {
            consecutive_failure_count: self.consecutive_failures.load(Ordering::SeqCst),
            total_calls: self.total_calls.load(Ordering::SeqCst),
            total_retries: self.total_retries.load(Ordering::SeqCst),
            mode: self.mode(),
        }
    }

    async fn admit(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        loop {
            let permit = self.semaphore.acquire().await?;
            if self.take_debt() {
                permit.forget();
                continue;
            }
            return Ok(permit);
        }
    }

    fn take_debt(&self) -> bool {
        self.debt
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1))
            .is_ok()
    }

    fn shrink_to_degraded(&self) {
        let excess = self.normal_permits - self.degraded_permits;
        let retired = self.semaphore.forget_permits(excess);
        self.debt.fetch_add(excess - retired, Ordering::SeqCst);
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_rate_limit(&self) {
        let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold && !self.is_degraded.swap(true, Ordering::SeqCst) {
            self.shrink_to_degraded();
            warn!(
                consecutive_rate_limits = count,
                permits = self.degraded_permits,
                "switching to degraded mode for the rest of the run"
            );
        }
    }
}

/// One model call: prompts plus a label used in logs.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub label: String,
    pub system: String,
    pub user: String,
}

impl CallRequest {
    pub fn new(label: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Wraps a [`MessageSender`] with admission control and retries.
pub struct ResilientCallGate<S> {
    sender: S,
    config: GateConfig,
    model: String,
    max_tokens: u32,
}

impl<S: MessageSender> ResilientCallGate<S> {
    pub fn new(sender: S, config: GateConfig, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            sender,
            config,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Runs one call to completion or exhaustion. Never returns an error.
    pub async fn submit(&self, state: &ResilienceState, request: &CallRequest) -> Option<String> {
        state.total_calls.fetch_add(1, Ordering::SeqCst);
        let req = MessagesRequest::single_turn(
            &self.model,
            self.max_tokens,
            &request.system,
            &request.user,
        );
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                state.total_retries.fetch_add(1, Ordering::SeqCst);
            }

            let permit = match state.admit().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(call = %request.label, error = %e, "admission closed");
                    return None;
                }
            };
            debug!(call = %request.label, attempt, mode = %state.mode(), "dispatching");
            let result = self.sender.send_message(&req).await;
            drop(permit);

            let err = match result {
                Ok(resp) => {
                    state.record_success();
                    let text = resp.text();
                    if text.trim().is_empty() {
                        warn!(call = %request.label, "model returned blank text");
                        return None;
                    }
                    return Some(text);
                }
                Err(e) => e,
            };

            let failure = classify(&err);
            match failure {
                CallFailure::Fatal => {
                    warn!(call = %request.label, attempt, error = %err, "fatal call error, not retrying");
                    return None;
                }
                CallFailure::RateLimit => state.record_rate_limit(),
                CallFailure::Transient => {}
            }

            if attempt == max_attempts {
                warn!(call = %request.label, attempt, error = %err, "call failed on final attempt");
                break;
            }

            let delay_ms = self.config.delay_for_attempt(attempt);
            info!(
                call = %request.label,
                attempt,
                max_attempts,
                delay_ms,
                kind = ?failure,
                error = %err,
                "retrying model call"
            );
            sleep(Duration::from_millis(delay_ms)).await;
        }

        warn!(call = %request.label, max_attempts, "retries exhausted");
        None
    }
}
