use crate::capability::{AgentError, ExecutionAgent, HealthStatus, TaskContext};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use grove_core::{GroveError, GroveResult, TaskOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configuration for an [`AgentHandle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleConfig {
    /// Retry/backoff behaviour for task invocations.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Startup probe attempts before the handle reports unavailable.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
    /// Consecutive retry exhaustions before the handle degrades.
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: u32,
    /// Per-attempt invocation deadline in milliseconds.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_startup_attempts() -> u32 {
    3
}

fn default_degrade_threshold() -> u32 {
    3
}

fn default_attempt_timeout_ms() -> u64 {
    300_000
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            startup_attempts: default_startup_attempts(),
            degrade_threshold: default_degrade_threshold(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

/// Lifecycle state of an agent handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// Constructed but never started.
    Uninitialized,
    /// Startup probe in progress.
    Starting,
    /// Available for task dispatch.
    Ready,
    /// Executing a task.
    Busy,
    /// Too many consecutive exhaustions; ineligible until a probe clears it.
    Degraded,
    /// Permanently shut down with its slot.
    Terminated,
}

/// Result of [`AgentHandle::run_task`].
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Terminal outcome of the task attempt sequence.
    pub outcome: TaskOutcome,
    /// How many attempts were retried (0 = succeeded or failed first try).
    pub retries: u32,
}

/// Stateful proxy for one execution agent bound to one context slot.
///
/// The handle owns the retry/backoff loop: transient failures are retried up
/// to the policy's attempt budget, fatal failures propagate immediately, and
/// exhausting the budget repeatedly degrades the handle until a successful
/// health probe clears it.
pub struct AgentHandle {
    id: Uuid,
    slot_id: Uuid,
    agent: Arc<dyn ExecutionAgent>,
    config: HandleConfig,
    state: Mutex<HandleState>,
    consecutive_failures: AtomicU32,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl AgentHandle {
    /// Creates an uninitialized handle bound to the given slot.
    pub fn new(slot_id: Uuid, agent: Arc<dyn ExecutionAgent>, config: HandleConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            slot_id,
            agent,
            config,
            state: Mutex::new(HandleState::Uninitialized),
            consecutive_failures: AtomicU32::new(0),
            last_health_check: Mutex::new(None),
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    /// Unique identifier of this handle.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The context slot this handle is bound to.
    pub fn slot_id(&self) -> Uuid {
        self.slot_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        *self.state.lock()
    }

    /// Consecutive retry exhaustions since the last success or probe.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// When the agent was last probed, if ever.
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.lock()
    }

    /// Drives the startup probe until it succeeds or the attempt budget is
    /// exhausted, in which case the handle stays uninitialized and
    /// [`GroveError::AgentUnavailable`] is returned.
    pub async fn start(&self) -> GroveResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                HandleState::Uninitialized => *state = HandleState::Starting,
                HandleState::Ready => return Ok(()),
                other => {
                    return Err(GroveError::AgentUnavailable(format!(
                        "handle {} cannot start from state {other:?}",
                        self.id
                    )))
                }
            }
        }

        let attempts = self.config.startup_attempts.max(1);
        let mut last_err: Option<AgentError> = None;
        for attempt in 0..attempts {
            match self.agent.start().await {
                Ok(()) => {
                    self.set_state(HandleState::Ready);
                    *self.last_health_check.lock() = Some(Utc::now());
                    info!(handle = %self.id, slot = %self.slot_id, "agent handle ready");
                    return Ok(());
                }
                Err(e) => {
                    warn!(handle = %self.id, attempt, error = %e, "startup probe failed");
                    if attempt + 1 < attempts {
                        self.do_sleep(self.config.retry.delay_ms(attempt)).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        self.set_state(HandleState::Uninitialized);
        Err(GroveError::AgentUnavailable(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "startup attempts exhausted".to_string()),
        ))
    }

    /// Executes one task with retry and backoff.
    ///
    /// Only transient failures consume the retry budget; a fatal failure
    /// ends the sequence immediately. Never panics and never returns an
    /// `Err`: every failure mode is expressed in the returned outcome.
    pub async fn run_task(
        &self,
        prompt: &str,
        context: &TaskContext,
        cancel: &CancellationToken,
    ) -> RunReport {
        {
            let mut state = self.state.lock();
            if *state != HandleState::Ready {
                return RunReport {
                    outcome: TaskOutcome::Failed {
                        reason: format!("agent handle not ready ({:?})", *state),
                    },
                    retries: 0,
                };
            }
            *state = HandleState::Busy;
        }

        let attempt_timeout = Duration::from_millis(self.config.attempt_timeout_ms);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_err: Option<AgentError> = None;
        let mut attempts_made: u32 = 0;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                self.set_state(HandleState::Ready);
                return RunReport {
                    outcome: TaskOutcome::Failed {
                        reason: "cancelled".to_string(),
                    },
                    retries: attempt,
                };
            }

            attempts_made += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(HandleState::Ready);
                    return RunReport {
                        outcome: TaskOutcome::Failed {
                            reason: "cancelled".to_string(),
                        },
                        retries: attempt,
                    };
                }
                invoked = tokio::time::timeout(attempt_timeout, self.agent.invoke(prompt, context)) => {
                    match invoked {
                        Ok(inner) => inner,
                        Err(_) => Err(AgentError::timeout(format!(
                            "attempt exceeded {} ms",
                            self.config.attempt_timeout_ms
                        ))),
                    }
                }
            };

            match result {
                Ok(response) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.set_state(HandleState::Ready);
                    return RunReport {
                        outcome: TaskOutcome::Succeeded {
                            result: response.output,
                        },
                        retries: attempt,
                    };
                }
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.config.retry.delay_ms(attempt);
                    warn!(
                        handle = %self.id,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "transient agent failure, backing off"
                    );
                    last_err = Some(e);
                    self.do_sleep(delay).await;
                }
                Err(e) => {
                    if !e.is_transient() {
                        warn!(handle = %self.id, attempt, error = %e, "fatal agent failure");
                    }
                    last_err = Some(e);
                    break;
                }
            }
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.degrade_threshold.max(1) {
            self.set_state(HandleState::Degraded);
            warn!(
                handle = %self.id,
                consecutive_failures = failures,
                "agent handle degraded"
            );
        } else {
            self.set_state(HandleState::Ready);
        }

        RunReport {
            outcome: TaskOutcome::Failed {
                reason: last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "attempts exhausted".to_string()),
            },
            retries: attempts_made.saturating_sub(1),
        }
    }

    /// Probes the agent. A healthy answer clears a degraded handle back to
    /// ready and zeroes the consecutive-failure counter.
    pub async fn health_check(&self) -> HealthStatus {
        let status = self.agent.probe().await;
        *self.last_health_check.lock() = Some(Utc::now());
        if status == HealthStatus::Healthy {
            let mut state = self.state.lock();
            if *state == HandleState::Degraded {
                *state = HandleState::Ready;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                info!(handle = %self.id, "degraded handle cleared by health probe");
            }
        }
        status
    }

    /// Permanently shuts the handle down; used when its slot is released for
    /// good.
    pub fn terminate(&self) {
        self.set_state(HandleState::Terminated);
    }

    fn set_state(&self, next: HandleState) {
        *self.state.lock() = next;
    }

    /// Perform a sleep for the given duration in milliseconds.
    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
