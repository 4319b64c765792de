// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Saga dispose for multi-step persistent transitions.
//!
//! A persistent stage that has to touch several sibling services (for example
//! crediting a ledger and then moving the order state) builds a
//! [`SagaDispose`] from ordered [`SagaStep`]s. Steps run one at a time, each
//! bounded by the dispose request timeout. When a step fails, every step that
//! already completed is compensated in reverse order.
//!
//! The request timeout is deliberately separate from the subsystem
//! cancellation token: a dispose that started is allowed to finish or roll
//! back even while the subsystem shuts down.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};

/// Default per-step request timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Compensation state of a saga step.
///
/// Tracks the lifecycle of compensation for a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationState {
    /// No compensation defined for this step, or the step never ran.
    None,
    /// Compensation may be needed (step completed successfully).
    Pending,
    /// Compensation is currently in progress.
    Triggered,
    /// Compensation completed successfully.
    Completed,
    /// Compensation failed.
    Failed,
}

impl CompensationState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Triggered => "triggered",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

type StepFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn boxed<F, Fut>(f: F) -> StepFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// One action of a saga, with an optional compensating action.
pub struct SagaStep {
    name: String,
    action: StepFn,
    compensate: Option<StepFn>,
    state: CompensationState,
}

impl SagaStep {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: boxed(action),
            compensate: None,
            state: CompensationState::None,
        }
    }

    /// Action that undoes this step after a later step failed.
    pub fn with_compensate<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate = Some(boxed(compensate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CompensationState {
        self.state
    }
}

impl std::fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("compensable", &self.compensate.is_some())
            .field("state", &self.state)
            .finish()
    }
}

/// Ordered set of saga steps executed as one unit.
#[derive(Debug)]
pub struct SagaDispose {
    name: String,
    timeout: Duration,
    steps: Vec<SagaStep>,
}

impl SagaDispose {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_STEP_TIMEOUT,
            steps: Vec::new(),
        }
    }

    /// Request timeout applied to every action and compensation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Append a step.
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    /// Run every step in order, compensating on failure.
    ///
    /// Returns `SagaFailed` or `SagaTimeout` for the failing step once all
    /// completed steps were rolled back, or `CompensationFailed` when a
    /// rollback itself failed. Remaining compensations still run in that case.
    pub async fn execute(&mut self) -> Result<()> {
        let timeout = self.timeout;

        for index in 0..self.steps.len() {
            let step = &mut self.steps[index];
            debug!(saga = %self.name, step = %step.name, "Executing saga step");

            match run_bounded(&step.action, &step.name, timeout).await {
                Ok(()) => {
                    if step.compensate.is_some() {
                        step.state = CompensationState::Pending;
                    }
                }
                Err(failure) => {
                    warn!(
                        saga = %self.name,
                        step = %step.name,
                        error = %failure,
                        "Saga step failed, compensating"
                    );
                    let failed_step = step.name.clone();
                    self.compensate(index, &failed_step).await?;
                    return Err(failure);
                }
            }
        }

        info!(saga = %self.name, steps = self.steps.len(), "Saga completed");
        Ok(())
    }

    async fn compensate(&mut self, failed_index: usize, failed_step: &str) -> Result<()> {
        let timeout = self.timeout;
        let mut first_error = None;

        for step in self.steps[..failed_index].iter_mut().rev() {
            let Some(compensate) = step.compensate.as_ref() else {
                continue;
            };
            step.state = CompensationState::Triggered;

            match run_bounded(compensate, &step.name, timeout).await {
                Ok(()) => {
                    step.state = CompensationState::Completed;
                    debug!(saga = %self.name, step = %step.name, "Step compensated");
                }
                Err(e) => {
                    step.state = CompensationState::Failed;
                    error!(
                        saga = %self.name,
                        step = %step.name,
                        failed_step = %failed_step,
                        error = %e,
                        "Compensation failed"
                    );
                    first_error.get_or_insert(PipelineError::CompensationFailed {
                        step: step.name.clone(),
                        failed_step: failed_step.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_bounded(f: &StepFn, step: &str, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, f()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(match e {
            e @ (PipelineError::SagaFailed { .. }
            | PipelineError::SagaTimeout { .. }
            | PipelineError::CompensationFailed { .. }) => e,
            other => PipelineError::SagaFailed {
                step: step.to_string(),
                reason: other.to_string(),
            },
        }),
        Err(_) => Err(PipelineError::SagaTimeout {
            step: step.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, entry: &str) -> impl Fn() -> BoxFuture<'static, Result<()>> + use<> {
        let log = log.clone();
        let entry = entry.to_string();
        move || {
            let log = log.clone();
            let entry = entry.clone();
            Box::pin(async move {
                log.lock().unwrap().push(entry);
                Ok(())
            })
        }
    }

    fn failing(reason: &'static str) -> impl Fn() -> BoxFuture<'static, Result<()>> {
        move || Box::pin(async move { Err(PipelineError::Service(reason.to_string())) })
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let log: Log = Arc::default();
        let mut saga = SagaDispose::new("order_paid")
            .step(SagaStep::new("ledger", recording(&log, "ledger")).with_compensate(recording(&log, "undo ledger")))
            .step(SagaStep::new("order", recording(&log, "order")));

        saga.execute().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["ledger", "order"]);
        assert_eq!(saga.steps()[0].state(), CompensationState::Pending);
        assert_eq!(saga.steps()[1].state(), CompensationState::None);
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse() {
        let log: Log = Arc::default();
        let mut saga = SagaDispose::new("order_paid")
            .step(SagaStep::new("a", recording(&log, "a")).with_compensate(recording(&log, "undo a")))
            .step(SagaStep::new("b", recording(&log, "b")).with_compensate(recording(&log, "undo b")))
            .step(SagaStep::new("c", failing("order service down")).with_compensate(recording(&log, "undo c")));

        let err = saga.execute().await.unwrap_err();
        assert!(matches!(err, PipelineError::SagaFailed { ref step, .. } if step == "c"));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "undo b", "undo a"]);
        assert_eq!(saga.steps()[0].state(), CompensationState::Completed);
        assert_eq!(saga.steps()[1].state(), CompensationState::Completed);
        assert_eq!(saga.steps()[2].state(), CompensationState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let log: Log = Arc::default();
        let mut saga = SagaDispose::new("order_paid")
            .with_timeout(Duration::from_millis(50))
            .step(SagaStep::new("a", recording(&log, "a")).with_compensate(recording(&log, "undo a")))
            .step(SagaStep::new("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }));

        let err = saga.execute().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SagaTimeout { ref step, timeout_ms: 50 } if step == "slow"
        ));
        assert_eq!(*log.lock().unwrap(), vec!["a", "undo a"]);
    }

    #[tokio::test]
    async fn test_compensation_failure_is_reported() {
        let log: Log = Arc::default();
        let mut saga = SagaDispose::new("order_paid")
            .step(SagaStep::new("a", recording(&log, "a")).with_compensate(recording(&log, "undo a")))
            .step(SagaStep::new("b", recording(&log, "b")).with_compensate(failing("ledger locked")))
            .step(SagaStep::new("c", failing("boom")));

        let err = saga.execute().await.unwrap_err();
        match err {
            PipelineError::CompensationFailed { step, failed_step, .. } => {
                assert_eq!(step, "b");
                assert_eq!(failed_step, "c");
            }
            other => panic!("unexpected error: {other}"),
        }
        // The earlier step is still rolled back.
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "undo a"]);
        assert_eq!(saga.steps()[1].state(), CompensationState::Failed);
        assert_eq!(saga.steps()[0].state(), CompensationState::Completed);
    }

    #[test]
    fn test_compensation_state_as_str() {
        assert_eq!(CompensationState::Pending.as_str(), "pending");
        assert_eq!(CompensationState::Failed.as_str(), "failed");
    }
}
