//! Repeat and retry control for a single step.
//!
//! A loop runs its wrapped invocation up to `count` times. Without `until` it
//! is a plain repeat and always ends [`LoopState::Satisfied`]. With `until` it
//! is a retry: the first truthy evaluation ends it `Satisfied`, and running out
//! of iterations ends it [`LoopState::Exhausted`]. Invocation errors are never
//! retried; they end the loop [`LoopState::Failed`] immediately, as does a
//! cancellation observed during the inter-iteration delay.

use std::time::Duration;

use async_trait::async_trait;
use runbook_types::{LoopCount, LoopSpec, Outcome};
use runbook_util::parse_duration;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConfigError, StepError};
use crate::expression;
use crate::store::{Store, StoreView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Pending,
    Iterating { iteration: u64 },
    Satisfied,
    Exhausted,
    Failed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Satisfied | LoopState::Exhausted | LoopState::Failed)
    }
}

/// How a loop ended.
#[derive(Debug)]
pub struct LoopReport {
    pub state: LoopState,
    /// Invocations performed, including one that failed.
    pub iterations: u64,
    /// Set when `state` is `Failed`.
    pub error: Option<StepError>,
}

/// Loop parameters frozen before the first iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLoop {
    pub count: u64,
    pub interval: Duration,
    pub until: Option<String>,
    /// Whether iterations expose `i` to expressions.
    pub indexed: bool,
}

impl ResolvedLoop {
    /// A step without a loop: one invocation, no `i`.
    pub fn single() -> Self {
        Self {
            count: 1,
            interval: Duration::ZERO,
            until: None,
            indexed: false,
        }
    }

    /// Evaluates the count expression once and parses the interval.
    ///
    /// `default_interval` applies when the loop declares none.
    pub fn resolve(spec: &LoopSpec, view: &StoreView<'_>, default_interval: Duration) -> Result<Self, StepError> {
        let count = match &spec.count {
            LoopCount::Fixed(count) => *count,
            LoopCount::Expression(source) => count_from_value(source, &expression::evaluate(source, view)?)?,
        };
        if count < 1 {
            return Err(ConfigError::InvalidLoop(format!("count must be at least 1, got {count}")).into());
        }

        let interval = match spec.interval.as_deref() {
            Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidLoop(format!("invalid interval '{raw}'")))?,
            None => default_interval,
        };

        Ok(Self {
            count,
            interval,
            until: spec.until.clone(),
            indexed: true,
        })
    }

    fn loop_index(&self, iteration: u64) -> Option<u64> {
        self.indexed.then_some(iteration)
    }
}

fn count_from_value(source: &str, value: &Value) -> Result<u64, ConfigError> {
    let integer = value
        .as_u64()
        .or_else(|| value.as_f64().filter(|float| float.fract() == 0.0 && *float >= 0.0).map(|float| float as u64));
    integer.ok_or_else(|| ConfigError::InvalidLoop(format!("count expression '{source}' yielded {value}, expected an integer")))
}

/// One invocation of the wrapped step.
#[async_trait]
pub trait Invoke: Send {
    /// Runs one iteration. `loop_index` is what expressions see as `i`.
    async fn invoke(&mut self, store: &Store, loop_index: Option<u64>) -> Result<Outcome, StepError>;
}

/// Drives one step's iterations through the [`LoopState`] machine.
#[derive(Debug)]
pub struct LoopController {
    spec: ResolvedLoop,
    state: LoopState,
}

impl LoopController {
    pub fn new(spec: ResolvedLoop) -> Self {
        Self {
            spec,
            state: LoopState::Pending,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn spec(&self) -> &ResolvedLoop {
        &self.spec
    }

    /// Runs the loop to a terminal state, writing each outcome to `store` as `current`.
    pub async fn run<I>(&mut self, invoker: &mut I, store: &mut Store, cancel: &CancellationToken) -> LoopReport
    where
        I: Invoke + ?Sized,
    {
        let mut iterations = 0;
        for iteration in 0..self.spec.count {
            if iteration > 0 && !self.spec.interval.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.finish(LoopState::Failed, iterations, Some(StepError::Cancelled)),
                    _ = tokio::time::sleep(self.spec.interval) => {}
                }
            }
            if cancel.is_cancelled() {
                return self.finish(LoopState::Failed, iterations, Some(StepError::Cancelled));
            }

            self.state = LoopState::Iterating { iteration };
            let loop_index = self.spec.loop_index(iteration);
            let outcome = match invoker.invoke(store, loop_index).await {
                Ok(outcome) => outcome,
                Err(error) => return self.finish(LoopState::Failed, iterations + 1, Some(error)),
            };
            iterations += 1;
            store.set_current(outcome);

            if let Some(until) = &self.spec.until {
                match expression::evaluate_condition(until, &store.view(loop_index)) {
                    Ok(true) => return self.finish(LoopState::Satisfied, iterations, None),
                    Ok(false) => debug!(iteration, until = %until, "loop condition not met"),
                    Err(error) => return self.finish(LoopState::Failed, iterations, Some(error.into())),
                }
            }
        }

        if self.spec.until.is_some() {
            warn!(iterations, until = ?self.spec.until, "loop exhausted without meeting its condition");
            self.finish(LoopState::Exhausted, iterations, None)
        } else {
            self.finish(LoopState::Satisfied, iterations, None)
        }
    }

    fn finish(&mut self, state: LoopState, iterations: u64, error: Option<StepError>) -> LoopReport {
        self.state = state;
        LoopReport {
            state,
            iterations,
            error,
        }
    }
}
