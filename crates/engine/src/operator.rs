//! Per-book step execution.
//!
//! An [`Operator`] runs one book's steps strictly in order against its own
//! [`Store`]. Each step goes through the same sequence: guard, loop, record
//! the final outcome into `steps[index]`, test, then binds. Recording happens
//! for failed steps too, so later steps and reports can inspect what a
//! failing step returned.
//!
//! Halting rules:
//! - expression, runner and configuration errors halt the book (`Aborted`)
//!   unless the step is non-blocking or the book is forced; configuration
//!   errors halt regardless
//! - test failures and loop exhaustion halt the book (`Failed`) unless the
//!   step is non-blocking or the book is forced
//! - cancellation always halts (`Cancelled`)

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use runbook_types::{Book, FatalError, FatalKind, Outcome, OutcomeKind, RunResult, RunStatus, StepRecord, StepSpec, StepStatus};
use runbook_util::parse_duration;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CapturedRequest, CapturedResponse, Capturers};
use crate::error::{ConfigError, RunnerError, StepError};
use crate::expression::{self, Functions};
use crate::loop_control::{Invoke, LoopController, LoopState, ResolvedLoop};
use crate::runner::{InvocationContext, Runner, RunnerRegistry, RunnerSet};
use crate::store::Store;

pub struct Operator {
    book: Arc<Book>,
    label: String,
    book_dir: PathBuf,
    runners: RunnerSet,
    functions: Functions,
    capturers: Capturers,
    vars: Map<String, Value>,
    step_interval: Duration,
    loop_interval: Duration,
    depth: usize,
}

impl Operator {
    /// Resolves the book's runners and validates its step interval.
    pub fn new(book: impl Into<Arc<Book>>, registry: &RunnerRegistry, capturers: Capturers) -> Result<Self, ConfigError> {
        let book = book.into();
        let runners = registry.resolve(&book)?;
        let step_interval = match book.interval.as_deref() {
            Some(raw) => parse_duration(raw).ok_or_else(|| ConfigError::InvalidInterval(raw.to_string()))?,
            None => Duration::ZERO,
        };
        let book_dir = book
            .path
            .as_deref()
            .and_then(Path::parent)
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            label: book.label(),
            book,
            book_dir,
            runners,
            functions: registry.functions().clone(),
            capturers,
            vars: Map::new(),
            step_interval,
            loop_interval: Duration::ZERO,
            depth: 0,
        })
    }

    /// Variables applied over the book's own `vars` before the first step.
    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Delay between loop iterations for loops that declare none.
    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    /// Include nesting depth of this run.
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn book(&self) -> &Book {
        &self.book
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn run(self, cancel: CancellationToken) -> RunResult {
        self.run_with_store(cancel).await.0
    }

    /// Runs the book and also returns the final store.
    pub async fn run_with_store(self, cancel: CancellationToken) -> (RunResult, Store) {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut store = Store::for_book(&self.book).with_functions(self.functions.clone());
        for (key, value) in &self.vars {
            store.set(key.clone(), value.clone());
        }

        info!(book = %self.label, steps = self.book.steps.len(), depth = self.depth, "book started");
        let mut records = Vec::with_capacity(self.book.steps.len());
        let mut halted: Option<(RunStatus, Option<FatalError>)> = None;
        let mut any_failed = false;

        for (index, step) in self.book.steps.iter().enumerate() {
            if index > 0 && !self.step_interval.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.step_interval) => {}
                }
            }
            if cancel.is_cancelled() {
                halted = Some((RunStatus::Cancelled, Some(cancelled_between_steps())));
                break;
            }

            let step_started = Instant::now();
            let run = self.run_step(index, step, &mut store, &cancel).await;
            store.clear_current();

            let message = run.message.clone().or_else(|| run.error.as_ref().map(ToString::to_string));
            records.push(StepRecord {
                index,
                alias: step.alias.clone(),
                runner: step.runner.clone(),
                status: run.status,
                iterations: run.iterations,
                duration_ms: elapsed_ms(step_started),
                message: message.clone(),
            });
            log_step(&self.label, index, step, run.status, message.as_deref());

            let tolerated = step.non_blocking || self.book.force;
            match run.status {
                StepStatus::Passed | StepStatus::Skipped => {}
                StepStatus::TestFailed | StepStatus::LoopExhausted => {
                    any_failed = true;
                    if !tolerated {
                        halted = Some((RunStatus::Failed, None));
                        break;
                    }
                }
                StepStatus::Error => {
                    let always_halts = run.error.as_ref().is_some_and(StepError::always_halts);
                    if always_halts || !tolerated {
                        let kind = run.error.as_ref().map_or(FatalKind::Runner, StepError::fatal_kind);
                        halted = Some((
                            RunStatus::Aborted,
                            Some(FatalError {
                                step_index: Some(index),
                                kind,
                                message: message.unwrap_or_default(),
                            }),
                        ));
                        break;
                    }
                    any_failed = true;
                }
                StepStatus::Cancelled => {
                    halted = Some((
                        RunStatus::Cancelled,
                        Some(FatalError {
                            step_index: Some(index),
                            kind: FatalKind::Cancelled,
                            message: message.unwrap_or_else(|| "cancelled".to_string()),
                        }),
                    ));
                    break;
                }
            }
        }

        let (status, fatal) = halted.unwrap_or(if any_failed {
            (RunStatus::Failed, None)
        } else {
            (RunStatus::Passed, None)
        });
        let result = RunResult {
            book: self.label.clone(),
            status,
            steps: records,
            fatal,
            started_at,
            duration_ms: elapsed_ms(started),
        };
        match status {
            RunStatus::Passed => info!(book = %self.label, duration_ms = result.duration_ms, "book passed"),
            _ => warn!(book = %self.label, status = ?status, fatal = ?result.fatal, "book did not pass"),
        }
        (result, store)
    }

    async fn run_step(&self, index: usize, step: &StepSpec, store: &mut Store, cancel: &CancellationToken) -> StepRun {
        if let Some(guard) = &step.r#if {
            match expression::evaluate_condition(guard, &store.view(None)) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(book = %self.label, step_index = index, guard = %guard, "guard is false; skipping step");
                    return StepRun::skipped();
                }
                Err(error) => return StepRun::failed(0, error.into()),
            }
        }

        let Some(runner) = self.runners.get(&step.runner) else {
            let error = ConfigError::UnknownRunner {
                step_index: index,
                runner: step.runner.clone(),
            };
            return StepRun::failed(0, error.into());
        };

        let spec = match &step.r#loop {
            Some(spec) => match ResolvedLoop::resolve(spec, &store.view(None), self.loop_interval) {
                Ok(resolved) => resolved,
                Err(error) => return StepRun::failed(0, error),
            },
            None => ResolvedLoop::single(),
        };

        let mut controller = LoopController::new(spec);
        let mut invoker = StepInvoker {
            operator: self,
            runner: Arc::clone(runner),
            step,
            index,
            cancel,
        };
        let report = controller.run(&mut invoker, store, cancel).await;
        store.record_current(index);

        let iterations = report.iterations;
        if report.state == LoopState::Failed {
            let error = report.error.unwrap_or(StepError::Cancelled);
            return StepRun::failed(iterations, error);
        }

        let last_index = controller.spec().indexed.then(|| iterations.saturating_sub(1));
        let exhausted = report.state == LoopState::Exhausted;
        let tests = step
            .test
            .as_deref()
            .into_iter()
            .chain(runner.test_expression(&step.operation));
        let mut failed_test = None;
        for test in tests {
            match expression::evaluate_condition(test, &store.view(last_index)) {
                Ok(true) => {}
                Ok(false) => {
                    failed_test = Some(test);
                    break;
                }
                Err(error) => return StepRun::failed(iterations, error.into()),
            }
        }

        if exhausted {
            let mut message = format!("loop exhausted after {iterations} iteration(s) without meeting its condition");
            if let Some(test) = failed_test {
                message.push_str(&format!("; test failed: {test}"));
            }
            return StepRun::assertion(StepStatus::LoopExhausted, iterations, message);
        }
        if let Some(test) = failed_test {
            return StepRun::assertion(StepStatus::TestFailed, iterations, format!("test failed: {test}"));
        }

        let bound = store
            .current_outcome()
            .filter(|outcome| outcome.kind == OutcomeKind::Bind)
            .and_then(|outcome| outcome.data.as_object().cloned());
        for (name, value) in bound.into_iter().flatten() {
            store.set(name, value);
        }
        for (name, source) in &step.bind {
            match expression::evaluate(source, &store.view(last_index)) {
                Ok(value) => store.set(name.clone(), value),
                Err(error) => return StepRun::failed(iterations, error.into()),
            }
        }

        StepRun {
            status: StepStatus::Passed,
            iterations,
            error: None,
            message: None,
        }
    }
}

/// Result of one step before it is turned into a [`StepRecord`].
struct StepRun {
    status: StepStatus,
    iterations: u64,
    error: Option<StepError>,
    message: Option<String>,
}

impl StepRun {
    fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            iterations: 0,
            error: None,
            message: None,
        }
    }

    fn failed(iterations: u64, error: StepError) -> Self {
        let status = if error.is_cancelled() {
            StepStatus::Cancelled
        } else {
            StepStatus::Error
        };
        Self {
            status,
            iterations,
            error: Some(error),
            message: None,
        }
    }

    fn assertion(status: StepStatus, iterations: u64, message: String) -> Self {
        Self {
            status,
            iterations,
            error: None,
            message: Some(message),
        }
    }
}

/// Runs one iteration of a step: interpolate, capture, execute, capture.
struct StepInvoker<'a> {
    operator: &'a Operator,
    runner: Arc<dyn Runner>,
    step: &'a StepSpec,
    index: usize,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl Invoke for StepInvoker<'_> {
    async fn invoke(&mut self, store: &Store, loop_index: Option<u64>) -> Result<Outcome, StepError> {
        let view = store.view(loop_index);
        let operation = if self.runner.interpolates() {
            Cow::Owned(expression::interpolate(&self.step.operation, &view)?)
        } else {
            Cow::Borrowed(&self.step.operation)
        };
        let iteration = loop_index.unwrap_or(0);
        let capturers = &self.operator.capturers;
        capturers.capture_request(&CapturedRequest {
            book: &self.operator.label,
            step_index: self.index,
            iteration,
            runner: &self.step.runner,
            operation: &operation,
        });

        let ctx = InvocationContext {
            view,
            cancel: self.cancel,
            book_dir: &self.operator.book_dir,
            step_index: self.index,
            depth: self.operator.depth,
            capturers,
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunnerError::Cancelled),
            result = self.runner.execute(&ctx, &operation) => result,
        };

        capturers.capture_response(&CapturedResponse {
            book: &self.operator.label,
            step_index: self.index,
            iteration,
            runner: &self.step.runner,
            result: result.as_ref(),
        });
        result.map_err(StepError::from)
    }
}

fn cancelled_between_steps() -> FatalError {
    FatalError {
        step_index: None,
        kind: FatalKind::Cancelled,
        message: "run cancelled before the next step started".to_string(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn log_step(book: &str, index: usize, step: &StepSpec, status: StepStatus, message: Option<&str>) {
    if status.is_failure() {
        warn!(
            book = %book,
            step_index = index,
            alias = ?step.alias,
            runner = %step.runner,
            status = ?status,
            message = message.unwrap_or_default(),
            "step failed"
        );
    } else {
        debug!(book = %book, step_index = index, runner = %step.runner, status = ?status, "step finished");
    }
}
