//! Terminal run records exposed to reporting collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final classification of a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Guard evaluated falsy; the runner was never invoked.
    Skipped,
    /// Invocation succeeded and every assertion held.
    Passed,
    /// The `test` expression evaluated falsy.
    TestFailed,
    /// A retry loop used its whole budget without `until` becoming truthy.
    LoopExhausted,
    /// Expression, runner, or configuration error.
    Error,
    /// The run's cancellation scope fired while the step was in flight.
    Cancelled,
}

impl StepStatus {
    /// Assertion failures are recorded but are not errors in the process sense.
    pub fn is_assertion_failure(self) -> bool {
        matches!(self, StepStatus::TestFailed | StepStatus::LoopExhausted)
    }

    /// Returns whether the step counts against the run.
    pub fn is_failure(self) -> bool {
        !matches!(self, StepStatus::Passed | StepStatus::Skipped)
    }
}

/// Final classification of a whole book run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every executed step passed.
    Passed,
    /// At least one step failed without a fatal condition.
    Failed,
    /// A fatal error halted the book.
    Aborted,
    /// The run's cancellation scope fired.
    Cancelled,
}

/// Category of the condition that halted a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    Configuration,
    Expression,
    Runner,
    Cancelled,
}

/// First fatal condition observed in a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FatalError {
    /// Step that raised it; `None` when the run failed before any step started.
    pub step_index: Option<usize>,
    pub kind: FatalKind,
    pub message: String,
}

/// Report entry for one attempted step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRecord {
    pub index: usize,
    #[serde(default)]
    pub alias: Option<String>,
    pub runner: String,
    pub status: StepStatus,
    /// Runner invocations performed (0 when skipped).
    pub iterations: u64,
    pub duration_ms: u64,
    /// Failure detail, when any.
    #[serde(default)]
    pub message: Option<String>,
}

/// Terminal record of one book run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResult {
    /// Book label (path or description).
    pub book: String,
    pub status: RunStatus,
    /// Attempted steps in execution order; steps after a halt are absent.
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub fatal: Option<FatalError>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunResult {
    /// Returns whether the book passed.
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    /// Returns the record for `index`, when that step was attempted.
    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        self.steps.iter().find(|record| record.index == index)
    }
}
