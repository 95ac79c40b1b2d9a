//! Shared type definitions for the runbook engine and CLI.
//!
//! The book schema mirrors what the document parsing layer hands to the engine, and the result
//! records mirror what the engine hands to reporting. Both are plain serde data so they can be
//! produced and consumed without depending on the engine itself.

pub mod book;
pub mod outcome;
pub mod result;

pub use book::{
    Book, DEFAULT_LOOP_COUNT, DbRunnerConfig, HttpRunnerConfig, LoopCount, LoopSpec, RpcRunnerConfig, RunnerConfig, RunnerConfigError,
    StepSpec,
};
pub use outcome::{Outcome, OutcomeKind, ResponseCookie};
pub use result::{FatalError, FatalKind, RunResult, RunStatus, StepRecord, StepStatus};
