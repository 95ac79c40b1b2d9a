//! Error taxonomy shared across the engine.
//!
//! Configuration problems are detected before or at first use and always halt a
//! book. Expression and runner errors fail the step that raised them and halt
//! the book unless the step is non-blocking. Cancellation is its own
//! classification so reports can tell it apart from ordinary failures.

use std::path::PathBuf;

use runbook_types::{FatalKind, RunStatus};
use thiserror::Error;

/// Failure raised while parsing or evaluating an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("{function}(): {message}")]
    Function { function: String, message: String },
}

impl ExpressionError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub(crate) fn function(function: &str, message: impl Into<String>) -> Self {
        Self::Function {
            function: function.to_string(),
            message: message.into(),
        }
    }
}

/// Failure reported by a runner's `execute`.
///
/// Application-level failures (an HTTP 500, a non-zero exit code) are not
/// errors; they come back as an [`Outcome`](runbook_types::Outcome).
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The backend could not be reached or the exchange broke off.
    #[error("transport error: {0}")]
    Transport(String),
    /// The backend answered with something that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The operation payload is malformed for this runner.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invocation cancelled")]
    Cancelled,
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    /// A nested book did not pass.
    #[error("included book {} finished {status:?}{}", .path.display(), detail_suffix(.detail))]
    Include {
        path: PathBuf,
        status: RunStatus,
        detail: Option<String>,
    },
    #[error(transparent)]
    Load(#[from] BookLoadError),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_deref().map(|detail| format!(": {detail}")).unwrap_or_default()
}

/// Problem with a book's or scenario's configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("step {step_index} references unknown runner '{runner}'")]
    UnknownRunner { step_index: usize, runner: String },
    #[error("runner '{name}' is misconfigured: {message}")]
    InvalidRunner { name: String, message: String },
    #[error("invalid loop: {0}")]
    InvalidLoop(String),
    #[error("invalid interval '{0}'")]
    InvalidInterval(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Reason a single step ended in `Error` or `Cancelled`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Returns whether the error stems from the run's cancellation scope.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled | StepError::Runner(RunnerError::Cancelled))
    }

    /// Configuration errors and cancellation stop the book even for non-blocking steps.
    pub fn always_halts(&self) -> bool {
        self.is_cancelled() || matches!(self, StepError::Config(_))
    }

    pub fn fatal_kind(&self) -> FatalKind {
        match self {
            _ if self.is_cancelled() => FatalKind::Cancelled,
            StepError::Expression(_) | StepError::Runner(RunnerError::Expression(_)) => FatalKind::Expression,
            StepError::Config(_) => FatalKind::Configuration,
            StepError::Runner(_) => FatalKind::Runner,
            StepError::Cancelled => FatalKind::Cancelled,
        }
    }
}

/// Failure to load a book from disk or from the fetch cache.
#[derive(Debug, Error)]
pub enum BookLoadError {
    #[error(transparent)]
    Read(#[from] anyhow::Error),
    #[error("failed to parse book {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("remote book '{location}' is not present in the cache")]
    NotCached { location: String },
}
