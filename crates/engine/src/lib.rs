//! # Runbook Engine
//!
//! Executes books: ordered lists of steps, each dispatched to a named runner
//! (HTTP, SQL, RPC, shell, nested book, ...), optionally guarded, looped,
//! asserted and bound into variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use runbook_engine::{Capturers, FsBookLoader, BookLoader, Operator, RunnerRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let book = FsBookLoader::new().load("books/login.yml".as_ref())?;
//! let operator = Operator::new(book, &RunnerRegistry::new(), Capturers::default())?;
//! let result = operator.run(CancellationToken::new()).await;
//! println!("{}: {:?}", result.book, result.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`store`**: per-run variables, step slots, `current` and cookies
//! - **`expression`**: the expression language and `${{ }}` interpolation
//! - **`runner`**: the runner trait, its builtin variants and the registry
//! - **`loop_control`**: repeat/retry state machine for one step
//! - **`operator`**: runs one book's steps in order
//! - **`scenario`**: selects books and runs them concurrently
//! - **`capture`**: observers notified around every runner invocation
//! - **`loader`**: reads books from disk or the remote-book cache

pub mod capture;
pub mod cookie;
pub mod error;
pub mod expression;
pub mod loader;
pub mod loop_control;
pub mod operator;
pub mod runner;
pub mod scenario;
pub mod store;

pub use capture::{CaptureEvent, CapturedRequest, CapturedResponse, Capturer, Capturers, RecordingCapturer, TracingCapturer};
pub use cookie::CookieJar;
pub use error::{BookLoadError, ConfigError, ExpressionError, RunnerError, StepError};
pub use expression::Functions;
pub use loader::{BookLoader, FsBookLoader, expand_book_paths};
pub use loop_control::{LoopController, LoopReport, LoopState, ResolvedLoop};
pub use operator::Operator;
pub use runner::{InvocationContext, Runner, RunnerRegistry, RunnerSet, SqlDriver, SqlResult, RpcTransport};
pub use scenario::{ScenarioOptions, ScenarioResult, ScenarioRunner, Shard};
pub use store::{Store, StoreView};
