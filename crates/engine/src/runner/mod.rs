//! # Runners
//!
//! A runner drives one backend. Steps address runners by name; the names are
//! resolved once per Operator into a [`RunnerSet`] before any step executes,
//! so an unknown name is a configuration error rather than a mid-run surprise.
//!
//! Runners report backend-level failures (connection refused, malformed
//! payloads) as [`RunnerError`]s. Application-level failures such as an HTTP
//! 500 or a non-zero exit code are ordinary [`Outcome`]s with
//! `success == false`; whether they fail the step is up to the step's test.
//!
//! Every runner must observe the cancellation token in its context and return
//! [`RunnerError::Cancelled`] promptly once it fires.

mod assertion;
mod bind;
mod db;
mod dump;
mod exec;
mod http;
mod include;
mod registry;
mod rpc;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use runbook_types::{Outcome, OutcomeKind};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub use assertion::TestRunner;
pub use bind::BindRunner;
pub use db::{DbRunner, SqlDriver, SqlResult};
pub use dump::DumpRunner;
pub use exec::ExecRunner;
pub use http::HttpRunner;
pub use include::{IncludeRunner, MAX_INCLUDE_DEPTH};
pub use registry::RunnerRegistry;
pub use rpc::{RpcRequest, RpcResponse, RpcRunner, RpcTransport};

use crate::capture::Capturers;
use crate::error::RunnerError;
use crate::store::StoreView;

/// Everything a runner may observe while executing one invocation.
pub struct InvocationContext<'a> {
    /// Read-only projection of the calling run's store.
    pub view: StoreView<'a>,
    pub cancel: &'a CancellationToken,
    /// Directory of the book being run; relative paths in operations resolve against it.
    pub book_dir: &'a Path,
    pub step_index: usize,
    /// Include nesting depth of the calling book (0 for a top-level run).
    pub depth: usize,
    pub capturers: &'a Capturers,
}

/// Backend driver invoked by the Operator for each step iteration.
#[async_trait]
pub trait Runner: Send + Sync {
    fn kind(&self) -> OutcomeKind;

    /// Executes the step's operation, interpolated unless [`Runner::interpolates`] says otherwise.
    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError>;

    /// Whether `${{ }}` templates in the operation are expanded before `execute`.
    ///
    /// Runners whose operation is itself made of expressions evaluate it on their own.
    fn interpolates(&self) -> bool {
        true
    }

    /// Test expression contributed by the raw (uninterpolated) operation, if any.
    fn test_expression<'o>(&self, _operation: &'o Value) -> Option<&'o str> {
        None
    }
}

/// Runners resolved for one book, addressed by the names its steps use.
#[derive(Clone, Default)]
pub struct RunnerSet {
    runners: IndexMap<String, Arc<dyn Runner>>,
}

impl RunnerSet {
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Runner>> {
        self.runners.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, runner: Arc<dyn Runner>) {
        self.runners.insert(name.into(), runner);
    }
}

impl std::fmt::Debug for RunnerSet {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_list().entries(self.runners.keys()).finish()
    }
}

/// Reads an optional string field, rejecting other types.
pub(crate) fn optional_str<'v>(operation: &'v Value, field: &str) -> Result<Option<&'v str>, RunnerError> {
    match operation.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(other) => Err(RunnerError::InvalidOperation(format!(
            "'{field}' must be a string, got {other}"
        ))),
    }
}

/// Reads a required string field.
pub(crate) fn required_str<'v>(operation: &'v Value, field: &str) -> Result<&'v str, RunnerError> {
    optional_str(operation, field)?.ok_or_else(|| RunnerError::InvalidOperation(format!("missing '{field}'")))
}

/// Reads an optional `name -> string` mapping, rendering scalar values as text.
pub(crate) fn string_map(operation: &Value, field: &str) -> Result<IndexMap<String, String>, RunnerError> {
    match operation.get(field) {
        None | Some(Value::Null) => Ok(IndexMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| match value {
                Value::String(text) => Ok((key.clone(), text.clone())),
                Value::Number(_) | Value::Bool(_) => Ok((key.clone(), value.to_string())),
                other => Err(RunnerError::InvalidOperation(format!(
                    "'{field}.{key}' must be a scalar, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(RunnerError::InvalidOperation(format!("'{field}' must be a mapping, got {other}"))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;

    use super::*;
    use crate::store::Store;

    /// Owns what an [`InvocationContext`] borrows.
    pub(crate) struct ContextFixture {
        pub store: Store,
        pub cancel: CancellationToken,
        pub book_dir: PathBuf,
        pub capturers: Capturers,
    }

    impl ContextFixture {
        pub(crate) fn new() -> Self {
            Self {
                store: Store::new(serde_json::Map::new(), 1),
                cancel: CancellationToken::new(),
                book_dir: std::env::temp_dir(),
                capturers: Capturers::default(),
            }
        }

        pub(crate) fn context(&self) -> InvocationContext<'_> {
            InvocationContext {
                view: self.store.view(None),
                cancel: &self.cancel,
                book_dir: &self.book_dir,
                step_index: 0,
                depth: 0,
                capturers: &self.capturers,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn string_map_renders_scalars_and_rejects_nested_values() {
        let headers = string_map(&json!({ "headers": { "X-Id": 7, "Accept": "json" } }), "headers").expect("map");
        assert_eq!(headers["X-Id"], "7");
        assert_eq!(headers["Accept"], "json");
        assert!(string_map(&json!({ "headers": { "X": [1] } }), "headers").is_err());
        assert!(string_map(&json!({}), "headers").expect("absent").is_empty());
    }

    #[test]
    fn required_fields_report_their_name() {
        let error = required_str(&json!({}), "path").expect_err("missing");
        assert_eq!(error.to_string(), "invalid operation: missing 'path'");
        assert!(optional_str(&json!({ "path": 1 }), "path").is_err());
    }
}
