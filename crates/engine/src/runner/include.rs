use std::path::{Path, PathBuf};

use async_trait::async_trait;
use runbook_types::{Outcome, OutcomeKind, RunStatus};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{InvocationContext, Runner, RunnerRegistry, required_str};
use crate::error::RunnerError;
use crate::operator::Operator;

/// Deepest include chain allowed before a book is assumed to include itself.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Runs another book as a single step.
///
/// Operation: a path string, or `{ path, vars }`. Relative paths resolve
/// against the including book's directory. The nested run gets its own store
/// seeded with `vars`, shares the caller's capturers and is cancelled with
/// the caller.
pub struct IncludeRunner {
    registry: RunnerRegistry,
}

impl IncludeRunner {
    pub fn new(registry: RunnerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Runner for IncludeRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Include
    }

    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        let (raw_path, vars) = match operation {
            Value::String(path) => (path.as_str(), Map::new()),
            _ => {
                let vars = match operation.get("vars") {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(vars)) => vars.clone(),
                    Some(other) => {
                        return Err(RunnerError::InvalidOperation(format!("'vars' must be a mapping, got {other}")));
                    }
                };
                (required_str(operation, "path")?, vars)
            }
        };
        if ctx.depth + 1 > MAX_INCLUDE_DEPTH {
            return Err(RunnerError::InvalidOperation(format!(
                "include depth exceeds {MAX_INCLUDE_DEPTH} while including '{raw_path}'"
            )));
        }

        let path = resolve_include_path(ctx.book_dir, raw_path);
        let book = self.registry.loader().load(&path)?;
        debug!(path = %path.display(), depth = ctx.depth + 1, "including book");

        let operator = Operator::new(book, &self.registry, ctx.capturers.clone())
            .map_err(|error| RunnerError::Include {
                path: path.clone(),
                status: RunStatus::Aborted,
                detail: Some(error.to_string()),
            })?
            .with_vars(vars)
            .with_depth(ctx.depth + 1);
        let (result, store) = operator.run_with_store(ctx.cancel.child_token()).await;

        match result.status {
            RunStatus::Passed => {}
            RunStatus::Cancelled if ctx.cancel.is_cancelled() => return Err(RunnerError::Cancelled),
            status => {
                let detail = result.fatal.map(|fatal| fatal.message).or_else(|| {
                    result
                        .steps
                        .iter()
                        .find(|record| record.status.is_failure())
                        .and_then(|record| record.message.clone())
                });
                return Err(RunnerError::Include { path, status, detail });
            }
        }

        let data = json!({
            "vars": store.vars(),
            "steps": store.steps(),
            "status": result.status,
        });
        Ok(Outcome::new(OutcomeKind::Include, data))
    }
}

fn resolve_include_path(book_dir: &Path, raw: &str) -> PathBuf {
    if raw.contains("://") {
        return PathBuf::from(raw);
    }
    book_dir.join(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_the_book_directory() {
        assert_eq!(resolve_include_path(Path::new("books"), "child.yml"), PathBuf::from("books/child.yml"));
        assert_eq!(
            resolve_include_path(Path::new("books"), "https://example.com/b.yml"),
            PathBuf::from("https://example.com/b.yml")
        );
    }
}
