use async_trait::async_trait;
use runbook_types::{Outcome, OutcomeKind};
use serde_json::{Value, json};
use tracing::info;

use super::{InvocationContext, Runner, optional_str, required_str};
use crate::error::RunnerError;
use crate::expression;

/// Diagnostic runner that prints or saves the value of an expression.
///
/// Operation: an expression string, or `{ expr, out }` where `out` is a file
/// path relative to the book's directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumpRunner;

#[async_trait]
impl Runner for DumpRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Dump
    }

    fn interpolates(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        let (source, out) = match operation {
            Value::String(source) => (source.as_str(), None),
            _ => (required_str(operation, "expr")?, optional_str(operation, "out")?),
        };
        let value = expression::evaluate(source, &ctx.view)?;
        let rendered = serde_json::to_string_pretty(&value).map_err(|error| RunnerError::Protocol(error.to_string()))?;

        match out {
            Some(out) => {
                let target = ctx.book_dir.join(out);
                tokio::fs::write(&target, format!("{rendered}\n"))
                    .await
                    .map_err(|error| RunnerError::Transport(format!("failed to write {}: {error}", target.display())))?;
                info!(step_index = ctx.step_index, path = %target.display(), "dumped value");
            }
            None => info!(step_index = ctx.step_index, expression = %source, "{rendered}"),
        }

        Ok(Outcome::new(OutcomeKind::Dump, json!({ "dumped": value })))
    }
}
