use async_trait::async_trait;
use runbook_types::{Outcome, OutcomeKind};
use serde_json::{Map, Value};

use super::{InvocationContext, Runner};
use crate::error::RunnerError;
use crate::expression;

/// Pure variable assignment.
///
/// The operation maps variable names to expressions. The evaluated mapping is
/// returned as outcome data and the Operator assigns it to `vars` once the
/// step passes. Non-string values are assigned verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindRunner;

#[async_trait]
impl Runner for BindRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Bind
    }

    fn interpolates(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        let Value::Object(assignments) = operation else {
            return Err(RunnerError::InvalidOperation(format!(
                "bind operation must map names to expressions, got {operation}"
            )));
        };

        let mut bound = Map::with_capacity(assignments.len());
        for (name, value) in assignments {
            let value = match value {
                Value::String(expression) => expression::evaluate(expression, &ctx.view)?,
                other => other.clone(),
            };
            bound.insert(name.clone(), value);
        }
        Ok(Outcome::new(OutcomeKind::Bind, Value::Object(bound)))
    }
}
