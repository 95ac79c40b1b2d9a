use async_trait::async_trait;
use runbook_types::{Outcome, OutcomeKind};
use serde_json::Value;

use super::{InvocationContext, Runner};
use crate::error::RunnerError;

/// Assertion-only runner. Its operation string is the step's test expression.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestRunner;

#[async_trait]
impl Runner for TestRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Test
    }

    fn interpolates(&self) -> bool {
        false
    }

    fn test_expression<'o>(&self, operation: &'o Value) -> Option<&'o str> {
        operation.as_str()
    }

    async fn execute(&self, _ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        if !operation.is_string() {
            return Err(RunnerError::InvalidOperation(format!(
                "test operation must be an expression string, got {operation}"
            )));
        }
        Ok(Outcome::new(OutcomeKind::Test, Value::Null))
    }
}
