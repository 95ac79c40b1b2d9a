//! SQL runner.
//!
//! The engine does not link any database client. Drivers are registered on
//! the [`RunnerRegistry`](super::RunnerRegistry) per DSN scheme and receive
//! the query text with the run's cancellation token.

use std::sync::Arc;

use async_trait::async_trait;
use runbook_types::{Outcome, OutcomeKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use super::{InvocationContext, Runner, required_str};
use crate::error::RunnerError;

/// Rows and counters returned by a driver for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlResult {
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub rows_affected: u64,
    #[serde(default)]
    pub last_insert_id: Option<i64>,
}

#[async_trait]
pub trait SqlDriver: Send + Sync {
    /// Runs `query` against `dsn`. Must return [`RunnerError::Cancelled`] once `cancel` fires.
    async fn execute(&self, dsn: &str, query: &str, cancel: &CancellationToken) -> Result<SqlResult, RunnerError>;
}

pub struct DbRunner {
    dsn: String,
    driver: Arc<dyn SqlDriver>,
}

impl DbRunner {
    pub fn new(dsn: impl Into<String>, driver: Arc<dyn SqlDriver>) -> Self {
        Self {
            dsn: dsn.into(),
            driver,
        }
    }
}

#[async_trait]
impl Runner for DbRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Db
    }

    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        let query = match operation {
            Value::String(query) => query.as_str(),
            _ => required_str(operation, "query")?,
        };
        if query.trim().is_empty() {
            return Err(RunnerError::InvalidOperation("query is empty".to_string()));
        }

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(RunnerError::Cancelled),
            result = self.driver.execute(&self.dsn, query, ctx.cancel) => result?,
        };
        let data = json!({
            "rows": result.rows,
            "rows_affected": result.rows_affected,
            "last_insert_id": result.last_insert_id,
            "run": true,
        });
        Ok(Outcome::new(OutcomeKind::Db, data))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::runner::testing::ContextFixture;

    #[derive(Default)]
    struct EchoDriver {
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SqlDriver for EchoDriver {
        async fn execute(&self, _dsn: &str, query: &str, _cancel: &CancellationToken) -> Result<SqlResult, RunnerError> {
            self.queries.lock().expect("lock").push(query.to_string());
            let mut row = Map::new();
            row.insert("id".into(), json!(1));
            Ok(SqlResult {
                rows: vec![row],
                rows_affected: 1,
                last_insert_id: None,
            })
        }
    }

    #[tokio::test]
    async fn query_rows_become_outcome_data() {
        let driver = Arc::new(EchoDriver::default());
        let runner = DbRunner::new("sqlite://memory", driver.clone());
        let fixture = ContextFixture::new();

        let outcome = runner
            .execute(&fixture.context(), &json!({ "query": "SELECT 1 AS id" }))
            .await
            .expect("execute");

        assert_eq!(outcome.data["rows"][0]["id"], 1);
        assert_eq!(outcome.data["run"], true);
        assert_eq!(driver.queries.lock().expect("lock").as_slice(), ["SELECT 1 AS id"]);
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let runner = DbRunner::new("sqlite://memory", Arc::new(EchoDriver::default()));
        let fixture = ContextFixture::new();
        let error = runner
            .execute(&fixture.context(), &json!({ "query": "  " }))
            .await
            .expect_err("empty");
        assert!(matches!(error, RunnerError::InvalidOperation(_)));
    }
}
