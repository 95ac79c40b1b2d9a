//! RPC runner delegating to a registered [`RpcTransport`].

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use runbook_types::{Outcome, OutcomeKind, RpcRunnerConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{InvocationContext, Runner, required_str, string_map};
use crate::error::RunnerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Fully qualified method, e.g. `package.Service/Method`.
    pub method: String,
    pub headers: IndexMap<String, String>,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Status code; zero means OK.
    pub status: i32,
    #[serde(default)]
    pub headers: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub message: Value,
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, target: &str, request: RpcRequest, cancel: &CancellationToken) -> Result<RpcResponse, RunnerError>;
}

pub struct RpcRunner {
    target: String,
    headers: IndexMap<String, String>,
    transport: Arc<dyn RpcTransport>,
}

impl RpcRunner {
    pub fn new(config: &RpcRunnerConfig, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            target: config.target.clone(),
            headers: config.headers.clone(),
            transport,
        }
    }
}

#[async_trait]
impl Runner for RpcRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Rpc
    }

    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        let method = required_str(operation, "method")?.to_string();
        let mut headers = self.headers.clone();
        headers.extend(string_map(operation, "headers")?);
        let message = operation.get("message").cloned().unwrap_or(Value::Null);

        let request = RpcRequest { method, headers, message };
        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(RunnerError::Cancelled),
            result = self.transport.call(&self.target, request, ctx.cancel) => result?,
        };

        let data = json!({
            "res": {
                "status": response.status,
                "headers": response.headers,
                "message": response.message,
            }
        });
        Ok(Outcome::new(OutcomeKind::Rpc, data).with_success(response.status == 0))
    }
}
