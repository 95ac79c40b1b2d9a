//! Runs shell commands with `tokio::process`.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use runbook_types::{Outcome, OutcomeKind};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{InvocationContext, Runner, optional_str, required_str};
use crate::error::RunnerError;

const DEFAULT_SHELL: &str = "sh";

/// Operation: a command string, or `{ command, stdin, shell }`.
///
/// The command runs in the book's directory. A non-zero exit code is an
/// unsuccessful outcome, not an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecRunner;

#[async_trait]
impl Runner for ExecRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Exec
    }

    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        let (command, stdin, shell) = match operation {
            Value::String(command) => (command.as_str(), None, DEFAULT_SHELL),
            _ => (
                required_str(operation, "command")?,
                optional_str(operation, "stdin")?,
                optional_str(operation, "shell")?.unwrap_or(DEFAULT_SHELL),
            ),
        };
        debug!(command = %command, shell = %shell, "spawning command");

        let mut child = Command::new(shell)
            .arg("-c")
            .arg(command)
            .current_dir(ctx.book_dir)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| RunnerError::Transport(format!("failed to spawn '{shell}': {error}")))?;

        // stdin is written while stdout and stderr are drained
        let pipe = child.stdin.take();
        let feed = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
                match pipe.write_all(input.as_bytes()).await {
                    // the command exited or closed stdin without reading all of it
                    Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {}
                    result => result?,
                }
            }
            Ok::<(), io::Error>(())
        };

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(RunnerError::Cancelled),
            (fed, output) = async move { tokio::join!(feed, child.wait_with_output()) } => {
                fed.map_err(|error| RunnerError::Transport(format!("failed to write stdin: {error}")))?;
                output.map_err(|error| RunnerError::Transport(format!("failed to wait for command: {error}")))?
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let data = json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exit_code": exit_code,
        });
        Ok(Outcome::new(OutcomeKind::Exec, data).with_success(exit_code == 0))
    }
}
