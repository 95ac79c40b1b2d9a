//! Observers notified around every runner invocation.
//!
//! Capturers only watch. They receive the interpolated operation before the
//! call and the outcome or error after it, and have no way to influence
//! either. A single [`Capturers`] fan-out may be shared by many concurrently
//! running books, so implementations must be `Send + Sync`.

use std::sync::{Arc, Mutex, PoisonError};

use runbook_types::Outcome;
use runbook_util::redact_sensitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::RunnerError;

/// Invocation about to be executed.
#[derive(Debug, Clone, Copy)]
pub struct CapturedRequest<'a> {
    pub book: &'a str,
    pub step_index: usize,
    pub iteration: u64,
    pub runner: &'a str,
    pub operation: &'a Value,
}

/// Invocation that has finished.
#[derive(Debug, Clone, Copy)]
pub struct CapturedResponse<'a> {
    pub book: &'a str,
    pub step_index: usize,
    pub iteration: u64,
    pub runner: &'a str,
    pub result: Result<&'a Outcome, &'a RunnerError>,
}

pub trait Capturer: Send + Sync {
    fn capture_request(&self, request: &CapturedRequest<'_>);
    fn capture_response(&self, response: &CapturedResponse<'_>);
}

/// Cheaply clonable fan-out over a fixed set of capturers.
#[derive(Clone, Default)]
pub struct Capturers {
    inner: Arc<Vec<Arc<dyn Capturer>>>,
}

impl Capturers {
    pub fn new(capturers: Vec<Arc<dyn Capturer>>) -> Self {
        Self {
            inner: Arc::new(capturers),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capture_request(&self, request: &CapturedRequest<'_>) {
        for capturer in self.inner.iter() {
            capturer.capture_request(request);
        }
    }

    pub fn capture_response(&self, response: &CapturedResponse<'_>) {
        for capturer in self.inner.iter() {
            capturer.capture_response(response);
        }
    }
}

impl std::fmt::Debug for Capturers {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Capturers").field("len", &self.inner.len()).finish()
    }
}

/// Owned copy of one capture notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaptureEvent {
    Request {
        book: String,
        step_index: usize,
        iteration: u64,
        runner: String,
        operation: Value,
    },
    Response {
        book: String,
        step_index: usize,
        iteration: u64,
        runner: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<Outcome>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl CaptureEvent {
    pub fn step_index(&self) -> usize {
        match self {
            CaptureEvent::Request { step_index, .. } | CaptureEvent::Response { step_index, .. } => *step_index,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, CaptureEvent::Request { .. })
    }
}

/// Keeps every notification in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingCapturer {
    events: Mutex<Vec<CaptureEvent>>,
}

impl RecordingCapturer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<CaptureEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, event: CaptureEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

impl Capturer for RecordingCapturer {
    fn capture_request(&self, request: &CapturedRequest<'_>) {
        self.push(CaptureEvent::Request {
            book: request.book.to_string(),
            step_index: request.step_index,
            iteration: request.iteration,
            runner: request.runner.to_string(),
            operation: request.operation.clone(),
        });
    }

    fn capture_response(&self, response: &CapturedResponse<'_>) {
        let (outcome, error) = match response.result {
            Ok(outcome) => (Some(outcome.clone()), None),
            Err(error) => (None, Some(error.to_string())),
        };
        self.push(CaptureEvent::Response {
            book: response.book.to_string(),
            step_index: response.step_index,
            iteration: response.iteration,
            runner: response.runner.to_string(),
            outcome,
            error,
        });
    }
}

/// Emits debug-level events with secrets redacted.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCapturer;

impl Capturer for TracingCapturer {
    fn capture_request(&self, request: &CapturedRequest<'_>) {
        debug!(
            book = %request.book,
            step_index = request.step_index,
            iteration = request.iteration,
            runner = %request.runner,
            operation = %redact_sensitive(&request.operation.to_string()),
            "runner request"
        );
    }

    fn capture_response(&self, response: &CapturedResponse<'_>) {
        match response.result {
            Ok(outcome) => debug!(
                book = %response.book,
                step_index = response.step_index,
                iteration = response.iteration,
                runner = %response.runner,
                success = outcome.success,
                data = %redact_sensitive(&outcome.data.to_string()),
                "runner response"
            ),
            Err(error) => debug!(
                book = %response.book,
                step_index = response.step_index,
                iteration = response.iteration,
                runner = %response.runner,
                error = %error,
                "runner error"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use runbook_types::OutcomeKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn fan_out_reaches_every_capturer() {
        let first = Arc::new(RecordingCapturer::new());
        let second = Arc::new(RecordingCapturer::new());
        let capturers = Capturers::new(vec![
            first.clone() as Arc<dyn Capturer>,
            second.clone(),
            Arc::new(TracingCapturer),
        ]);
        let operation = json!({ "path": "/ping" });
        let outcome = Outcome::new(OutcomeKind::Http, json!({ "res": { "status": 200 } }));

        capturers.capture_request(&CapturedRequest {
            book: "book.yml",
            step_index: 0,
            iteration: 0,
            runner: "req",
            operation: &operation,
        });
        capturers.capture_response(&CapturedResponse {
            book: "book.yml",
            step_index: 0,
            iteration: 0,
            runner: "req",
            result: Ok(&outcome),
        });

        for recorder in [first, second] {
            let events = recorder.events();
            assert_eq!(events.len(), 2);
            assert!(events[0].is_request());
            assert!(matches!(&events[1], CaptureEvent::Response { outcome: Some(_), error: None, .. }));
        }
    }

    #[test]
    fn errors_are_recorded_as_text() {
        let recorder = RecordingCapturer::new();
        let error = RunnerError::Transport("connection refused".into());
        recorder.capture_response(&CapturedResponse {
            book: "book.yml",
            step_index: 3,
            iteration: 1,
            runner: "req",
            result: Err(&error),
        });
        let events = recorder.events();
        assert_eq!(events[0].step_index(), 3);
        assert!(matches!(
            &events[0],
            CaptureEvent::Response { error: Some(message), .. } if message.contains("connection refused")
        ));
    }
}
