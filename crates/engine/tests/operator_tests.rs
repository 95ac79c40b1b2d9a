use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use runbook_engine::{
    CaptureEvent, Capturer, Capturers, ConfigError, InvocationContext, Operator, RecordingCapturer, Runner, RunnerError, RunnerRegistry, Store,
};
use runbook_types::{Book, FatalKind, LoopSpec, Outcome, OutcomeKind, RunResult, RunStatus, StepSpec, StepStatus};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

/// Returns `{ value: n }` where n counts calls from zero.
#[derive(Default)]
struct CountingRunner {
    calls: AtomicU64,
}

impl CountingRunner {
    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for CountingRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Custom
    }

    async fn execute(&self, _ctx: &InvocationContext<'_>, _operation: &Value) -> Result<Outcome, RunnerError> {
        let value = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::new(OutcomeKind::Custom, json!({ "value": value })))
    }
}

/// Returns the interpolated operation as its data.
struct EchoRunner;

#[async_trait]
impl Runner for EchoRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Custom
    }

    async fn execute(&self, _ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        Ok(Outcome::new(OutcomeKind::Custom, operation.clone()))
    }
}

struct RefusingRunner;

#[async_trait]
impl Runner for RefusingRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Custom
    }

    async fn execute(&self, _ctx: &InvocationContext<'_>, _operation: &Value) -> Result<Outcome, RunnerError> {
        Err(RunnerError::Transport("connection refused".into()))
    }
}

struct Harness {
    counter: Arc<CountingRunner>,
    recorder: Arc<RecordingCapturer>,
    registry: RunnerRegistry,
}

impl Harness {
    fn new() -> Self {
        let counter = Arc::new(CountingRunner::default());
        let registry = RunnerRegistry::new()
            .with_runner("counter", counter.clone())
            .with_runner("echo", Arc::new(EchoRunner))
            .with_runner("refusing", Arc::new(RefusingRunner));
        Self {
            counter,
            recorder: Arc::new(RecordingCapturer::new()),
            registry,
        }
    }

    fn operator(&self, book: Book) -> Operator {
        Operator::new(book, &self.registry, Capturers::new(vec![self.recorder.clone() as Arc<dyn Capturer>])).expect("operator")
    }

    async fn run(&self, book: Book) -> (RunResult, Store) {
        self.operator(book).run_with_store(CancellationToken::new()).await
    }
}

fn step(runner: &str) -> StepSpec {
    StepSpec {
        runner: runner.into(),
        ..Default::default()
    }
}

fn book(steps: Vec<StepSpec>) -> Book {
    Book {
        description: Some("test book".into()),
        steps,
        ..Default::default()
    }
}

#[tokio::test]
async fn repeat_loop_keeps_only_the_last_iteration() {
    let harness = Harness::new();
    let looped = StepSpec {
        r#loop: Some(LoopSpec::repeat(3)),
        ..step("counter")
    };

    let (result, store) = harness.run(book(vec![looped])).await;

    assert_eq!(result.status, RunStatus::Passed);
    assert_eq!(harness.counter.calls(), 3);
    assert_eq!(store.steps()[0], json!({ "value": 2 }));
    assert_eq!(result.steps[0].iterations, 3);
}

#[tokio::test]
async fn retry_loop_stops_when_until_holds() {
    let harness = Harness::new();
    let looped = StepSpec {
        r#loop: Some(LoopSpec::retry(10, "current.value == 6")),
        ..step("counter")
    };

    let (result, store) = harness.run(book(vec![looped])).await;

    assert_eq!(result.status, RunStatus::Passed);
    assert_eq!(harness.counter.calls(), 7);
    assert_eq!(store.steps()[0]["value"], 6);
}

#[tokio::test]
async fn exhausted_loop_is_reported_apart_from_test_failures() {
    let harness = Harness::new();
    let looped = StepSpec {
        r#loop: Some(LoopSpec::retry(3, "current.value > 10")),
        test: Some("current.value == 2".into()),
        ..step("counter")
    };

    let (result, store) = harness.run(book(vec![looped, step("counter")])).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.fatal.is_none());
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::LoopExhausted);
    assert_eq!(result.steps[0].iterations, 3);
    assert_eq!(store.steps()[0]["value"], 2);
}

#[tokio::test]
async fn false_guard_skips_runner_binds_and_capture() {
    let harness = Harness::new();
    let mut guarded = StepSpec {
        r#if: Some("vars.flag == true".into()),
        ..step("counter")
    };
    guarded.bind.insert("touched".into(), "true".into());

    let (result, store) = harness.run(book(vec![step("counter"), guarded])).await;

    assert_eq!(result.status, RunStatus::Passed);
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
    assert_eq!(result.steps[1].iterations, 0);
    assert_eq!(harness.counter.calls(), 1);
    assert_eq!(store.steps()[1], Value::Null);
    assert!(store.get("touched").is_none());
    assert!(harness.recorder.events().iter().all(|event| event.step_index() == 0));
}

#[tokio::test]
async fn transport_error_halts_the_book_at_that_step() {
    let harness = Harness::new();

    let (result, store) = harness
        .run(book(vec![step("counter"), step("refusing"), step("counter")]))
        .await;

    assert_eq!(result.status, RunStatus::Aborted);
    let fatal = result.fatal.expect("fatal error");
    assert_eq!(fatal.step_index, Some(1));
    assert_eq!(fatal.kind, FatalKind::Runner);
    assert!(fatal.message.contains("connection refused"));
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[1].status, StepStatus::Error);
    assert_eq!(harness.counter.calls(), 1);
    assert_eq!(store.steps()[2], Value::Null);
}

#[tokio::test]
async fn non_blocking_steps_let_the_book_continue() {
    let harness = Harness::new();
    let failing_test = StepSpec {
        test: Some("current.value == 99".into()),
        non_blocking: true,
        ..step("counter")
    };
    let refusing = StepSpec {
        non_blocking: true,
        ..step("refusing")
    };

    let (result, store) = harness
        .run(book(vec![failing_test, refusing, step("counter")]))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.fatal.is_none());
    assert_eq!(result.steps.len(), 3);
    assert_eq!(result.steps[0].status, StepStatus::TestFailed);
    assert_eq!(result.steps[1].status, StepStatus::Error);
    assert_eq!(result.steps[2].status, StepStatus::Passed);
    assert_eq!(store.steps()[0]["value"], 0);
}

#[tokio::test]
async fn failed_test_halts_without_a_fatal_error() {
    let harness = Harness::new();
    let failing_test = StepSpec {
        test: Some("current.value == 99".into()),
        ..step("counter")
    };

    let (result, _) = harness.run(book(vec![failing_test, step("counter")])).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.fatal.is_none());
    assert_eq!(result.steps.len(), 1);
    assert_eq!(harness.counter.calls(), 1);
}

#[tokio::test]
async fn forced_books_run_every_step() {
    let harness = Harness::new();
    let mut forced = book(vec![
        StepSpec {
            test: Some("false".into()),
            ..step("counter")
        },
        step("counter"),
    ]);
    forced.force = true;

    let (result, _) = harness.run(forced).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(harness.counter.calls(), 2);
}

#[tokio::test]
async fn guard_expression_errors_are_fatal() {
    let harness = Harness::new();
    let broken = StepSpec {
        r#if: Some("vars.flag ==".into()),
        ..step("counter")
    };

    let (result, _) = harness.run(book(vec![broken])).await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.fatal.map(|fatal| fatal.kind), Some(FatalKind::Expression));
    assert_eq!(harness.counter.calls(), 0);
}

#[tokio::test]
async fn invalid_loop_counts_halt_even_non_blocking_steps() {
    let harness = Harness::new();
    let invalid = StepSpec {
        r#loop: Some(LoopSpec::repeat(0)),
        non_blocking: true,
        ..step("counter")
    };

    let (result, _) = harness.run(book(vec![invalid, step("counter")])).await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.fatal.map(|fatal| fatal.kind), Some(FatalKind::Configuration));
    assert_eq!(harness.counter.calls(), 0);
}

#[tokio::test]
async fn binds_run_in_order_and_are_idempotent() {
    let harness = Harness::new();
    let mut binding = StepSpec {
        r#loop: Some(LoopSpec::repeat(2)),
        ..step("echo")
    };
    binding.operation = json!({ "id": "${{ vars.base }}", "iteration": "${{ i }}" });
    binding.bind.insert("first".into(), "current.id + 1".into());
    binding.bind.insert("second".into(), "vars.first * 10".into());
    binding.bind.insert("last_i".into(), "i".into());

    let mut initial = book(vec![binding]);
    initial.vars.insert("base".into(), json!(4));

    let (first_result, first_store) = harness.run(initial.clone()).await;
    let (_, second_store) = harness.run(initial).await;

    assert_eq!(first_result.status, RunStatus::Passed);
    assert_eq!(first_store.steps()[0], json!({ "id": 4, "iteration": 1 }));
    assert_eq!(first_store.get("first"), Some(&json!(5)));
    assert_eq!(first_store.get("second"), Some(&json!(50)));
    assert_eq!(first_store.get("last_i"), Some(&json!(1)));
    assert_eq!(first_store.vars(), second_store.vars());
}

#[tokio::test]
async fn bind_and_test_runners_work_as_steps() {
    let harness = Harness::new();
    let mut assign = step("bind");
    assign.operation = json!({ "total": "vars.base + 1", "label": "'ok'" });
    assign.bind.insert("double".into(), "vars.total * 2".into());
    let mut check = step("test");
    check.operation = json!("vars.double == 6 && vars.label == 'ok'");

    let mut initial = book(vec![assign, check]);
    initial.vars.insert("base".into(), json!(2));
    let (result, store) = harness.run(initial).await;

    assert_eq!(result.status, RunStatus::Passed, "{result:?}");
    assert_eq!(store.get("total"), Some(&json!(3)));
    assert_eq!(store.get("double"), Some(&json!(6)));

    let mut failing = step("test");
    failing.operation = json!("vars.base == 3");
    let mut initial = book(vec![failing]);
    initial.vars.insert("base".into(), json!(2));
    let (result, _) = harness.run(initial).await;
    assert_eq!(result.steps[0].status, StepStatus::TestFailed);
}

#[tokio::test]
async fn registered_functions_are_callable_from_books() {
    let counter = Arc::new(CountingRunner::default());
    let registry = RunnerRegistry::new()
        .with_runner("counter", counter)
        .with_function("double", |arguments: &[Value]| match arguments {
            [Value::Number(number)] => Ok(json!(number.as_f64().unwrap_or_default() * 2.0)),
            _ => Err("expected one number".into()),
        });
    let mut doubled = step("counter");
    doubled.bind.insert("twice".into(), "double(vars.base)".into());
    doubled.test = Some("double(current.value) == 0".into());
    let mut broken = step("counter");
    broken.bind.insert("never".into(), "double('x')".into());
    let mut initial = book(vec![doubled, broken]);
    initial.vars.insert("base".into(), json!(21));

    let operator = Operator::new(initial, &registry, Capturers::default()).expect("operator");
    let (result, store) = operator.run_with_store(CancellationToken::new()).await;

    assert_eq!(store.get("twice"), Some(&json!(42.0)));
    assert_eq!(result.steps[0].status, StepStatus::Passed);
    assert_eq!(result.status, RunStatus::Aborted);
    let fatal = result.fatal.expect("fatal error");
    assert_eq!(fatal.kind, FatalKind::Expression);
    assert!(fatal.message.contains("double"), "{}", fatal.message);
    assert!(store.get("never").is_none());
}

#[tokio::test]
async fn operator_vars_override_book_vars() {
    let harness = Harness::new();
    let mut echo = step("echo");
    echo.operation = json!("${{ vars.target }}");
    let mut initial = book(vec![echo]);
    initial.vars.insert("target".into(), json!("book"));

    let mut overrides = Map::new();
    overrides.insert("target".into(), json!("cli"));
    let (result, store) = harness
        .operator(initial)
        .with_vars(overrides)
        .run_with_store(CancellationToken::new())
        .await;

    assert!(result.passed());
    assert_eq!(store.steps()[0], json!("cli"));
}

#[tokio::test]
async fn every_invocation_is_captured_with_its_iteration() {
    let harness = Harness::new();
    let mut looped = StepSpec {
        r#loop: Some(LoopSpec::repeat(2)),
        ..step("echo")
    };
    looped.operation = json!({ "n": "${{ i }}" });

    harness.run(book(vec![looped, step("refusing")])).await;

    let events = harness.recorder.events();
    assert_eq!(events.len(), 6);
    match &events[2] {
        CaptureEvent::Request {
            step_index,
            iteration,
            operation,
            ..
        } => {
            assert_eq!(*step_index, 0);
            assert_eq!(*iteration, 1);
            assert_eq!(operation, &json!({ "n": 1 }));
        }
        other => panic!("expected request, got {other:?}"),
    }
    assert!(matches!(
        &events[5],
        CaptureEvent::Response { step_index: 1, error: Some(_), .. }
    ));
}

#[tokio::test]
async fn cancellation_during_loop_interval_stops_the_book() {
    let harness = Harness::new();
    let looped = StepSpec {
        r#loop: Some(LoopSpec::retry(5, "current.value > 100").with_interval("10s")),
        ..step("counter")
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let (result, store) = harness
        .operator(book(vec![looped, step("counter")]))
        .run_with_store(cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::Cancelled);
    assert_eq!(result.fatal.as_ref().map(|fatal| fatal.kind), Some(FatalKind::Cancelled));
    assert_eq!(harness.counter.calls(), 1);
    assert_eq!(store.steps()[0]["value"], 0);
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = harness.operator(book(vec![step("counter")])).run(cancel).await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.steps.is_empty());
    assert_eq!(result.fatal.and_then(|fatal| fatal.step_index), None);
    assert_eq!(harness.counter.calls(), 0);
}

#[test]
fn unknown_runner_is_a_configuration_error() {
    let harness = Harness::new();
    let error = Operator::new(book(vec![step("counter"), step("missing")]), &harness.registry, Capturers::default())
        .err()
        .expect("unknown runner");
    assert_eq!(
        error,
        ConfigError::UnknownRunner {
            step_index: 1,
            runner: "missing".into()
        }
    );
}

#[test]
fn invalid_book_interval_is_a_configuration_error() {
    let harness = Harness::new();
    let mut invalid = book(vec![step("counter")]);
    invalid.interval = Some("whenever".into());
    assert!(matches!(
        Operator::new(invalid, &harness.registry, Capturers::default()),
        Err(ConfigError::InvalidInterval(_))
    ));
}
