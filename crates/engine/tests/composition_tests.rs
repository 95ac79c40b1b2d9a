use std::fs;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use runbook_engine::{
    BookLoader, Capturers, FsBookLoader, Operator, RunnerRegistry, ScenarioOptions, ScenarioRunner, expand_book_paths,
};
use runbook_types::{FatalKind, RunStatus, StepStatus};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_book(dir: &Path, name: &str, yaml: &str) {
    fs::write(dir.join(name), yaml).expect("write book");
}

fn book_dir() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    write_book(
        dir.path(),
        "child.yml",
        r#"
desc: greeter
vars:
  name: nobody
steps:
  - runner: bind
    operation:
      greeting: "'hello ' + vars.name"
"#,
    );
    write_book(
        dir.path(),
        "broken_child.yml",
        r#"
desc: broken
steps:
  - runner: test
    operation: "1 == 2"
"#,
    );
    dir
}

#[tokio::test]
async fn include_runs_child_with_overriding_vars() {
    let dir = book_dir();
    write_book(
        dir.path(),
        "parent.yml",
        r#"
desc: parent
vars:
  who: alice
steps:
  - runner: include
    operation:
      path: child.yml
      vars:
        name: "${{ vars.who }}"
    test: current.status == 'passed'
    bind:
      message: current.vars.greeting
"#,
    );

    let book = FsBookLoader::new().load(&dir.path().join("parent.yml")).expect("load");
    let (result, store) = Operator::new(book, &RunnerRegistry::new(), Capturers::default())
        .expect("operator")
        .run_with_store(CancellationToken::new())
        .await;

    assert!(result.passed(), "{result:?}");
    assert_eq!(store.get("message"), Some(&json!("hello alice")));
    assert_eq!(store.steps()[0]["vars"]["name"], "alice");
}

#[tokio::test]
async fn failing_include_fails_the_calling_step() {
    let dir = book_dir();
    write_book(
        dir.path(),
        "parent.yml",
        r#"
steps:
  - runner: include
    operation: broken_child.yml
  - runner: bind
    operation:
      unreachable: "true"
"#,
    );

    let book = FsBookLoader::new().load(&dir.path().join("parent.yml")).expect("load");
    let result = Operator::new(book, &RunnerRegistry::new(), Capturers::default())
        .expect("operator")
        .run(CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.steps.len(), 1);
    assert_eq!(result.steps[0].status, StepStatus::Error);
    let fatal = result.fatal.expect("fatal");
    assert_eq!(fatal.kind, FatalKind::Runner);
    assert!(fatal.message.contains("broken_child.yml"), "{}", fatal.message);
    assert!(fatal.message.contains("Failed"), "{}", fatal.message);
}

#[tokio::test]
async fn missing_include_is_a_runner_error() {
    let dir = book_dir();
    write_book(
        dir.path(),
        "parent.yml",
        r#"
steps:
  - runner: include
    operation: nowhere.yml
"#,
    );

    let book = FsBookLoader::new().load(&dir.path().join("parent.yml")).expect("load");
    let result = Operator::new(book, &RunnerRegistry::new(), Capturers::default())
        .expect("operator")
        .run(CancellationToken::new())
        .await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.steps[0].status, StepStatus::Error);
}

fn scenario_books() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    write_book(
        dir.path(),
        "01_pass.yml",
        r#"
desc: passes
steps:
  - runner: bind
    operation:
      total: vars.base + 1
  - runner: test
    operation: vars.total == 11
"#,
    );
    write_book(
        dir.path(),
        "02_fail.yml",
        r#"
desc: fails
steps:
  - runner: test
    operation: vars.base == 0
"#,
    );
    write_book(
        dir.path(),
        "03_misconfigured.yml",
        r#"
desc: misconfigured
steps:
  - runner: ghost
"#,
    );
    fs::write(dir.path().join("notes.txt"), "not a book").expect("write notes");
    dir
}

fn load_all(dir: &Path) -> Vec<Arc<runbook_types::Book>> {
    let loader = FsBookLoader::new();
    expand_book_paths(&dir.to_string_lossy())
        .iter()
        .map(|path| Arc::new(loader.load(path).expect("load")))
        .collect()
}

#[tokio::test]
async fn scenario_reports_each_book_in_selection_order() {
    let dir = scenario_books();
    let books = load_all(dir.path());
    assert_eq!(books.len(), 3);

    let mut vars = serde_json::Map::new();
    vars.insert("base".into(), json!(10));
    let options = ScenarioOptions {
        concurrency: 2,
        vars,
        ..Default::default()
    };
    let runner = ScenarioRunner::new(RunnerRegistry::new(), Capturers::default(), options).expect("scenario");
    let scenario = runner.run(books, CancellationToken::new()).await;

    let statuses: Vec<RunStatus> = scenario.results.iter().map(|result| result.status).collect();
    assert_eq!(statuses, vec![RunStatus::Passed, RunStatus::Failed, RunStatus::Aborted]);
    assert!(scenario.results[0].book.ends_with("01_pass.yml"));
    assert_eq!(
        scenario.results[2].fatal.as_ref().map(|fatal| fatal.kind),
        Some(FatalKind::Configuration)
    );
    assert!(!scenario.passed());
    assert_eq!(scenario.count(RunStatus::Failed), 1);
}

#[tokio::test]
async fn scenario_filters_before_running() {
    let dir = scenario_books();
    let options = ScenarioOptions {
        run_match: Some(Regex::new("pass").expect("regex")),
        vars: serde_json::Map::from_iter([("base".to_string(), json!(10))]),
        ..Default::default()
    };
    let runner = ScenarioRunner::new(RunnerRegistry::new(), Capturers::default(), options).expect("scenario");
    let scenario = runner.run(load_all(dir.path()), CancellationToken::new()).await;

    assert_eq!(scenario.results.len(), 1);
    assert!(scenario.passed());
}

#[tokio::test]
async fn cancelled_scenario_cancels_every_book() {
    let dir = scenario_books();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = ScenarioOptions {
        run_match: Some(Regex::new("pass|fail").expect("regex")),
        ..Default::default()
    };
    let runner = ScenarioRunner::new(RunnerRegistry::new(), Capturers::default(), options).expect("scenario");
    let scenario = runner.run(load_all(dir.path()), cancel).await;

    assert_eq!(scenario.count(RunStatus::Cancelled), 2);
}
