use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indexmap::IndexSet;
use regex::Regex;
use runbook_engine::{
    BookLoader, Capturer, Capturers, FsBookLoader, RecordingCapturer, RunnerRegistry, ScenarioOptions, ScenarioResult,
    ScenarioRunner, Shard, TracingCapturer, expand_book_paths,
};
use runbook_types::{Book, RunResult, RunStatus};
use runbook_util::settings::EngineSettings;
use runbook_util::{expand_tilde, parse_duration, shorten_path};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "runbook", version, about = "Run scenario books")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run books and report their results.
    Run(RunArgs),
    /// List the books found under the given paths.
    List(ListArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Book files, directories or OS path lists.
    #[arg(required = true)]
    paths: Vec<String>,
    /// Books run at the same time (defaults to the configured value).
    #[arg(long)]
    concurrency: Option<usize>,
    /// Only run books whose path or description matches this regex.
    #[arg(long)]
    run_match: Option<String>,
    /// Run a random subset of this many books.
    #[arg(long)]
    sample: Option<usize>,
    #[arg(long, requires = "shard_index")]
    shard_n: Option<usize>,
    #[arg(long, requires = "shard_n")]
    shard_index: Option<usize>,
    /// Seed for --sample.
    #[arg(long)]
    seed: Option<u64>,
    /// Variable applied to every book, as key=value. JSON values are parsed.
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Write every captured request and response to this file as JSON.
    #[arg(long, value_name = "FILE")]
    capture: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(required = true)]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let settings = EngineSettings::load().context("failed to load settings")?;

    match cli.command {
        Command::Run(args) => run_books(args, settings).await,
        Command::List(args) => list_books(args, &settings),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn book_loader(settings: &EngineSettings) -> FsBookLoader {
    match &settings.cache_dir {
        Some(cache_dir) => FsBookLoader::new().with_cache_root(expand_tilde(&cache_dir.to_string_lossy())),
        None => FsBookLoader::new(),
    }
}

/// Expands every argument and drops duplicates, keeping first-seen order.
fn discover(paths: &[String]) -> Vec<PathBuf> {
    let discovered: IndexSet<PathBuf> = paths.iter().flat_map(|list| expand_book_paths(list)).collect();
    discovered.into_iter().collect()
}

async fn run_books(args: RunArgs, settings: EngineSettings) -> Result<ExitCode> {
    let loader = book_loader(&settings);
    let books = discover(&args.paths)
        .into_iter()
        .map(|path| {
            loader
                .load(&path)
                .map(Arc::new)
                .with_context(|| format!("failed to load {}", path.display()))
        })
        .collect::<Result<Vec<Arc<Book>>>>()?;
    if books.is_empty() {
        bail!("no books found in {}", args.paths.join(", "));
    }

    let options = scenario_options(&args, &settings)?;
    let mut registry = RunnerRegistry::new().with_loader(Arc::new(loader));
    if let Some(seconds) = settings.http_timeout_secs {
        registry = registry.with_http_timeout(Duration::from_secs(seconds));
    }

    let recorder = args.capture.as_ref().map(|_| Arc::new(RecordingCapturer::new()));
    let mut capturers: Vec<Arc<dyn Capturer>> = vec![Arc::new(TracingCapturer) as Arc<dyn Capturer>];
    if let Some(recorder) = &recorder {
        capturers.push(recorder.clone());
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling books");
            signal_token.cancel();
        }
    });

    let runner = ScenarioRunner::new(registry, Capturers::new(capturers), options)?;
    let scenario = runner.run(books, cancel).await;

    if let (Some(path), Some(recorder)) = (&args.capture, &recorder) {
        let events = serde_json::to_string_pretty(&recorder.events())?;
        tokio::fs::write(path, events)
            .await
            .with_context(|| format!("failed to write captures to {}", path.display()))?;
        info!(path = %path.display(), "captures written");
    }

    match args.format {
        OutputFormat::Text => print_text(&scenario),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&scenario.results)?),
    }

    Ok(if scenario.passed() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn scenario_options(args: &RunArgs, settings: &EngineSettings) -> Result<ScenarioOptions> {
    let run_match = args
        .run_match
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --run-match pattern")?;
    let shard = match (args.shard_n, args.shard_index) {
        (Some(n), Some(index)) => Some(Shard { n, index }),
        _ => None,
    };
    let loop_interval = match settings.default_interval.as_deref() {
        Some(raw) => parse_duration(raw).with_context(|| format!("invalid default_interval '{raw}' in settings"))?,
        None => Duration::ZERO,
    };

    let options = ScenarioOptions {
        concurrency: args.concurrency.unwrap_or(settings.concurrency),
        run_match,
        sample: args.sample,
        shard,
        seed: args.seed,
        vars: parse_vars(&args.vars)?,
        loop_interval,
    };
    options.validate()?;
    Ok(options)
}

fn parse_vars(raw: &[String]) -> Result<Map<String, Value>> {
    let mut vars = Map::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("--var expects key=value, got '{entry}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("--var has an empty key in '{entry}'");
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        vars.insert(key.to_string(), value);
    }
    Ok(vars)
}

fn print_text(scenario: &ScenarioResult) {
    for result in &scenario.results {
        print_result(result);
    }
    println!(
        "\n{} books: {} passed, {} failed, {} aborted, {} cancelled",
        scenario.results.len(),
        scenario.count(RunStatus::Passed),
        scenario.count(RunStatus::Failed),
        scenario.count(RunStatus::Aborted),
        scenario.count(RunStatus::Cancelled),
    );
}

fn print_result(result: &RunResult) {
    println!(
        "{:<9} {} ({} ms)",
        format!("{:?}", result.status).to_uppercase(),
        shorten_path(&result.book),
        result.duration_ms
    );
    for step in result.steps.iter().filter(|step| step.status.is_failure()) {
        let name = step.alias.as_deref().unwrap_or(&step.runner);
        println!(
            "  step {} ({name}): {:?}: {}",
            step.index,
            step.status,
            step.message.as_deref().unwrap_or_default()
        );
    }
    if let Some(fatal) = &result.fatal {
        println!("  {:?}: {}", fatal.kind, fatal.message);
    }
}

fn list_books(args: ListArgs, settings: &EngineSettings) -> Result<ExitCode> {
    let loader = book_loader(settings);
    let mut failed = false;
    for path in discover(&args.paths) {
        let display = shorten_path(&path.to_string_lossy());
        match loader.load(&path) {
            Ok(book) => println!(
                "{display}\t{} steps\t{}",
                book.steps.len(),
                book.description.as_deref().unwrap_or_default()
            ),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to load book");
                failed = true;
            }
        }
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use serde_json::json;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn vars_parse_json_and_fall_back_to_strings() {
        let vars = parse_vars(&["count=3".into(), "name=alice".into(), "flags={\"a\":true}".into(), "empty=".into()])
            .expect("vars");
        assert_eq!(vars["count"], json!(3));
        assert_eq!(vars["name"], json!("alice"));
        assert_eq!(vars["flags"], json!({ "a": true }));
        assert_eq!(vars["empty"], json!(""));
        assert!(parse_vars(&["novalue".into()]).is_err());
        assert!(parse_vars(&["=1".into()]).is_err());
    }

    #[test]
    fn run_flags_become_scenario_options() {
        let cli = Cli::parse_from([
            "runbook",
            "run",
            "books",
            "--concurrency",
            "4",
            "--shard-n",
            "3",
            "--shard-index",
            "1",
            "--run-match",
            "login",
            "--var",
            "env=staging",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let options = scenario_options(&args, &EngineSettings::default()).expect("options");
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.shard, Some(Shard { n: 3, index: 1 }));
        assert!(options.run_match.is_some_and(|pattern| pattern.is_match("books/login.yml")));
        assert_eq!(options.vars["env"], json!("staging"));
    }

    #[test]
    fn invalid_shards_are_rejected() {
        let cli = Cli::parse_from(["runbook", "run", "books", "--shard-n", "2", "--shard-index", "2"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(scenario_options(&args, &EngineSettings::default()).is_err());
    }
}
