//! Running many books at once.
//!
//! The scenario runner picks which books to run (name match, shard, sample),
//! then runs each as an independent [`Operator`] with a bounded number in
//! flight. Books share nothing mutable apart from the capturers; each gets its
//! own store and a child of the scenario's cancellation token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use regex::Regex;
use runbook_types::{Book, FatalError, FatalKind, RunResult, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::Capturers;
use crate::error::ConfigError;
use crate::operator::Operator;
use crate::runner::RunnerRegistry;

/// Keep every `n`th book starting at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub n: usize,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    /// Books run at the same time.
    pub concurrency: usize,
    /// Keep books whose path or description matches.
    pub run_match: Option<Regex>,
    /// Keep a random subset of this size.
    pub sample: Option<usize>,
    pub shard: Option<Shard>,
    /// Seed for sampling; entropy when absent.
    pub seed: Option<u64>,
    /// Variables applied over every book's own `vars`.
    pub vars: Map<String, Value>,
    /// Delay between loop iterations for loops that declare none.
    pub loop_interval: Duration,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            run_match: None,
            sample: None,
            shard: None,
            seed: None,
            vars: Map::new(),
            loop_interval: Duration::ZERO,
        }
    }
}

impl ScenarioOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency < 1 {
            return Err(ConfigError::InvalidOption("concurrency must be at least 1".to_string()));
        }
        if self.sample == Some(0) {
            return Err(ConfigError::InvalidOption("sample must be at least 1".to_string()));
        }
        if let Some(shard) = self.shard {
            if shard.n < 1 {
                return Err(ConfigError::InvalidOption("shard count must be at least 1".to_string()));
            }
            if shard.index >= shard.n {
                return Err(ConfigError::InvalidOption(format!(
                    "shard index {} must be below shard count {}",
                    shard.index, shard.n
                )));
            }
        }
        Ok(())
    }

    /// Applies match, shard and sample, in that order, preserving input order.
    pub fn select(&self, books: Vec<Arc<Book>>) -> Vec<Arc<Book>> {
        let mut selected: Vec<Arc<Book>> = match &self.run_match {
            Some(pattern) => books.into_iter().filter(|book| book_matches(book, pattern)).collect(),
            None => books,
        };

        if let Some(shard) = self.shard.filter(|shard| shard.n > 0) {
            selected = selected
                .into_iter()
                .enumerate()
                .filter(|(position, _)| position % shard.n == shard.index)
                .map(|(_, book)| book)
                .collect();
        }

        if let Some(sample) = self.sample
            && sample < selected.len()
        {
            let mut rng = match self.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut keep = rand::seq::index::sample(&mut rng, selected.len(), sample).into_vec();
            keep.sort_unstable();
            let mut keep = keep.into_iter().peekable();
            selected = selected
                .into_iter()
                .enumerate()
                .filter_map(|(position, book)| {
                    if keep.peek() == Some(&position) {
                        keep.next();
                        Some(book)
                    } else {
                        None
                    }
                })
                .collect();
        }

        selected
    }
}

fn book_matches(book: &Book, pattern: &Regex) -> bool {
    let path_matches = book
        .path
        .as_ref()
        .is_some_and(|path| pattern.is_match(&path.to_string_lossy()));
    path_matches || book.description.as_deref().is_some_and(|description| pattern.is_match(description))
}

/// Results of a scenario, in selection order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub results: Vec<RunResult>,
}

impl ScenarioResult {
    pub fn passed(&self) -> bool {
        self.results.iter().all(RunResult::passed)
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.results.iter().filter(|result| result.status == status).count()
    }
}

pub struct ScenarioRunner {
    registry: RunnerRegistry,
    capturers: Capturers,
    options: ScenarioOptions,
}

impl ScenarioRunner {
    pub fn new(registry: RunnerRegistry, capturers: Capturers, options: ScenarioOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            registry,
            capturers,
            options,
        })
    }

    pub fn options(&self) -> &ScenarioOptions {
        &self.options
    }

    /// Selects and runs `books`. A book whose runners cannot be resolved is
    /// reported as aborted without affecting the others.
    pub async fn run(&self, books: Vec<Arc<Book>>, cancel: CancellationToken) -> ScenarioResult {
        let selected = self.options.select(books);
        info!(
            books = selected.len(),
            concurrency = self.options.concurrency,
            "scenario started"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut tasks = JoinSet::new();
        let mut slots: Vec<Option<RunResult>> = vec![None; selected.len()];

        for (position, book) in selected.iter().enumerate() {
            let operator = match Operator::new(Arc::clone(book), &self.registry, self.capturers.clone()) {
                Ok(operator) => operator
                    .with_vars(self.options.vars.clone())
                    .with_loop_interval(self.options.loop_interval),
                Err(error) => {
                    warn!(book = %book.label(), error = %error, "book is misconfigured");
                    slots[position] = Some(aborted(book, FatalKind::Configuration, error.to_string()));
                    continue;
                }
            };
            let semaphore = Arc::clone(&semaphore);
            let child = cancel.child_token();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (position, None);
                };
                (position, Some(operator.run(child).await))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => slots[position] = result,
                Err(error) => warn!(error = %error, "book task failed"),
            }
        }

        let results: Vec<RunResult> = slots
            .into_iter()
            .zip(&selected)
            .map(|(slot, book)| {
                slot.unwrap_or_else(|| aborted(book, FatalKind::Runner, "book task did not complete".to_string()))
            })
            .collect();
        let scenario = ScenarioResult { results };
        info!(
            passed = scenario.count(RunStatus::Passed),
            failed = scenario.count(RunStatus::Failed),
            aborted = scenario.count(RunStatus::Aborted),
            cancelled = scenario.count(RunStatus::Cancelled),
            "scenario finished"
        );
        scenario
    }
}

fn aborted(book: &Book, kind: FatalKind, message: String) -> RunResult {
    RunResult {
        book: book.label(),
        status: RunStatus::Aborted,
        steps: Vec::new(),
        fatal: Some(FatalError {
            step_index: None,
            kind,
            message,
        }),
        started_at: Utc::now(),
        duration_ms: 0,
    }
}
