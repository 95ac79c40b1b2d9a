//! Declarative book schema consumed by the engine.
//!
//! A book is the fully resolved output of the document parsing/composition layer: an ordered
//! list of steps, the runner configuration those steps address by name, and the initial
//! variables. Field order is preserved (via `IndexMap`) so runner resolution and bind
//! evaluation follow authoring order.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use url::Url;

/// Default iteration budget applied when a loop omits `count`.
pub const DEFAULT_LOOP_COUNT: u64 = 3;

/// Fully resolved book ready for execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Book {
    /// Human-readable description used by name matching and reports.
    #[serde(default, alias = "desc")]
    pub description: Option<String>,
    /// Filesystem location the book was loaded from, when known.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Runner configurations keyed by the name steps use to address them.
    #[serde(default)]
    pub runners: IndexMap<String, RunnerConfig>,
    /// Initial variables visible to expressions under `vars`.
    #[serde(default)]
    pub vars: JsonMap<String, JsonValue>,
    /// Ordered execution steps.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// When true, failing steps never halt the book (fatal conditions still do).
    #[serde(default)]
    pub force: bool,
    /// Optional delay inserted between consecutive steps (for example `"500ms"`).
    #[serde(default)]
    pub interval: Option<String>,
}

impl Book {
    /// Returns the label used to identify this book in logs and results.
    pub fn label(&self) -> String {
        if let Some(path) = &self.path {
            return path.display().to_string();
        }
        self.description.clone().unwrap_or_else(|| "unnamed".to_string())
    }
}

/// One declarative unit of work inside a book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepSpec {
    /// Optional alias addressable as `steps.<alias>` in expressions.
    #[serde(default)]
    pub alias: Option<String>,
    /// Optional descriptive copy surfaced in reports.
    #[serde(default, alias = "desc")]
    pub description: Option<String>,
    /// Name of the runner that executes this step.
    pub runner: String,
    /// Backend-specific payload. Opaque to the engine apart from template interpolation.
    #[serde(default)]
    pub operation: JsonValue,
    /// Guard expression; when it evaluates falsy the step is skipped.
    #[serde(default, rename = "if")]
    pub r#if: Option<String>,
    /// Optional repeat/retry configuration.
    #[serde(default, rename = "loop")]
    pub r#loop: Option<LoopSpec>,
    /// Post-condition evaluated once against the final outcome.
    #[serde(default)]
    pub test: Option<String>,
    /// Variables assigned after a successful run, evaluated in declaration order.
    #[serde(default)]
    pub bind: IndexMap<String, String>,
    /// When true, a failure of this step is recorded and the book continues.
    #[serde(default)]
    pub non_blocking: bool,
}

/// Repeat or retry configuration for a single step.
///
/// Accepts either a bare count (`loop: 3`), a bare count expression (`loop: "len(vars.ids)"`),
/// or the full mapping form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "LoopSpecDocument")]
pub struct LoopSpec {
    /// Number of iterations, or an expression evaluated once before the loop starts.
    pub count: LoopCount,
    /// Delay between iterations (`"10s"`, `"250ms"`); applied after the first iteration.
    pub interval: Option<String>,
    /// Retry condition; when present the loop stops as soon as it evaluates truthy.
    pub until: Option<String>,
}

impl LoopSpec {
    /// Creates a plain repeat loop that runs exactly `count` times.
    pub fn repeat(count: u64) -> Self {
        Self {
            count: LoopCount::Fixed(count),
            interval: None,
            until: None,
        }
    }

    /// Creates a retry loop bounded by `count` that stops once `until` is truthy.
    pub fn retry(count: u64, until: impl Into<String>) -> Self {
        Self {
            count: LoopCount::Fixed(count),
            interval: None,
            until: Some(until.into()),
        }
    }

    /// Returns a copy with the given inter-iteration delay.
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }
}

/// Iteration count declared by a loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum LoopCount {
    /// Literal iteration count.
    Fixed(u64),
    /// Expression evaluated once to produce the count.
    Expression(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LoopSpecDocument {
    Count(u64),
    CountExpression(String),
    Full {
        #[serde(default)]
        count: Option<LoopCount>,
        #[serde(default, alias = "every")]
        interval: Option<String>,
        #[serde(default)]
        until: Option<String>,
    },
}

impl From<LoopSpecDocument> for LoopSpec {
    fn from(document: LoopSpecDocument) -> Self {
        match document {
            LoopSpecDocument::Count(count) => LoopSpec::repeat(count),
            LoopSpecDocument::CountExpression(expression) => LoopSpec {
                count: LoopCount::Expression(expression),
                interval: None,
                until: None,
            },
            LoopSpecDocument::Full { count, interval, until } => LoopSpec {
                count: count.unwrap_or(LoopCount::Fixed(DEFAULT_LOOP_COUNT)),
                interval,
                until,
            },
        }
    }
}

/// Configuration for a named runner declared in a book.
///
/// Deserializes either from a bare URL string, where the scheme selects the variant, or from a
/// mapping tagged with `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RunnerConfigDocument")]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerConfig {
    /// HTTP API endpoint.
    Http(HttpRunnerConfig),
    /// SQL database reached through a registered driver.
    Db(DbRunnerConfig),
    /// RPC service reached through a registered transport.
    Rpc(RpcRunnerConfig),
}

impl RunnerConfig {
    /// Builds a configuration from a URL-like string by inspecting its scheme.
    pub fn from_url(raw: &str) -> Result<Self, RunnerConfigError> {
        let trimmed = raw.trim();
        let parsed = Url::parse(trimmed).map_err(|error| RunnerConfigError(format!("invalid runner url '{trimmed}': {error}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(RunnerConfig::Http(HttpRunnerConfig {
                endpoint: trimmed.to_string(),
                ..Default::default()
            })),
            "grpc" | "grpcs" => Ok(RunnerConfig::Rpc(RpcRunnerConfig {
                target: trimmed.to_string(),
                ..Default::default()
            })),
            _ => Ok(RunnerConfig::Db(DbRunnerConfig { dsn: trimmed.to_string() })),
        }
    }
}

/// HTTP runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HttpRunnerConfig {
    /// Base URL every request path is merged onto.
    pub endpoint: String,
    /// Default cookie propagation; individual requests may override it.
    #[serde(default)]
    pub use_cookie: Option<bool>,
    /// Headers attached to every request.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Accept any server certificate.
    #[serde(default)]
    pub skip_verify: bool,
    /// PEM bundle of extra root certificates.
    #[serde(default)]
    pub cacert: Option<PathBuf>,
    /// PEM client certificate; requires `key`.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// PEM private key for `cert`.
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Follow redirects (the default) or return 3xx responses as they are.
    #[serde(default)]
    pub follow_redirects: Option<bool>,
}

impl HttpRunnerConfig {
    /// Resolves relative certificate paths against `dir`, normally the book's directory.
    pub fn relative_to(mut self, dir: &Path) -> Self {
        for path in [&mut self.cacert, &mut self.cert, &mut self.key].into_iter().flatten() {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
        self
    }
}

/// Database runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DbRunnerConfig {
    /// Connection string; its scheme selects the SQL driver.
    pub dsn: String,
}

/// RPC runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RpcRunnerConfig {
    /// Target address of the service.
    pub target: String,
    /// Metadata attached to every call.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RunnerConfigDocument {
    Url(String),
    Tagged(TaggedRunnerConfig),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TaggedRunnerConfig {
    Http(HttpRunnerConfig),
    Db(DbRunnerConfig),
    Rpc(RpcRunnerConfig),
}

impl TryFrom<RunnerConfigDocument> for RunnerConfig {
    type Error = RunnerConfigError;

    fn try_from(document: RunnerConfigDocument) -> Result<Self, Self::Error> {
        match document {
            RunnerConfigDocument::Url(raw) => RunnerConfig::from_url(&raw),
            RunnerConfigDocument::Tagged(TaggedRunnerConfig::Http(config)) => Ok(RunnerConfig::Http(config)),
            RunnerConfigDocument::Tagged(TaggedRunnerConfig::Db(config)) => Ok(RunnerConfig::Db(config)),
            RunnerConfigDocument::Tagged(TaggedRunnerConfig::Rpc(config)) => Ok(RunnerConfig::Rpc(config)),
        }
    }
}

/// Error raised when a runner configuration cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfigError(pub String);

impl fmt::Display for RunnerConfigError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl std::error::Error for RunnerConfigError {}
