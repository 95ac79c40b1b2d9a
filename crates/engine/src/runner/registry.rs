use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use runbook_types::{Book, RunnerConfig};
use serde_json::Value;
use tracing::debug;

use super::{
    BindRunner, DbRunner, DumpRunner, ExecRunner, HttpRunner, IncludeRunner, RpcRunner, RpcTransport, Runner, RunnerSet,
    SqlDriver, TestRunner,
};
use crate::error::ConfigError;
use crate::expression::Functions;
use crate::loader::{BookLoader, FsBookLoader};

/// Builds the [`RunnerSet`] for each book.
///
/// Holds the collaborators runners need (SQL drivers, the RPC transport, the
/// book loader used by includes) and any runners registered directly by name.
/// Cloning is cheap; every Operator resolves its own set from a shared
/// registry.
#[derive(Clone)]
pub struct RunnerRegistry {
    overrides: IndexMap<String, Arc<dyn Runner>>,
    sql_drivers: HashMap<String, Arc<dyn SqlDriver>>,
    rpc_transport: Option<Arc<dyn RpcTransport>>,
    loader: Arc<dyn BookLoader>,
    http_timeout: Option<Duration>,
    functions: Functions,
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self {
            overrides: IndexMap::new(),
            sql_drivers: HashMap::new(),
            rpc_transport: None,
            loader: Arc::new(FsBookLoader::default()),
            http_timeout: None,
            functions: Functions::new(),
        }
    }
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `runner` under `name`, replacing builtins and book configs of the same name.
    pub fn with_runner(mut self, name: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        self.overrides.insert(name.into(), runner);
        self
    }

    /// Registers the driver used for DSNs with the given scheme (e.g. `postgres`).
    pub fn with_sql_driver(mut self, scheme: impl Into<String>, driver: Arc<dyn SqlDriver>) -> Self {
        self.sql_drivers.insert(scheme.into().to_ascii_lowercase(), driver);
        self
    }

    pub fn with_rpc_transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.rpc_transport = Some(transport);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn BookLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Default timeout for HTTP runners whose config sets none.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Registers an expression function for every book run with this registry, included books too.
    pub fn with_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name, function);
        self
    }

    pub fn functions(&self) -> &Functions {
        &self.functions
    }

    pub fn loader(&self) -> &Arc<dyn BookLoader> {
        &self.loader
    }

    /// Resolves every runner `book` may address and checks that each step's runner exists.
    pub fn resolve(&self, book: &Book) -> Result<RunnerSet, ConfigError> {
        let mut set = RunnerSet::default();
        set.insert("exec", Arc::new(ExecRunner));
        set.insert("include", Arc::new(IncludeRunner::new(self.clone())));
        set.insert("bind", Arc::new(BindRunner));
        set.insert("dump", Arc::new(DumpRunner));
        set.insert("test", Arc::new(TestRunner));

        let book_dir = book.path.as_deref().and_then(Path::parent);
        for (name, config) in &book.runners {
            set.insert(name.clone(), self.build(name, config, book_dir)?);
        }
        for (name, runner) in &self.overrides {
            set.insert(name.clone(), Arc::clone(runner));
        }

        for (step_index, step) in book.steps.iter().enumerate() {
            if !set.contains(&step.runner) {
                return Err(ConfigError::UnknownRunner {
                    step_index,
                    runner: step.runner.clone(),
                });
            }
        }
        debug!(book = %book.label(), runners = ?set, "resolved runners");
        Ok(set)
    }

    fn build(&self, name: &str, config: &RunnerConfig, book_dir: Option<&Path>) -> Result<Arc<dyn Runner>, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidRunner {
            name: name.to_string(),
            message,
        };
        match config {
            RunnerConfig::Http(http) => {
                let http = match book_dir {
                    Some(dir) => http.clone().relative_to(dir),
                    None => http.clone(),
                };
                Ok(Arc::new(HttpRunner::new(name, &http, self.http_timeout)?))
            }
            RunnerConfig::Db(db) => {
                let scheme = db
                    .dsn
                    .split_once(':')
                    .map(|(scheme, _)| scheme.to_ascii_lowercase())
                    .ok_or_else(|| invalid(format!("DSN '{}' has no scheme", db.dsn)))?;
                let driver = self
                    .sql_drivers
                    .get(&scheme)
                    .ok_or_else(|| invalid(format!("no SQL driver registered for scheme '{scheme}'")))?;
                Ok(Arc::new(DbRunner::new(db.dsn.clone(), Arc::clone(driver))))
            }
            RunnerConfig::Rpc(rpc) => {
                let transport = self
                    .rpc_transport
                    .as_ref()
                    .ok_or_else(|| invalid("no RPC transport registered".to_string()))?;
                Ok(Arc::new(RpcRunner::new(rpc, Arc::clone(transport))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use runbook_types::{DbRunnerConfig, HttpRunnerConfig, Outcome, OutcomeKind, StepSpec};
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::RunnerError;
    use crate::runner::{InvocationContext, SqlResult};

    struct Fixed;

    #[async_trait]
    impl Runner for Fixed {
        fn kind(&self) -> OutcomeKind {
            OutcomeKind::Custom
        }

        async fn execute(&self, _ctx: &InvocationContext<'_>, _operation: &Value) -> Result<Outcome, RunnerError> {
            Ok(Outcome::new(OutcomeKind::Custom, json!(1)))
        }
    }

    struct NoRows;

    #[async_trait]
    impl SqlDriver for NoRows {
        async fn execute(&self, _dsn: &str, _query: &str, _cancel: &CancellationToken) -> Result<SqlResult, RunnerError> {
            Ok(SqlResult::default())
        }
    }

    fn book_with(runner: &str) -> Book {
        Book {
            steps: vec![StepSpec {
                runner: runner.into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn builtins_are_always_available() {
        let set = RunnerRegistry::new().resolve(&book_with("exec")).expect("resolve");
        for name in ["exec", "include", "bind", "dump", "test"] {
            assert!(set.contains(name), "missing builtin {name}");
        }
    }

    #[test]
    fn unknown_runner_names_fail_before_running() {
        let error = RunnerRegistry::new()
            .resolve(&book_with("nope"))
            .expect_err("unknown runner");
        assert_eq!(
            error,
            ConfigError::UnknownRunner {
                step_index: 0,
                runner: "nope".into()
            }
        );
    }

    #[test]
    fn overrides_replace_configured_runners() {
        let mut book = book_with("req");
        book.runners
            .insert("req".into(), RunnerConfig::from_url("http://localhost:1").expect("config"));
        let set = RunnerRegistry::new()
            .with_runner("req", Arc::new(Fixed))
            .resolve(&book)
            .expect("resolve");
        assert_eq!(set.get("req").map(|runner| runner.kind()), Some(OutcomeKind::Custom));
    }

    #[test]
    fn database_runners_need_a_driver_for_their_scheme() {
        let mut book = book_with("db");
        book.runners.insert(
            "db".into(),
            RunnerConfig::Db(DbRunnerConfig {
                dsn: "postgres://localhost/app".into(),
            }),
        );
        assert!(matches!(
            RunnerRegistry::new().resolve(&book),
            Err(ConfigError::InvalidRunner { name, .. }) if name == "db"
        ));
        let set = RunnerRegistry::new()
            .with_sql_driver("Postgres", Arc::new(NoRows))
            .resolve(&book)
            .expect("resolve");
        assert_eq!(set.get("db").map(|runner| runner.kind()), Some(OutcomeKind::Db));
    }

    #[test]
    fn http_certificates_are_read_relative_to_the_book() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut book = book_with("req");
        book.path = Some(dir.path().join("book.yml"));
        book.runners.insert(
            "req".into(),
            RunnerConfig::Http(HttpRunnerConfig {
                endpoint: "https://localhost:8443".into(),
                cacert: Some("ca.pem".into()),
                ..Default::default()
            }),
        );
        assert!(matches!(
            RunnerRegistry::new().resolve(&book),
            Err(ConfigError::InvalidRunner { message, .. })
                if message.contains(&dir.path().join("ca.pem").display().to_string())
        ));

        std::fs::write(dir.path().join("ca.pem"), "not a certificate").expect("write");
        assert!(matches!(
            RunnerRegistry::new().resolve(&book),
            Err(ConfigError::InvalidRunner { message, .. }) if message.contains("ca.pem")
        ));
    }

    #[test]
    fn http_client_options_build() {
        let mut book = book_with("req");
        book.runners.insert(
            "req".into(),
            RunnerConfig::Http(HttpRunnerConfig {
                endpoint: "https://localhost:8443".into(),
                skip_verify: true,
                follow_redirects: Some(false),
                ..Default::default()
            }),
        );
        let set = RunnerRegistry::new().resolve(&book).expect("resolve");
        assert_eq!(set.get("req").map(|runner| runner.kind()), Some(OutcomeKind::Http));

        let RunnerConfig::Http(http) = &mut book.runners["req"] else {
            panic!("expected an http runner");
        };
        http.cert = Some("client.pem".into());
        assert!(matches!(
            RunnerRegistry::new().resolve(&book),
            Err(ConfigError::InvalidRunner { message, .. }) if message.contains("together")
        ));
    }

    #[test]
    fn rpc_runners_need_a_transport() {
        let mut book = book_with("svc");
        book.runners
            .insert("svc".into(), RunnerConfig::from_url("grpc://localhost:50051").expect("config"));
        assert!(matches!(
            RunnerRegistry::new().resolve(&book),
            Err(ConfigError::InvalidRunner { message, .. }) if message.contains("transport")
        ));
    }
}
