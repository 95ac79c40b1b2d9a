//! Runner invocation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Backend family that produced an [`Outcome`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Http,
    Db,
    Rpc,
    Exec,
    Include,
    Bind,
    Dump,
    Test,
    /// Produced by a runner registered directly on the runner registry.
    Custom,
}

/// Typed result of one runner invocation.
///
/// `data` is what expressions observe through `current` and `steps[i]`; its shape is owned by
/// the runner variant (for HTTP: `{ res: { status, headers, body, rawBody, cookies } }`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outcome {
    /// Backend family.
    pub kind: OutcomeKind,
    /// Structured backend data exposed to expressions.
    pub data: JsonValue,
    /// Normalized truthy/error signal (HTTP status below 400, exit code zero, ...).
    pub success: bool,
    /// Cookies set by the backend; merged into the run's cookie jar when recorded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<ResponseCookie>,
}

impl Outcome {
    /// Creates a successful outcome carrying `data`.
    pub fn new(kind: OutcomeKind, data: JsonValue) -> Self {
        Self {
            kind,
            data,
            success: true,
            cookies: Vec::new(),
        }
    }

    /// Overrides the normalized success signal.
    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Attaches response cookies.
    pub fn with_cookies(mut self, cookies: Vec<ResponseCookie>) -> Self {
        self.cookies = cookies;
        self
    }
}

/// Cookie received from a backend response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseCookie {
    pub name: String,
    pub value: String,
    /// Domain attribute; filled with the endpoint host when the response omitted it.
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl ResponseCookie {
    /// Returns whether the cookie has expired at `now`. Session cookies never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}
