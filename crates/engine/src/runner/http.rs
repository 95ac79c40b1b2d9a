//! HTTP runner backed by `reqwest`.
//!
//! Operation shape:
//!
//! ```yaml
//! path: /users?page=2        # merged onto the runner endpoint, must start with '/'
//! method: post               # default GET
//! headers: { X-Trace: abc }
//! body:
//!   application/json: { name: alice }
//! use_cookie: true           # overrides the runner default
//! ```
//!
//! A bare string operation is shorthand for a GET of that path.
//!
//! The outcome exposes `res.status`, `res.headers`, `res.cookies`, the raw
//! text as `res.rawBody` and, for JSON responses only, the decoded
//! `res.body`. Other media types leave `res.body` null.
//!
//! Runner configs may set `skip_verify`, a `cacert` bundle, a client
//! `cert`/`key` pair and `follow_redirects: false`.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Certificate, Client, Identity, Method, Response};
use runbook_types::{HttpRunnerConfig, Outcome, OutcomeKind, ResponseCookie};
use runbook_util::http::{is_json_content_type, merge_url, parse_response_json_strict};
use serde_json::{Map, Value, json};
use tracing::debug;
use url::Url;

use super::{InvocationContext, Runner, optional_str, required_str, string_map};
use crate::error::{ConfigError, RunnerError};

const MEDIA_JSON: &str = "application/json";
const MEDIA_TEXT: &str = "text/plain";
const MEDIA_FORM: &str = "application/x-www-form-urlencoded";

pub struct HttpRunner {
    endpoint: Url,
    client: Client,
    headers: IndexMap<String, String>,
    use_cookie: bool,
}

impl HttpRunner {
    /// Builds a runner for `config`; `default_timeout` applies when the config sets none.
    pub fn new(name: &str, config: &HttpRunnerConfig, default_timeout: Option<Duration>) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidRunner {
            name: name.to_string(),
            message,
        };
        let endpoint = Url::parse(config.endpoint.trim())
            .map_err(|error| invalid(format!("invalid endpoint '{}': {error}", config.endpoint)))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported endpoint scheme '{}'", endpoint.scheme())));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout_secs.map(Duration::from_secs).or(default_timeout) {
            builder = builder.timeout(timeout);
        }
        if config.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(path) = &config.cacert {
            let pem = read_pem(path).map_err(&invalid)?;
            let certificates = Certificate::from_pem_bundle(&pem)
                .map_err(|error| invalid(format!("invalid CA certificate {}: {error}", path.display())))?;
            if certificates.is_empty() {
                return Err(invalid(format!("no certificates found in {}", path.display())));
            }
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }
        match (&config.cert, &config.key) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert).map_err(&invalid)?;
                pem.push(b'\n');
                pem.extend(read_pem(key).map_err(&invalid)?);
                let identity = Identity::from_pem(&pem)
                    .map_err(|error| invalid(format!("invalid client certificate {}: {error}", cert.display())))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => return Err(invalid("'cert' and 'key' must be set together".to_string())),
        }
        if config.follow_redirects == Some(false) {
            builder = builder.redirect(Policy::none());
        }
        let client = builder
            .build()
            .map_err(|error| invalid(format!("could not create the HTTP client: {error}")))?;

        Ok(Self {
            endpoint,
            client,
            headers: config.headers.clone(),
            use_cookie: config.use_cookie.unwrap_or(false),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn build_headers(&self, operation: &HttpOperation) -> Result<HeaderMap, RunnerError> {
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers.iter().chain(operation.headers.iter()) {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|error| RunnerError::InvalidOperation(format!("invalid header name '{name}': {error}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|error| RunnerError::InvalidOperation(format!("invalid value for header '{name}': {error}")))?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Runner for HttpRunner {
    fn kind(&self) -> OutcomeKind {
        OutcomeKind::Http
    }

    async fn execute(&self, ctx: &InvocationContext<'_>, operation: &Value) -> Result<Outcome, RunnerError> {
        let operation = HttpOperation::parse(operation)?;
        let url = merge_url(&self.endpoint, &operation.path).map_err(|error| RunnerError::InvalidOperation(error.to_string()))?;

        let mut headers = self.build_headers(&operation)?;
        if operation.use_cookie.unwrap_or(self.use_cookie)
            && !headers.contains_key(COOKIE)
            && let Some(cookie_header) = ctx.view.cookie_jar().header_value(&url, Utc::now())
        {
            let value = HeaderValue::from_str(&cookie_header)
                .map_err(|error| RunnerError::InvalidOperation(format!("invalid cookie header: {error}")))?;
            headers.insert(COOKIE, value);
        }

        debug!(method = %operation.method, url = %url, "sending http request");
        let mut request = self.client.request(operation.method.clone(), url.clone()).headers(headers);
        if let Some(body) = operation.body {
            let (media_type, bytes) = body.into_parts()?;
            request = request.header(CONTENT_TYPE, media_type).body(bytes);
        }

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(RunnerError::Cancelled),
            result = request.send() => result.map_err(transport_error)?,
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let response_headers = headers_to_json(&response);
        let cookies = response_cookies(&response, &url);

        let raw_body = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(RunnerError::Cancelled),
            result = response.text() => result.map_err(transport_error)?,
        };
        let body = if raw_body.is_empty() {
            Value::Null
        } else if is_json_content_type(&content_type) {
            parse_response_json_strict(&raw_body, Some(status)).map_err(|error| RunnerError::Protocol(error.to_string()))?
        } else {
            Value::Null
        };

        debug!(status, url = %url, "received http response");
        let data = json!({
            "res": {
                "status": status,
                "headers": response_headers,
                "body": body,
                "rawBody": raw_body,
                "cookies": cookies_to_json(&cookies),
            }
        });
        Ok(Outcome::new(OutcomeKind::Http, data)
            .with_success(status < 400)
            .with_cookies(cookies))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|error| format!("cannot read {}: {error}", path.display()))
}

#[derive(Debug)]
struct HttpOperation {
    path: String,
    method: Method,
    headers: IndexMap<String, String>,
    body: Option<RequestBody>,
    use_cookie: Option<bool>,
}

impl HttpOperation {
    fn parse(operation: &Value) -> Result<Self, RunnerError> {
        if let Value::String(path) = operation {
            return Ok(Self {
                path: path.clone(),
                method: Method::GET,
                headers: IndexMap::new(),
                body: None,
                use_cookie: None,
            });
        }
        if !operation.is_object() {
            return Err(RunnerError::InvalidOperation(format!("http operation must be a mapping, got {operation}")));
        }

        let path = required_str(operation, "path")?.to_string();
        let method = match optional_str(operation, "method")? {
            Some(raw) => Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
                .map_err(|_| RunnerError::InvalidOperation(format!("invalid method '{raw}'")))?,
            None => Method::GET,
        };
        let body = match operation.get("body") {
            None | Some(Value::Null) => None,
            Some(Value::Object(bodies)) => Some(RequestBody::parse(bodies)?),
            Some(other) => {
                return Err(RunnerError::InvalidOperation(format!(
                    "'body' must map a media type to a payload, got {other}"
                )));
            }
        };
        if body.is_none() && (method == Method::POST || method == Method::PATCH) {
            return Err(RunnerError::InvalidOperation(format!("{method} requests require a body")));
        }
        let use_cookie = match operation.get("use_cookie") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(flag)) => Some(*flag),
            Some(other) => return Err(RunnerError::InvalidOperation(format!("'use_cookie' must be a boolean, got {other}"))),
        };

        Ok(Self {
            path,
            method,
            headers: string_map(operation, "headers")?,
            body,
            use_cookie,
        })
    }
}

#[derive(Debug)]
struct RequestBody {
    media_type: String,
    payload: Value,
}

impl RequestBody {
    fn parse(bodies: &Map<String, Value>) -> Result<Self, RunnerError> {
        let mut entries = bodies.iter();
        let (Some((media_type, payload)), None) = (entries.next(), entries.next()) else {
            return Err(RunnerError::InvalidOperation(
                "'body' must contain exactly one media type".to_string(),
            ));
        };
        Ok(Self {
            media_type: media_type.clone(),
            payload: payload.clone(),
        })
    }

    fn into_parts(self) -> Result<(String, Vec<u8>), RunnerError> {
        let essence = self
            .media_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let bytes = if essence == MEDIA_JSON || essence.ends_with("+json") {
            serde_json::to_vec(&self.payload).map_err(|error| RunnerError::InvalidOperation(error.to_string()))?
        } else if essence == MEDIA_TEXT {
            match self.payload {
                Value::String(text) => text.into_bytes(),
                other => {
                    return Err(RunnerError::InvalidOperation(format!("{MEDIA_TEXT} body must be a string, got {other}")));
                }
            }
        } else if essence == MEDIA_FORM {
            encode_form(&self.payload)?.into_bytes()
        } else {
            return Err(RunnerError::InvalidOperation(format!("unsupported media type '{}'", self.media_type)));
        };
        Ok((self.media_type, bytes))
    }
}

fn encode_form(payload: &Value) -> Result<String, RunnerError> {
    let Value::Object(fields) = payload else {
        return Err(RunnerError::InvalidOperation(format!("{MEDIA_FORM} body must be a mapping, got {payload}")));
    };
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in fields {
        match value {
            Value::Array(items) => {
                for item in items {
                    serializer.append_pair(name, &form_scalar(name, item)?);
                }
            }
            other => {
                serializer.append_pair(name, &form_scalar(name, other)?);
            }
        }
    }
    Ok(serializer.finish())
}

fn form_scalar(name: &str, value: &Value) -> Result<String, RunnerError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Null => Ok(String::new()),
        Value::Number(_) | Value::Bool(_) => Ok(value.to_string()),
        other => Err(RunnerError::InvalidOperation(format!("form field '{name}' must be a scalar, got {other}"))),
    }
}

fn transport_error(error: reqwest::Error) -> RunnerError {
    if error.is_timeout() {
        RunnerError::Transport(format!("request timed out: {error}"))
    } else {
        RunnerError::Transport(error.to_string())
    }
}

fn headers_to_json(response: &Response) -> Value {
    let mut headers: Map<String, Value> = Map::new();
    for (name, value) in response.headers() {
        let text = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match headers.get_mut(name.as_str()) {
            Some(Value::Array(values)) => values.push(Value::String(text)),
            _ => {
                headers.insert(name.as_str().to_string(), Value::Array(vec![Value::String(text)]));
            }
        }
    }
    Value::Object(headers)
}

fn response_cookies(response: &Response, url: &Url) -> Vec<ResponseCookie> {
    let now = SystemTime::now();
    let default_domain = url.host_str().map(str::to_string);
    response
        .cookies()
        .map(|cookie| {
            let expires = cookie
                .expires()
                .or_else(|| cookie.max_age().and_then(|max_age| now.checked_add(max_age)))
                .map(DateTime::<Utc>::from);
            ResponseCookie {
                name: cookie.name().to_string(),
                value: cookie.value().to_string(),
                domain: cookie.domain().map(str::to_string).or_else(|| default_domain.clone()),
                path: cookie.path().map(str::to_string),
                expires,
            }
        })
        .collect()
}

fn cookies_to_json(cookies: &[ResponseCookie]) -> Value {
    let mut map = Map::new();
    for cookie in cookies {
        map.insert(
            cookie.name.clone(),
            json!({
                "value": cookie.value,
                "domain": cookie.domain,
                "path": cookie.path,
                "expires": cookie.expires.map(|expires| expires.to_rfc3339()),
            }),
        );
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_operation_is_a_get() {
        let operation = HttpOperation::parse(&json!("/health")).expect("parse");
        assert_eq!(operation.method, Method::GET);
        assert_eq!(operation.path, "/health");
    }

    #[test]
    fn post_without_body_is_rejected() {
        let error = HttpOperation::parse(&json!({ "path": "/users", "method": "post" })).expect_err("no body");
        assert!(matches!(error, RunnerError::InvalidOperation(message) if message.contains("require a body")));
    }

    #[test]
    fn bodies_encode_by_media_type() {
        let json_body = RequestBody {
            media_type: MEDIA_JSON.into(),
            payload: json!({ "a": 1 }),
        };
        assert_eq!(json_body.into_parts().expect("json").1, br#"{"a":1}"#.to_vec());

        let form_body = RequestBody {
            media_type: MEDIA_FORM.into(),
            payload: json!({ "name": "a b", "tag": ["x", "y"], "z": 2 }),
        };
        assert_eq!(
            String::from_utf8(form_body.into_parts().expect("form").1).expect("utf8"),
            "name=a+b&tag=x&tag=y&z=2"
        );

        let text_body = RequestBody {
            media_type: MEDIA_TEXT.into(),
            payload: json!(42),
        };
        assert!(text_body.into_parts().is_err());

        let unknown = RequestBody {
            media_type: "application/xml".into(),
            payload: json!("<a/>"),
        };
        assert!(matches!(unknown.into_parts(), Err(RunnerError::InvalidOperation(_))));
    }

    #[test]
    fn rejects_non_http_endpoints() {
        let config = HttpRunnerConfig {
            endpoint: "ftp://example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            HttpRunner::new("req", &config, None),
            Err(ConfigError::InvalidRunner { name, .. }) if name == "req"
        ));
    }
}
