//! Per-run cookie jar.
//!
//! Cookies are keyed by normalized host and matched heuristically: a request
//! host matches a jar host when it ends with it, and a cookie applies when the
//! request path starts with the cookie path. The `localhost` key only matches
//! loopback request hosts. Expired cookies are skipped silently.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use runbook_types::ResponseCookie;
use tracing::debug;
use url::Url;

/// Accumulated cookies for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieJar {
    hosts: BTreeMap<String, IndexMap<String, ResponseCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges cookies into the jar; a later cookie with the same name and host replaces the earlier one.
    ///
    /// Cookies without a domain are dropped; runners fill the domain from their endpoint before
    /// handing cookies over.
    pub fn store<'c>(&mut self, cookies: impl IntoIterator<Item = &'c ResponseCookie>) {
        for cookie in cookies {
            let Some(domain) = cookie.domain.as_deref() else {
                debug!(cookie = %cookie.name, "dropping cookie without domain");
                continue;
            };
            let host = normalize_host(domain);
            if host.is_empty() {
                continue;
            }
            self.hosts.entry(host).or_default().insert(cookie.name.clone(), cookie.clone());
        }
    }

    /// Returns the cookies applicable to `url` at `now`, in jar order.
    pub fn matching(&self, url: &Url, now: DateTime<Utc>) -> Vec<&ResponseCookie> {
        let Some(request_host) = url.host_str().map(normalize_host) else {
            return Vec::new();
        };
        let request_path = url.path();

        self.hosts
            .iter()
            .filter(|(host, _)| host_matches(host, &request_host))
            .flat_map(|(_, cookies)| cookies.values())
            .filter(|cookie| {
                cookie
                    .path
                    .as_deref()
                    .is_none_or(|path| path.is_empty() || request_path.starts_with(path))
            })
            .filter(|cookie| !cookie.is_expired(now))
            .collect()
    }

    /// Renders the `Cookie` request header for `url`, or `None` when nothing applies.
    pub fn header_value(&self, url: &Url, now: DateTime<Utc>) -> Option<String> {
        let cookies = self.matching(url, now);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.values().map(IndexMap::len).sum()
    }
}

fn host_matches(jar_host: &str, request_host: &str) -> bool {
    if jar_host == "localhost" {
        return is_loopback_host(request_host);
    }
    request_host.ends_with(jar_host)
}

/// Lower-cases a host, strips a leading dot, brackets and any port.
pub(crate) fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('.').to_ascii_lowercase();
    if let Some(rest) = trimmed.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default().to_string();
    }
    // a bare IPv6 literal has several colons and no port
    if trimmed.matches(':').count() > 1 {
        return trimmed;
    }
    trimmed.split(':').next().unwrap_or_default().to_string()
}

/// Syntactic loopback check; no name resolution is performed.
fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|address| address.is_loopback())
}
