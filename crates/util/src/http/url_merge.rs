use thiserror::Error;
use url::Url;

/// Error raised when a request path cannot be merged onto an endpoint.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeUrlError {
    #[error("invalid path: {0} (must start with '/')")]
    RelativePath(String),
    #[error("invalid url '{url}': {reason}")]
    Parse { url: String, reason: String },
}

/// Joins a request `path` (with optional query) onto `endpoint`.
///
/// The endpoint's own path is kept as a prefix and its query parameters are
/// preserved, with the request's parameters appended after them.
///
/// ```rust
/// use runbook_util::http::merge_url;
/// use url::Url;
///
/// let endpoint = Url::parse("https://api.example.com/v1?tenant=a").unwrap();
/// let merged = merge_url(&endpoint, "/users?page=2").unwrap();
/// assert_eq!(merged.as_str(), "https://api.example.com/v1/users?tenant=a&page=2");
/// ```
pub fn merge_url(endpoint: &Url, path: &str) -> Result<Url, MergeUrlError> {
    if !path.starts_with('/') {
        return Err(MergeUrlError::RelativePath(path.to_string()));
    }
    // Parse against a throwaway base so only the path and query are interpreted.
    let request = Url::parse("http://placeholder.invalid")
        .and_then(|base| base.join(path))
        .map_err(|error| MergeUrlError::Parse {
            url: path.to_string(),
            reason: error.to_string(),
        })?;

    let mut merged = endpoint.clone();
    merged.set_path(&join_paths(endpoint.path(), request.path()));

    let mut pairs: Vec<(String, String)> = endpoint.query_pairs().into_owned().collect();
    pairs.extend(request.query_pairs().into_owned());
    if pairs.is_empty() {
        merged.set_query(None);
    } else {
        merged.query_pairs_mut().clear().extend_pairs(pairs);
    }
    Ok(merged)
}

fn join_paths(base: &str, suffix: &str) -> String {
    let segments: Vec<&str> = base
        .split('/')
        .chain(suffix.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect();
    let mut joined = format!("/{}", segments.join("/"));
    if suffix.ends_with('/') && joined.len() > 1 {
        joined.push('/');
    }
    joined
}
