//! Book loading.
//!
//! The engine never fetches remote documents. Remote books (`https://` or
//! `github://` locations) must already sit in a cache directory laid out as
//! `<cache_root>/<scheme>/<host>/<path>`; the loader only maps locations onto
//! that layout.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use runbook_types::Book;
use tracing::{debug, warn};
use url::Url;

use crate::error::BookLoadError;

const BOOK_EXTENSIONS: [&str; 2] = ["yml", "yaml"];
const REMOTE_SCHEMES: [&str; 2] = ["https", "github"];

/// Source of parsed books, used by the CLI and by `include` steps.
pub trait BookLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Book, BookLoadError>;
}

/// Loads YAML or JSON books from the filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsBookLoader {
    cache_root: Option<PathBuf>,
}

impl FsBookLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding already-fetched remote books.
    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(cache_root.into());
        self
    }

    /// Maps `path` onto a local file, translating remote locations into the cache.
    pub fn locate(&self, path: &Path) -> Result<PathBuf, BookLoadError> {
        let raw = path.to_string_lossy();
        let Some(remote) = remote_location(&raw) else {
            return Ok(path.to_path_buf());
        };
        let not_cached = || BookLoadError::NotCached {
            location: raw.to_string(),
        };
        let cache_root = self.cache_root.as_ref().ok_or_else(not_cached)?;
        let host = remote.host_str().ok_or_else(not_cached)?;
        let mut cached = cache_root.join(remote.scheme()).join(host);
        for segment in remote.path().split('/').filter(|segment| !segment.is_empty() && *segment != "..") {
            cached.push(segment);
        }
        if cached.is_file() { Ok(cached) } else { Err(not_cached()) }
    }
}

impl BookLoader for FsBookLoader {
    fn load(&self, path: &Path) -> Result<Book, BookLoadError> {
        let local = self.locate(path)?;
        debug!(path = %local.display(), "loading book");
        let content = fs::read_to_string(&local).with_context(|| format!("read {}", local.display()))?;
        let mut book: Book = serde_yaml::from_str(&content).map_err(|source| BookLoadError::Parse {
            path: local.clone(),
            source,
        })?;
        book.path = Some(local);
        Ok(book)
    }
}

fn remote_location(raw: &str) -> Option<Url> {
    if !raw.contains("://") {
        return None;
    }
    Url::parse(raw)
        .ok()
        .filter(|url| REMOTE_SCHEMES.contains(&url.scheme()))
}

/// Expands an OS path list (`PATH`-style separators) into book files.
///
/// Directories contribute their `*.yml`/`*.yaml` entries in name order;
/// missing entries are skipped with a warning. Duplicates are dropped, first
/// occurrence wins.
pub fn expand_book_paths(list: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut books = Vec::new();
    for entry in env::split_paths(list) {
        if entry.as_os_str().is_empty() {
            continue;
        }
        if entry.is_file() {
            if seen.insert(entry.clone()) {
                books.push(entry);
            }
        } else if entry.is_dir() {
            for book in book_files_in(&entry) {
                if seen.insert(book.clone()) {
                    books.push(book);
                }
            }
        } else {
            warn!(path = %entry.display(), "book path does not exist; skipping");
        }
    }
    books
}

fn book_files_in(directory: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(directory) else {
        warn!(path = %directory.display(), "could not read book directory");
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|extension| extension.to_str())
                    .is_some_and(|extension| BOOK_EXTENSIONS.contains(&extension))
        })
        .collect();
    files.sort();
    files
}
