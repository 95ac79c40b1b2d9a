use std::path::{MAIN_SEPARATOR, PathBuf};

use dirs_next::home_dir;

pub fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    if let Some(rest) = p.strip_prefix("~\\") {
        // Windows-style
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}

/// Abbreviates every directory component of `path` to its first character.
///
/// `/home/alice/books/login.yml` becomes `/h/a/b/login.yml`.
pub fn shorten_path(path: &str) -> String {
    let components: Vec<&str> = path.split(MAIN_SEPARATOR).collect();
    let Some((file_name, directories)) = components.split_last() else {
        return String::new();
    };
    let absolute = path.starts_with(MAIN_SEPARATOR);

    let mut shortened: Vec<String> = directories
        .iter()
        .filter_map(|directory| directory.chars().next().map(String::from))
        .collect();
    if !file_name.is_empty() {
        shortened.push((*file_name).to_string());
    }

    let joined = shortened.join(&MAIN_SEPARATOR.to_string());
    if absolute {
        format!("{MAIN_SEPARATOR}{joined}")
    } else {
        joined
    }
}
