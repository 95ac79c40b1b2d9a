use once_cell::sync::Lazy;
use regex::Regex;

pub mod duration;
pub mod http;
pub mod path_processing;
pub mod settings;

pub use duration::parse_duration;
pub use path_processing::{expand_tilde, shorten_path};

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization: )([\w\-\.=:/+ ]+)",
        r"(?i)(cookie: )([^\r\n]+)",
        r"(?i)([A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
        r"(?i)(DATABASE_URL=)([^\s]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static DSN_PASSWORD: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"([a-z][a-z0-9+\-.]*://[^:/@\s]+:)[^@\s]+@").ok());

/// Redacts values that look like secrets in a string.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in SENSITIVE_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |caps: &regex::Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{}<redacted>", prefix)
            })
            .to_string();
    }
    if let Some(pattern) = DSN_PASSWORD.as_ref() {
        redacted = pattern.replace_all(&redacted, "${1}<redacted>@").to_string();
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_authorization_and_env_assignments() {
        let input = "Authorization: Bearer abc123\nAPI_TOKEN=xyz";
        let redacted = redact_sensitive(input);
        assert!(redacted.contains("Authorization: <redacted>"));
        assert!(redacted.contains("API_TOKEN=<redacted>"));
        assert!(!redacted.contains("xyz"));
        assert!(!redacted.contains("abc123"));
    }

    #[test]
    fn env_assignments_keep_their_equals_sign() {
        assert_eq!(
            redact_sensitive("DB_PASSWORD=s3cret DATABASE_URL=postgres://db/app"),
            "DB_PASSWORD=<redacted> DATABASE_URL=<redacted>"
        );
    }

    #[test]
    fn redacts_dsn_passwords() {
        let redacted = redact_sensitive("connecting to postgres://app:hunter2@db:5432/app");
        assert_eq!(redacted, "connecting to postgres://app:<redacted>@db:5432/app");
    }

    #[test]
    fn leaves_plain_text_untouched() {
        assert_eq!(redact_sensitive("GET /users 200"), "GET /users 200");
    }
}
