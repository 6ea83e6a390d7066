//! Error types for the ingestion pipeline.
//!
//! Library code returns these typed errors so callers can tell a corrupt
//! file apart from an unreachable source or an HTML error page. The CLI
//! wraps them in `anyhow` for reporting.

use std::path::PathBuf;

use thiserror::Error;

/// Tabular decode failed outright (corrupt input).
#[derive(Debug, Error)]
#[error("could not parse tabular data: {message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<csv::Error> for ParseError {
    fn from(err: csv::Error) -> Self {
        match err.position() {
            Some(pos) => Self::new(format!("line {}: {}", pos.line(), err)),
            None => Self::new(err.to_string()),
        }
    }
}

/// A failure from a single content fetcher, or from the whole pipeline
/// once every fetcher has been tried.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{fetcher} cannot fetch {url}: {reason}")]
    Unsupported {
        fetcher: String,
        url: String,
        reason: String,
    },

    /// The server answered, but with an HTML document instead of data.
    #[error("content from {url} looks like an HTML page, not tabular data")]
    InvalidPayload { url: String },

    #[error("all fetch strategies failed for {url}: {}", summarize(attempts))]
    Exhausted {
        url: String,
        attempts: Vec<FetchAttempt>,
    },
}

/// One failed strategy, kept for the final report.
#[derive(Debug)]
pub struct FetchAttempt {
    pub fetcher: String,
    pub error: FetchError,
}

fn summarize(attempts: &[FetchAttempt]) -> String {
    if attempts.is_empty() {
        return "no fetchers configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("[{}] {}", a.fetcher, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Version-check failure. Always non-fatal.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    #[error("network error polling {url}: {message}")]
    Network { url: String, message: String },

    #[error("response from {url} has no version token")]
    MissingToken { url: String },
}

/// Failure of a full load (file or URL).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Authentication and user-admin failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("user '{0}' already exists")]
    UserExists(String),

    #[error("username, password, and role are all required")]
    Incomplete,

    #[error("administrator role required")]
    Forbidden,

    #[error("no active session")]
    NotLoggedIn,
}
