// src/error.rs
// =============================================================================
// Typed errors for the download core.
//
// main.rs works with anyhow (one error type for "something went wrong"), but
// the core needs to tell errors apart:
// - The listing resolver treats NotFound as "try a longer branch name"
// - The orchestrator reports Cancelled differently from real failures
// - Rate limit and auth errors carry hints the user can act on
//
// Rust concepts:
// - thiserror: derives std::error::Error and Display from attributes
// - #[from]: lets `?` convert a reqwest::Error into our Error automatically
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported host: {host}\nSupported: github.com, raw.githubusercontent.com")]
    UnsupportedHost { host: String },

    #[error("invalid URL format: {url}\nExpected formats:\n{expected}")]
    InvalidUrl { url: String, expected: &'static str },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("GitHub API rate limit exceeded (resets at {reset}). Try using a personal access token with --token")]
    RateLimited { reset: String },

    #[error("GitHub API rate limit exceeded. Retry after {seconds} seconds")]
    RetryAfter { seconds: String },

    #[error("HTTP 403 Forbidden - you may need a personal access token for private repositories (use --token)")]
    Forbidden,

    #[error("invalid or expired token (HTTP 401)")]
    InvalidToken,

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("timed out after {after:?} waiting for {url}")]
    Timeout { url: String, after: Duration },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to parse response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("unknown entry type '{kind}' at {path}")]
    UnknownEntryType { kind: String, path: String },

    #[error("path traversal detected: {path} is outside the output directory")]
    PathTraversal { path: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Wraps an io::Error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
