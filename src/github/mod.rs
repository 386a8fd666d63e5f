// src/github/mod.rs
// =============================================================================
// This module handles everything that talks to GitHub.
//
// Submodules:
// - url: Parses tree/blob/raw URLs into owner/repo/ref/path
// - transport: HTTP client with auth header and retry on transient failures
// - listing: Works out the real branch name and lists the files to download
// - fetch: Downloads one file, following Git LFS pointers
//
// Rust concepts:
// - pub use: Re-export items so callers write `github::RepoUrl`
//   instead of `github::url::RepoUrl`
// =============================================================================

mod fetch;
mod listing;
mod transport;
mod url;

pub use fetch::GitHubFetcher;
pub use listing::{fetch_repo_info, list_files, FileInfo};
pub use transport::Transport;
pub use url::{parse_repo_url, RepoUrl};
