// src/github/url.rs
// =============================================================================
// This module turns a GitHub web URL into its components.
//
// Supported shapes:
//   https://github.com/owner/repo/tree/ref/path/to/dir     -> directory
//   https://github.com/owner/repo/blob/ref/path/to/file    -> single file
//   https://raw.githubusercontent.com/owner/repo/ref/file  -> single file
//
// The ref is always taken as ONE path segment here. Branch names can contain
// slashes (feat/my-branch), but the URL alone cannot tell us where the branch
// ends. The listing resolver (listing.rs) fixes that up later by asking the
// API.
//
// Rust concepts:
// - OnceLock: compile each regex once, on first use
// - Option<String>: the file path only exists for single-file URLs
// =============================================================================

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::error::{Error, Result};

const EXPECTED_GITHUB: &str = "  Directory: https://github.com/owner/repo/tree/branch/path/to/dir\n  File:      https://github.com/owner/repo/blob/branch/path/to/file.ext";
const EXPECTED_RAW: &str = "  Raw file:  https://raw.githubusercontent.com/owner/repo/ref/path/to/file";

/// The pieces of a repository URL.
///
/// `dir` is the directory to list (empty string = repository root). For a
/// single-file URL `file_path` is set and `dir` is its parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
    pub dir: String,
    pub file_path: Option<String>,
}

impl RepoUrl {
    /// True when the URL points at one file (blob or raw URL).
    pub fn is_file(&self) -> bool {
        self.file_path.is_some()
    }

    /// "owner/repo", for display.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

fn tree_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/([^/]+)/([^/]+)/tree/([^/]+)(?:/(.*))?$").expect("tree regex is valid")
    })
}

fn blob_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/([^/]+)/([^/]+)/blob/([^/]+)/(.+)$").expect("blob regex is valid")
    })
}

fn raw_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/([^/]+)/([^/]+)/([^/]+)/(.+)$").expect("raw regex is valid"))
}

/// Parses a GitHub URL into a `RepoUrl`.
///
/// Never returns a half-filled value: either every component was found, or an
/// error explains which URL shapes are accepted.
pub fn parse_repo_url(input: &str) -> Result<RepoUrl> {
    let input = input.trim();
    let parsed = Url::parse(input).map_err(|_| Error::InvalidUrl {
        url: input.to_string(),
        expected: EXPECTED_GITHUB,
    })?;

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

    match host.as_str() {
        "raw.githubusercontent.com" => parse_raw_path(parsed.path(), input),
        "github.com" | "www.github.com" => parse_github_path(parsed.path(), input),
        _ => Err(Error::UnsupportedHost { host }),
    }
}

fn parse_github_path(path: &str, original: &str) -> Result<RepoUrl> {
    if let Some(caps) = blob_regex().captures(path) {
        let file_path = trim_path(&decode(&caps[4]));
        if !file_path.is_empty() {
            return Ok(RepoUrl {
                owner: decode(&caps[1]),
                repo: decode(&caps[2]),
                git_ref: decode(&caps[3]),
                dir: parent_dir(&file_path),
                file_path: Some(file_path),
            });
        }
    }

    if let Some(caps) = tree_regex().captures(path) {
        let dir = caps.get(4).map(|m| decode(m.as_str())).unwrap_or_default();
        return Ok(RepoUrl {
            owner: decode(&caps[1]),
            repo: decode(&caps[2]),
            git_ref: decode(&caps[3]),
            dir: trim_path(&dir),
            file_path: None,
        });
    }

    Err(Error::InvalidUrl {
        url: original.to_string(),
        expected: EXPECTED_GITHUB,
    })
}

fn parse_raw_path(path: &str, original: &str) -> Result<RepoUrl> {
    let invalid = || Error::InvalidUrl {
        url: original.to_string(),
        expected: EXPECTED_RAW,
    };

    let caps = raw_regex().captures(path).ok_or_else(invalid)?;
    let file_path = trim_path(&decode(&caps[4]));
    if file_path.is_empty() {
        return Err(invalid());
    }

    Ok(RepoUrl {
        owner: decode(&caps[1]),
        repo: decode(&caps[2]),
        git_ref: decode(&caps[3]),
        dir: parent_dir(&file_path),
        file_path: Some(file_path),
    })
}

// Percent-decodes a piece of the URL path. If the escapes don't form valid
// UTF-8 we keep the text exactly as it appeared in the URL.
fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(Cow::into_owned)
        .unwrap_or_else(|_| segment.to_string())
}

fn trim_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Percent-encodes each segment of a repository path, keeping the slashes.
///
/// "docs & more/a b.md" -> "docs%20%26%20more/a%20b.md"
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent of a slash-separated repository path ("" for top-level entries).
pub fn parent_dir(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
        .unwrap_or_default()
}
