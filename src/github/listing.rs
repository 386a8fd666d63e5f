// src/github/listing.rs
// =============================================================================
// This module works out WHICH files to download.
//
// Two GitHub APIs can list a directory:
// - Git Trees API (recursive=1): the whole repository in one call, but the
//   response is truncated for very large repositories
// - Contents API: one directory level per call, never truncated
//
// We try the trees API first and only fall back to the contents API when the
// tree came back truncated AND nothing matched our directory.
//
// Branch names with slashes:
//   https://github.com/o/r/tree/feat/my-branch/src
// parses as ref="feat", dir="my-branch/src". Asking for the tree of "feat"
// returns 404, so we move the first directory segment into the ref
// (ref="feat/my-branch", dir="src") and ask again, until the API finds the
// ref or we run out of segments. The first ref that exists wins.
// =============================================================================

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::github::transport::Transport;
use crate::github::url::{encode_path, RepoUrl};

/// One file found in a listing.
///
/// `size` is 0 when unknown and `sha` is empty when the API didn't send one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub sha: String,
}

/// The few fields of `GET /repos/{owner}/{repo}` we look at.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    sha: String,
}

pub async fn fetch_repo_info(transport: &Transport, url: &RepoUrl) -> Result<RepoInfo> {
    transport
        .api_get(&format!(
            "repos/{}/{}",
            urlencoding::encode(&url.owner),
            urlencoding::encode(&url.repo)
        ))
        .await
}

/// Lists every file under `url.dir`, fixing up `url.git_ref` / `url.dir`
/// when the branch name turns out to contain slashes.
///
/// Only "not found" moves the ref boundary. Any other error (rate limit,
/// auth, network) is returned straight away.
pub async fn list_files(transport: &Transport, url: &mut RepoUrl) -> Result<Vec<FileInfo>> {
    let mut segments: VecDeque<String> = url
        .dir
        .split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let (files, truncated) = loop {
        match via_trees_api(transport, url).await {
            Ok(listing) => break listing,
            Err(e) if e.is_not_found() => {
                let Some(next) = segments.pop_front() else {
                    return Err(e);
                };
                url.git_ref = format!("{}/{}", url.git_ref, next);
                url.dir = Vec::from(segments.clone()).join("/");
                debug!(git_ref = %url.git_ref, dir = %url.dir, "ref not found, extending branch name");
            }
            Err(e) => return Err(e),
        }
    };

    if files.is_empty() && truncated {
        info!("tree listing truncated, falling back to the contents API");
        return via_contents_api(transport, url).await;
    }

    Ok(files)
}

async fn via_trees_api(transport: &Transport, url: &RepoUrl) -> Result<(Vec<FileInfo>, bool)> {
    let endpoint = format!(
        "repos/{}/{}/git/trees/{}?recursive=1",
        urlencoding::encode(&url.owner),
        urlencoding::encode(&url.repo),
        encode_path(&url.git_ref)
    );
    let response: TreeResponse = transport.api_get(&endpoint).await?;

    let prefix = dir_prefix(&url.dir);
    let files: Vec<FileInfo> = response
        .tree
        .into_iter()
        .filter(|entry| entry.kind == "blob" && entry.path.starts_with(&prefix))
        .map(|entry| FileInfo {
            path: entry.path,
            size: entry.size,
            sha: entry.sha,
        })
        .collect();

    debug!(
        git_ref = %url.git_ref,
        count = files.len(),
        truncated = response.truncated,
        "listed files via trees API"
    );
    Ok((files, response.truncated))
}

// Walks the directory one level per request. A queue instead of recursion
// keeps this a plain loop.
async fn via_contents_api(transport: &Transport, url: &RepoUrl) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    let mut pending = VecDeque::from([url.dir.clone()]);

    while let Some(dir) = pending.pop_front() {
        let endpoint = contents_endpoint(url, &dir);
        let entries: Vec<ContentEntry> = transport.api_get(&endpoint).await?;

        for entry in entries {
            match entry.kind.as_str() {
                "file" => files.push(FileInfo {
                    path: entry.path,
                    size: entry.size,
                    sha: entry.sha,
                }),
                "dir" => pending.push_back(entry.path),
                "symlink" | "submodule" => {
                    debug!(path = %entry.path, kind = %entry.kind, "skipping non-file entry");
                }
                _ => {
                    return Err(Error::UnknownEntryType {
                        kind: entry.kind,
                        path: entry.path,
                    })
                }
            }
        }
    }

    Ok(files)
}

fn contents_endpoint(url: &RepoUrl, dir: &str) -> String {
    let mut endpoint = format!(
        "repos/{}/{}/contents",
        urlencoding::encode(&url.owner),
        urlencoding::encode(&url.repo)
    );
    if !dir.is_empty() {
        endpoint.push('/');
        endpoint.push_str(&encode_path(dir));
    }
    endpoint.push_str("?ref=");
    endpoint.push_str(&urlencoding::encode(&url.git_ref));
    endpoint
}

// "src" -> "src/", "" -> "" (everything matches at the repository root)
fn dir_prefix(dir: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    }
}
