// src/github/fetch.rs
// =============================================================================
// This module downloads single files from a GitHub repository.
//
// Strategy:
// - File bytes come from raw.githubusercontent.com (no API rate limit)
// - Files stored with Git LFS come back as a small text "pointer" instead of
//   the real content. We sniff the start of the body and, if it is a pointer,
//   download the real file from media.githubusercontent.com instead.
// - Bytes are streamed to "<dest>.part" and renamed when complete, so a
//   half-written file never looks finished.
// - A body that goes quiet for longer than the idle timeout fails the file
//   instead of hanging the whole batch.
// - With a content hash and an enabled cache, we try the cache first and
//   store into it afterwards.
//
// Rust concepts:
// - Streams: the response body arrives as a sequence of Bytes chunks
// - Arc<dyn Trait>: the cache is shared and swappable (DiskCache / NoCache)
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::download::{ContentCache, FetchOutcome, FetchSource, FileFetcher, ProgressFn};
use crate::error::{Error, Result};
use crate::github::listing::FileInfo;
use crate::github::transport::Transport;
use crate::github::url::{encode_path, RepoUrl};

/// First line of every Git LFS pointer file.
pub const LFS_SIGNATURE: &[u8] = b"version https://git-lfs.github.com/spec/v1";

// Pointer files are ~130 bytes. Anything outside this open range is
// streamed without peeking.
const LFS_MIN_LEN: u64 = 128;
const LFS_MAX_LEN: u64 = 140;

/// True when the Content-Length and first bytes look like an LFS pointer.
pub fn is_lfs_pointer(content_length: Option<u64>, head: &[u8]) -> bool {
    might_be_lfs_pointer(content_length) && head.starts_with(LFS_SIGNATURE)
}

fn might_be_lfs_pointer(content_length: Option<u64>) -> bool {
    content_length.is_some_and(|len| LFS_MIN_LEN < len && len < LFS_MAX_LEN)
}

/// Reads chunks until at least `want` bytes are buffered (or the body ends).
///
/// Returns the buffered bytes and the untouched remainder of the stream.
/// Pass both to `splice` to get the original body back.
pub async fn peek_stream<S, E>(mut body: S, want: usize) -> std::result::Result<(Bytes, S), E>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
{
    let mut head = BytesMut::new();
    while head.len() < want {
        match body.next().await {
            Some(chunk) => head.extend_from_slice(&chunk?),
            None => break,
        }
    }
    Ok((head.freeze(), body))
}

/// Puts peeked bytes back in front of the rest of the stream.
pub fn splice<S, E>(head: Bytes, rest: S) -> impl Stream<Item = std::result::Result<Bytes, E>>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
{
    stream::iter(Some(Ok(head))).chain(rest)
}

/// Ends the body with `Error::Timeout` when no chunk arrives within `idle`.
pub fn idle_timeout<S, E>(body: S, idle: Duration, url: &str) -> BoxStream<'static, Result<Bytes>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<Error> + Send + 'static,
{
    let url = url.to_string();
    stream::unfold(Some(body), move |state| {
        let url = url.clone();
        async move {
            let mut body = state?;
            match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(body))),
                Ok(Some(Err(e))) => Some((Err(e.into()), None)),
                Ok(None) => None,
                Err(_) => Some((Err(Error::Timeout { url, after: idle }), None)),
            }
        }
    })
    .boxed()
}

pub struct GitHubFetcher {
    transport: Arc<Transport>,
    cache: Arc<dyn ContentCache>,
    repo: RepoUrl,
    // One lock per content hash, so duplicates in the same run wait for the
    // first copy and then hit the cache.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitHubFetcher {
    pub fn new(transport: Arc<Transport>, cache: Arc<dyn ContentCache>, repo: RepoUrl) -> Self {
        Self {
            transport,
            cache,
            repo,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn raw_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.transport.endpoints().raw,
            urlencoding::encode(&self.repo.owner),
            urlencoding::encode(&self.repo.repo),
            encode_path(&self.repo.git_ref),
            encode_path(path)
        )
    }

    pub fn media_url(&self, path: &str) -> String {
        format!(
            "{}/media/{}/{}/{}/{}",
            self.transport.endpoints().media,
            urlencoding::encode(&self.repo.owner),
            urlencoding::encode(&self.repo.repo),
            encode_path(&self.repo.git_ref),
            encode_path(path)
        )
    }

    /// Size of a file from a HEAD request, if the server reports one.
    pub async fn remote_size(&self, path: &str) -> Option<u64> {
        match self.transport.head(&self.raw_url(path)).await {
            Ok(response) if response.status() == StatusCode::OK => response.content_length(),
            Ok(response) => {
                debug!(path, status = response.status().as_u16(), "size probe failed");
                None
            }
            Err(e) => {
                debug!(path, "size probe failed: {}", e);
                None
            }
        }
    }

    /// Downloads `repo_path` to `dest`. `sha` may be empty when unknown.
    pub async fn fetch_to(
        &self,
        repo_path: &str,
        sha: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome> {
        if sha.is_empty() || !self.cache.is_enabled() {
            return self.download(repo_path, dest, progress).await;
        }

        let lock = self.hash_lock(sha);
        let outcome = {
            let _guard = lock.lock().await;
            self.fetch_cached(repo_path, sha, dest, progress).await
        };
        self.release_hash_lock(sha, &lock);
        outcome
    }

    // Runs with the per-hash lock held.
    async fn fetch_cached(
        &self,
        repo_path: &str,
        sha: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome> {
        match self.cache.get(sha, dest).await {
            Ok(true) => {
                let bytes = tokio::fs::metadata(dest)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                progress(bytes);
                debug!(path = repo_path, sha, "satisfied from cache");
                return Ok(FetchOutcome {
                    bytes,
                    source: FetchSource::Cache,
                });
            }
            Ok(false) => {}
            Err(e) => warn!(path = repo_path, "cache lookup failed, downloading: {}", e),
        }

        let outcome = self.download(repo_path, dest, progress).await?;

        if let Err(e) = self.cache.put(sha, dest).await {
            warn!(path = repo_path, "could not store file in cache: {}", e);
        }
        Ok(outcome)
    }

    fn hash_lock(&self, sha: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.entry(sha.to_string()).or_default().clone()
    }

    // Drops the map entry once no other task holds or waits on it. Clones
    // only happen under the map lock, so the count can't grow behind us.
    fn release_hash_lock(&self, sha: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(lock) <= 2 {
            inflight.remove(sha);
        }
    }

    async fn download(
        &self,
        repo_path: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome> {
        let idle = self.transport.timeouts().idle;
        let raw_url = self.raw_url(repo_path);
        let response = self.transport.get(&raw_url).await?;
        ensure_ok(&response, &raw_url)?;

        let content_length = response.content_length();
        let body = idle_timeout(response.bytes_stream(), idle, &raw_url);

        if !might_be_lfs_pointer(content_length) {
            let bytes = write_stream(body, dest, progress).await?;
            return Ok(FetchOutcome {
                bytes,
                source: FetchSource::Network,
            });
        }

        let (head, rest) = peek_stream(body, LFS_SIGNATURE.len()).await?;

        if !is_lfs_pointer(content_length, &head) {
            let bytes = write_stream(splice(head, rest).boxed(), dest, progress).await?;
            return Ok(FetchOutcome {
                bytes,
                source: FetchSource::Network,
            });
        }

        drop(rest);
        debug!(path = repo_path, "LFS pointer detected, fetching from media host");

        let media_url = self.media_url(repo_path);
        let response = self.transport.get(&media_url).await?;
        ensure_ok(&response, &media_url)?;

        let body = idle_timeout(response.bytes_stream(), idle, &media_url);
        let bytes = write_stream(body, dest, progress).await?;
        Ok(FetchOutcome {
            bytes,
            source: FetchSource::Lfs,
        })
    }
}

#[async_trait]
impl FileFetcher for GitHubFetcher {
    async fn fetch(
        &self,
        file: &FileInfo,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome> {
        self.fetch_to(&file.path, &file.sha, dest, progress).await
    }
}

fn ensure_ok(response: &Response, url: &str) -> Result<()> {
    if response.status() == StatusCode::OK {
        Ok(())
    } else {
        Err(Error::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        })
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

// Streams the body into "<dest>.part", reporting the running byte count, and
// renames it over `dest` once every chunk is written.
async fn write_stream<S>(mut body: S, dest: &Path, progress: ProgressFn<'_>) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }

    let part = part_path(dest);
    let written = async {
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| Error::io(&part, e))?;
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(&part, e))?;
            written += chunk.len() as u64;
            progress(written);
        }

        file.flush().await.map_err(|e| Error::io(&part, e))?;
        Ok::<u64, Error>(written)
    }
    .await;

    match written {
        Ok(written) => {
            tokio::fs::rename(&part, dest)
                .await
                .map_err(|e| Error::io(dest, e))?;
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}
