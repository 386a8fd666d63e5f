// src/download/cache.rs
// =============================================================================
// Content-addressed cache of downloaded files.
//
// GitHub gives every file a content hash (the blob SHA). Two files with the
// same SHA have the same bytes, so once we've downloaded one we can copy it
// instead of downloading it again, in this run or any later run.
//
// Layout on disk (sharded so no directory gets huge):
//   <cache root>/ab/cd/abcdef0123...
//
// Entries and outputs are independent copies, so editing a downloaded file
// never changes what the cache hands out next time.
//
// The cache is only an accelerator: the fetcher ignores put() failures, and
// NoCache turns every lookup into a miss.
// =============================================================================

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::trace;

use crate::error::{Error, Result};

#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Places the cached blob for `sha` at `dest`. Ok(false) on a miss.
    async fn get(&self, sha: &str, dest: &Path) -> Result<bool>;

    /// Stores `source` under `sha`. A blob that is already cached is left alone.
    async fn put(&self, sha: &str, source: &Path) -> Result<()>;

    fn is_enabled(&self) -> bool {
        true
    }
}

/// The disabled cache.
pub struct NoCache;

#[async_trait]
impl ContentCache for NoCache {
    async fn get(&self, _sha: &str, _dest: &Path) -> Result<bool> {
        Ok(false)
    }

    async fn put(&self, _sha: &str, _source: &Path) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // None for hashes that can't be a blob SHA, so a malformed value from the
    // API can never name a path outside the cache root.
    fn entry_path(&self, sha: &str) -> Option<PathBuf> {
        if sha.len() < 4 || !sha.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(self.root.join(&sha[..2]).join(&sha[2..4]).join(sha))
    }
}

#[async_trait]
impl ContentCache for DiskCache {
    async fn get(&self, sha: &str, dest: &Path) -> Result<bool> {
        let Some(entry) = self.entry_path(sha) else {
            return Ok(false);
        };
        if !tokio::fs::try_exists(&entry).await.unwrap_or(false) {
            return Ok(false);
        }

        copy_then_rename(&entry, dest).await?;
        trace!(sha, dest = %dest.display(), "cache hit");
        Ok(true)
    }

    async fn put(&self, sha: &str, source: &Path) -> Result<()> {
        let Some(entry) = self.entry_path(sha) else {
            return Ok(());
        };
        if tokio::fs::try_exists(&entry).await.unwrap_or(false) {
            return Ok(());
        }

        if let Err(e) = copy_then_rename(source, &entry).await {
            // Another writer stored the same content first.
            if tokio::fs::try_exists(&entry).await.unwrap_or(false) {
                return Ok(());
            }
            return Err(e);
        }
        trace!(sha, "cache store");
        Ok(())
    }
}

// Copies into a sibling temp file and renames it over `to`, so readers only
// ever see a complete file.
async fn copy_then_rename(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }

    let mut name = to.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp{}", std::process::id()));
    let tmp = to.with_file_name(name);

    if let Err(e) = tokio::fs::copy(from, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::io(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, to).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::io(to, e));
    }
    Ok(())
}
