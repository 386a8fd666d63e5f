// src/download/layout.rs
// =============================================================================
// Where each downloaded file goes on disk.
//
// Downloading https://github.com/o/r/tree/main/crates/core into ./out gives:
//   crates/core/src/lib.rs   ->  out/core/src/lib.rs
//   crates/core/Cargo.toml   ->  out/core/Cargo.toml
// i.e. <output dir>/<last segment of the listed dir>/<path inside that dir>.
// Listing the repository root uses the repository name as that folder.
//
// File paths come from the network, so every destination is checked to stay
// inside the output directory before anything is written.
// =============================================================================

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::github::RepoUrl;

#[derive(Debug, Clone)]
pub struct OutputLayout {
    output_dir: PathBuf,
    base_name: String,
    listed_dir: String,
}

impl OutputLayout {
    pub fn for_directory(output_dir: &Path, url: &RepoUrl) -> Result<Self> {
        let listed_dir = url.dir.trim_matches('/').to_string();
        let base_name = listed_dir
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(url.repo.as_str())
            .to_string();

        Ok(Self {
            output_dir: absolute(output_dir)?,
            base_name,
            listed_dir,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Destination of a repository path from the listing.
    pub fn destination(&self, repo_path: &str) -> Result<PathBuf> {
        let inside = if self.listed_dir.is_empty() {
            Some(repo_path)
        } else {
            repo_path
                .strip_prefix(&self.listed_dir)
                .and_then(|rest| rest.strip_prefix('/'))
        };

        let inside = inside.ok_or_else(|| Error::PathTraversal {
            path: repo_path.to_string(),
        })?;

        confine(&self.output_dir, &format!("{}/{}", self.base_name, inside))
    }
}

/// Joins a slash-separated relative path onto `root`, refusing anything that
/// could land outside it (`..`, absolute paths, drive prefixes).
pub fn confine(root: &Path, relative: &str) -> Result<PathBuf> {
    let traversal = || Error::PathTraversal {
        path: relative.to_string(),
    };

    let root = absolute(root)?;
    let mut dest = root.clone();
    let mut pushed = 0;

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                dest.push(part);
                pushed += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(traversal());
            }
        }
    }

    if pushed == 0 || !normalize(&dest).starts_with(&root) {
        return Err(traversal());
    }

    Ok(dest)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::io(path, e))?
            .join(path)
    };
    Ok(normalize(&joined))
}

// Resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
