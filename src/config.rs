// src/config.rs
// =============================================================================
// Persistent user settings.
//
// The file lives at <config dir>/tree-fetch/config.json, for example
// ~/.config/tree-fetch/config.json on Linux. If it doesn't exist yet we write
// one with default values so the user has something to edit.
//
// Command-line flags win over the file; see main.rs for the merge.
//
// Rust concepts:
// - #[serde(default = "...")]: fields missing from the file get a default
// - impl Default: the "factory settings" for a struct
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Base URLs of the three GitHub services we talk to.
///
/// Overridable so the tool can point at a mirror (or a mock server in tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api: String,
    pub raw: String,
    pub media: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api: default_api_base_url(),
            raw: default_raw_base_url(),
            media: default_media_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_limit")]
    pub concurrent_download_limit: usize,

    #[serde(default = "default_style")]
    pub progress_bar_style: String,

    #[serde(default = "default_token_path")]
    pub github_token_path: PathBuf,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_raw_base_url")]
    pub raw_base_url: String,

    #[serde(default = "default_media_base_url")]
    pub media_base_url: String,
}

fn default_limit() -> usize {
    5
}

fn default_style() -> String {
    "█".to_string()
}

fn default_token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("~"))
        .join(".github")
        .join("token")
}

fn default_true() -> bool {
    true
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_base_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_media_base_url() -> String {
    "https://media.githubusercontent.com".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent_download_limit: default_limit(),
            progress_bar_style: default_style(),
            github_token_path: default_token_path(),
            cache_enabled: true,
            api_base_url: default_api_base_url(),
            raw_base_url: default_raw_base_url(),
            media_base_url: default_media_base_url(),
        }
    }
}

impl Config {
    /// Loads the config from its default location, creating it if missing.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, writing defaults");
            let config = Config::default();
            // A read-only home directory shouldn't stop a download.
            if let Err(e) = config.save_to(path) {
                warn!("could not write default config to {}: {:#}", path.display(), e);
            }
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("error reading config file {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("error parsing config file {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("error creating config directory {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(self).context("error serializing config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("error writing config file {}", path.display()))
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".config")
            })
            .join("tree-fetch")
            .join("config.json")
    }

    /// Checks the values a user may have typed into the file or on the CLI.
    pub fn validate(&self) -> Result<()> {
        if self.concurrent_download_limit == 0 {
            bail!("concurrent download limit must be greater than 0");
        }
        if self.concurrent_download_limit > 100 {
            warn!(
                "high concurrent download limit ({}) may cause rate limiting or system issues",
                self.concurrent_download_limit
            );
        }
        if self.progress_bar_style.chars().count() != 1 {
            bail!(
                "progress bar style must be a single character, got: {:?}",
                self.progress_bar_style
            );
        }
        // The bar pads empty cells with spaces, so the fill must be one cell wide.
        if console::measure_text_width(&self.progress_bar_style) != 1 {
            bail!(
                "progress bar style must be one column wide, got: {:?}",
                self.progress_bar_style
            );
        }
        Ok(())
    }

    /// The single character used to draw the progress bar.
    pub fn style_char(&self) -> char {
        self.progress_bar_style.chars().next().unwrap_or('█')
    }

    /// Reads the token file, trimmed. Missing or blank files mean "no token".
    pub fn read_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.github_token_path) {
            Ok(contents) => {
                let token = contents.trim();
                (!token.is_empty()).then(|| token.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(
                    "token file exists at {} but could not be read: {}",
                    self.github_token_path.display(),
                    e
                );
                None
            }
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            api: self.api_base_url.trim_end_matches('/').to_string(),
            raw: self.raw_base_url.trim_end_matches('/').to_string(),
            media: self.media_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Where the content cache keeps its blobs.
    pub fn cache_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("tree-fetch").join("files"))
    }
}
