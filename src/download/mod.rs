// src/download/mod.rs
// =============================================================================
// This module turns a resolved file list into files on disk.
//
// Submodules:
// - layout: Maps repository paths to confined local destinations
// - cache: Content-addressed store of previously downloaded blobs
// - orchestrator: Runs a bounded pool of download workers
// - progress: Tracks per-file state and renders a progress line
// =============================================================================

mod cache;
mod layout;
mod orchestrator;
mod progress;

pub use cache::{ContentCache, DiskCache, NoCache};
pub use layout::{confine, OutputLayout};
pub use orchestrator::{
    DownloadOptions, FetchOutcome, FetchSource, FileFetcher, Orchestrator, ProgressFn,
};
pub use progress::ProgressTracker;
