// src/download/progress.rs
// =============================================================================
// Progress tracking for a batch download.
//
// Every file moves through:
//   Pending -> Downloading -> Completed | Skipped | Failed
// and stays put once it reaches one of the last three.
//
// Workers report into the tracker from many tasks at once, so the counters
// live behind ONE mutex and the bar is updated while holding it, which
// means the bar never mixes old and new numbers. Drawing (and rate limiting
// the redraws) is left to indicatif.
//
// Rust concepts:
// - Mutex<Inner>: interior mutability shared across tasks (&self methods)
// - indicatif::ProgressBar: cheap to clone, draws on stderr in the background
// =============================================================================

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::github::FileInfo;

const BAR_TEMPLATE: &str = "[{elapsed_precise}] [{bar:30}] {pos}/{len} files  {wide_msg}";
const REFRESH_HZ: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Downloading,
    Completed,
    Skipped,
    Failed,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

#[derive(Debug)]
struct FileProgress {
    size: u64,
    transferred: u64,
    state: FileState,
}

/// A consistent snapshot of the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressStats {
    pub total_files: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub completed_bytes: u64,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    /// None until at least one file has completed.
    pub eta: Option<Duration>,
}

impl ProgressStats {
    pub fn finished_files(&self) -> usize {
        self.completed + self.skipped + self.failed
    }

    /// "Download complete: 3 downloaded, 1 skipped, 0 failed (2.00 KiB in 1.2s)"
    pub fn summary(&self) -> String {
        format!(
            "Download complete: {} downloaded, {} skipped, {} failed ({} in {:.1}s)",
            self.completed,
            self.skipped,
            self.failed,
            HumanBytes(self.completed_bytes),
            self.elapsed.as_secs_f64()
        )
    }
}

struct Inner {
    files: HashMap<String, FileProgress>,
    completed: usize,
    skipped: usize,
    failed: usize,
    completed_bytes: u64,
    current: Option<String>,
}

pub struct ProgressTracker {
    inner: Mutex<Inner>,
    bar: ProgressBar,
    started: Instant,
    quiet: bool,
}

impl ProgressTracker {
    /// Registers every file as Pending. The bar draws on stderr, filled
    /// with `fill`.
    pub fn new(files: &[FileInfo], fill: char) -> Self {
        let bar = ProgressBar::with_draw_target(
            Some(files.len() as u64),
            ProgressDrawTarget::stderr_with_hz(REFRESH_HZ),
        );
        bar.set_style(bar_style(fill));

        let files = files
            .iter()
            .map(|f| {
                (
                    f.path.clone(),
                    FileProgress {
                        size: f.size,
                        transferred: 0,
                        state: FileState::Pending,
                    },
                )
            })
            .collect();

        Self {
            inner: Mutex::new(Inner {
                files,
                completed: 0,
                skipped: 0,
                failed: 0,
                completed_bytes: 0,
                current: None,
            }),
            bar,
            started: Instant::now(),
            quiet: false,
        }
    }

    /// Tracks state but never draws anything.
    pub fn quiet(mut self, quiet: bool) -> Self {
        if quiet {
            self.bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        self.quiet = quiet;
        self
    }

    pub fn start_file(&self, path: &str, size: u64) {
        let mut inner = self.lock();
        let entry = inner.files.entry(path.to_string()).or_insert(FileProgress {
            size,
            transferred: 0,
            state: FileState::Pending,
        });
        if entry.state.is_terminal() {
            return;
        }
        entry.state = FileState::Downloading;
        if size > 0 {
            entry.size = size;
        }
        inner.current = Some(path.to_string());
        self.refresh(&inner);
    }

    /// `transferred` is the running total for the file, not a delta.
    pub fn update_bytes(&self, path: &str, transferred: u64) {
        let mut inner = self.lock();
        match inner.files.get_mut(path) {
            Some(file) if file.state == FileState::Downloading => file.transferred = transferred,
            _ => return,
        }
        self.refresh(&inner);
    }

    pub fn complete_file(&self, path: &str, bytes: u64) {
        let mut inner = self.lock();
        if !Self::finish_state(&mut inner, path, FileState::Completed) {
            return;
        }
        if let Some(file) = inner.files.get_mut(path) {
            file.transferred = bytes;
        }
        inner.completed += 1;
        inner.completed_bytes += bytes;
        self.refresh(&inner);
    }

    pub fn skip_file(&self, path: &str) {
        let mut inner = self.lock();
        if Self::finish_state(&mut inner, path, FileState::Skipped) {
            inner.skipped += 1;
            self.refresh(&inner);
        }
    }

    pub fn fail_file(&self, path: &str) {
        let mut inner = self.lock();
        if Self::finish_state(&mut inner, path, FileState::Failed) {
            inner.failed += 1;
            self.refresh(&inner);
        }
    }

    #[cfg(test)]
    pub fn state(&self, path: &str) -> Option<FileState> {
        self.lock().files.get(path).map(|f| f.state)
    }

    pub fn stats(&self) -> ProgressStats {
        let inner = self.lock();
        self.snapshot(&inner)
    }

    /// Clears the bar, prints the summary line, and returns the last snapshot.
    pub fn finish(&self) -> ProgressStats {
        let inner = self.lock();
        self.refresh(&inner);
        let stats = self.snapshot(&inner);
        self.bar.finish_and_clear();

        if !self.quiet {
            eprintln!("{}", stats.summary());
        }
        stats
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking worker must not take progress reporting down with it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Moves a file into a terminal state. False if it was already terminal.
    fn finish_state(inner: &mut Inner, path: &str, state: FileState) -> bool {
        let file = inner.files.entry(path.to_string()).or_insert(FileProgress {
            size: 0,
            transferred: 0,
            state: FileState::Pending,
        });
        if file.state.is_terminal() {
            return false;
        }
        file.state = state;
        true
    }

    fn snapshot(&self, inner: &Inner) -> ProgressStats {
        let elapsed = self.started.elapsed();
        let total_files = inner.files.len();
        let in_progress = inner
            .files
            .values()
            .filter(|f| f.state == FileState::Downloading)
            .count();
        let transferred_bytes = inner.files.values().map(|f| f.transferred).sum();
        let total_bytes = inner.files.values().map(|f| f.size).sum();

        let finished = inner.completed + inner.skipped + inner.failed;
        let remaining = total_files.saturating_sub(finished);

        ProgressStats {
            total_files,
            completed: inner.completed,
            skipped: inner.skipped,
            failed: inner.failed,
            in_progress,
            completed_bytes: inner.completed_bytes,
            transferred_bytes,
            total_bytes,
            elapsed,
            eta: estimate_remaining(remaining, inner.completed, elapsed),
        }
    }

    // indicatif decides when to actually redraw.
    fn refresh(&self, inner: &Inner) {
        let stats = self.snapshot(inner);
        self.bar.set_length(stats.total_files as u64);
        self.bar.set_position(stats.finished_files() as u64);
        self.bar
            .set_message(status_message(&stats, inner.current.as_deref()));
    }
}

// remaining / (completed / elapsed)
fn estimate_remaining(remaining: usize, completed: usize, elapsed: Duration) -> Option<Duration> {
    if completed == 0 {
        return None;
    }
    let rate = completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    Some(Duration::from_secs_f64(remaining as f64 / rate))
}

fn status_message(stats: &ProgressStats, current: Option<&str>) -> String {
    let eta = match stats.eta {
        Some(eta) => HumanDuration(eta).to_string(),
        None => "calculating".to_string(),
    };
    format!(
        "({} active)  {}/{}  ETA {}  {}",
        stats.in_progress,
        HumanBytes(stats.transferred_bytes),
        HumanBytes(stats.total_bytes),
        eta,
        current.unwrap_or_default()
    )
}

// Full cells use the fill char, the partial cell too, empty cells a space.
fn bar_style(fill: char) -> ProgressStyle {
    match ProgressStyle::with_template(BAR_TEMPLATE) {
        Ok(style) => style.progress_chars(&format!("{fill}{fill} ")),
        Err(_) => ProgressStyle::default_bar(),
    }
}
