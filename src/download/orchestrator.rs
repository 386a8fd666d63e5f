// src/download/orchestrator.rs
// =============================================================================
// Downloads a list of files concurrently.
//
// How it works:
// 1. All files go into one shared queue
// 2. We start min(limit, files) worker tasks
// 3. Each worker pops a file, downloads it, reports the result, repeats
// 4. Results flow back over a channel; one failed file never stops the others
// 5. Ctrl-C cancels the shared token: workers stop taking new files, and
//    the transport stops retrying
//
// A fixed pool of workers (instead of one task per file) keeps memory flat
// even for repositories with tens of thousands of files.
//
// Rust concepts:
// - JoinSet: a group of spawned tasks we can wait on together
// - mpsc channel: many workers send, the orchestrator receives
// - #[async_trait]: async methods in a trait object (dyn FileFetcher)
// =============================================================================

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::layout::OutputLayout;
use crate::download::progress::ProgressTracker;
use crate::error::{Error, Result};
use crate::github::FileInfo;

/// Receives the running byte count of the file being fetched.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Network,
    Lfs,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub source: FetchSource,
}

/// Puts one file's bytes at `dest`.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(
        &self,
        file: &FileInfo,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome>;
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub concurrency: usize,
    /// Skip files whose destination already exists.
    pub resume: bool,
}

/// What happened to one file.
#[derive(Debug)]
enum FileResult {
    Downloaded(FetchOutcome),
    Skipped,
    Failed(Error),
}

/// Totals for a finished (or cancelled) batch.
#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub from_cache: usize,
    pub bytes: u64,
    pub failed: Vec<(String, Error)>,
    /// Files never attempted, or cut short, because of cancellation.
    pub incomplete: usize,
    /// Cancellation left at least one file incomplete.
    pub cancelled: bool,
}

impl DownloadSummary {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.incomplete == 0
    }

    /// One-line reason for a non-successful batch.
    pub fn failure_message(&self) -> Option<String> {
        if self.cancelled {
            Some(format!(
                "download cancelled with {} file(s) incomplete",
                self.incomplete + self.failed.len()
            ))
        } else if !self.failed.is_empty() {
            Some(format!("{} file(s) failed to download", self.failed.len()))
        } else {
            None
        }
    }
}

pub struct Orchestrator {
    fetcher: Arc<dyn FileFetcher>,
    layout: Arc<OutputLayout>,
    options: DownloadOptions,
    cancel: CancellationToken,
    progress: Option<Arc<ProgressTracker>>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn FileFetcher>,
        layout: OutputLayout,
        options: DownloadOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            layout: Arc::new(layout),
            options,
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Downloads every file and returns the totals. Per-file errors end up
    /// in `DownloadSummary::failed`; this never stops early except on cancel.
    pub async fn run(&self, files: Vec<FileInfo>) -> DownloadSummary {
        let total = files.len();
        let workers = self.options.concurrency.max(1).min(total);
        info!(files = total, workers, "starting downloads");

        let queue = Arc::new(Mutex::new(VecDeque::from(files)));
        // Sized to the file count so a worker never waits on the receiver.
        let (tx, mut rx) = mpsc::channel(total.max(1));

        let mut pool = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                queue: Arc::clone(&queue),
                results: tx.clone(),
                fetcher: Arc::clone(&self.fetcher),
                layout: Arc::clone(&self.layout),
                resume: self.options.resume,
                cancel: self.cancel.clone(),
                progress: self.progress.clone(),
            };
            pool.spawn(worker.run());
        }
        // Workers hold the remaining senders; the channel closes when they exit.
        drop(tx);

        let mut summary = DownloadSummary::default();
        let mut seen = 0;
        while let Some((path, result)) = rx.recv().await {
            seen += 1;
            match result {
                FileResult::Downloaded(outcome) => {
                    summary.downloaded += 1;
                    summary.bytes += outcome.bytes;
                    if outcome.source == FetchSource::Cache {
                        summary.from_cache += 1;
                    }
                }
                FileResult::Skipped => summary.skipped += 1,
                FileResult::Failed(e) if e.is_cancelled() => summary.incomplete += 1,
                FileResult::Failed(e) => summary.failed.push((path, e)),
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("download worker panicked: {}", e);
            }
        }

        summary.incomplete += total - seen;
        // A Ctrl-C that lands after the last file doesn't spoil the batch.
        summary.cancelled = self.cancel.is_cancelled() && summary.incomplete > 0;
        debug!(?summary, "downloads finished");
        summary
    }
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<VecDeque<FileInfo>>>,
    results: mpsc::Sender<(String, FileResult)>,
    fetcher: Arc<dyn FileFetcher>,
    layout: Arc<OutputLayout>,
    resume: bool,
    cancel: CancellationToken,
    progress: Option<Arc<ProgressTracker>>,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!(worker = self.id, "cancelled, not taking more files");
                return;
            }

            let next = self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(file) = next else {
                return;
            };

            let result = self.download_one(&file).await;
            if self.results.send((file.path, result)).await.is_err() {
                return;
            }
        }
    }

    async fn download_one(&self, file: &FileInfo) -> FileResult {
        let dest = match self.layout.destination(&file.path) {
            Ok(dest) => dest,
            Err(e) => {
                warn!(path = %file.path, "refusing to write outside the output directory");
                self.report(|p| p.fail_file(&file.path));
                return FileResult::Failed(e);
            }
        };

        if self.resume && tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(path = %file.path, "already exists, skipping");
            self.report(|p| p.skip_file(&file.path));
            return FileResult::Skipped;
        }

        self.report(|p| p.start_file(&file.path, file.size));
        let on_bytes = |n: u64| self.report(|p| p.update_bytes(&file.path, n));

        match self.fetcher.fetch(file, &dest, &on_bytes).await {
            Ok(outcome) => {
                debug!(path = %file.path, bytes = outcome.bytes, source = ?outcome.source, "downloaded");
                self.report(|p| p.complete_file(&file.path, outcome.bytes));
                FileResult::Downloaded(outcome)
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(path = %file.path, "download failed: {}", e);
                }
                self.report(|p| p.fail_file(&file.path));
                FileResult::Failed(e)
            }
        }
    }

    fn report(&self, update: impl FnOnce(&ProgressTracker)) {
        if let Some(progress) = &self.progress {
            update(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::RepoUrl;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn files(n: usize) -> Vec<FileInfo> {
        (1..=n)
            .map(|i| FileInfo {
                path: format!("pkg/file{}.txt", i),
                size: 10,
                sha: format!("{:040x}", i),
            })
            .collect()
    }

    fn layout(out: &Path) -> OutputLayout {
        let url = RepoUrl {
            owner: "o".to_string(),
            repo: "r".to_string(),
            git_ref: "main".to_string(),
            dir: "pkg".to_string(),
            file_path: None,
        };
        OutputLayout::for_directory(out, &url).unwrap()
    }

    fn options(concurrency: usize, resume: bool) -> DownloadOptions {
        DownloadOptions {
            concurrency,
            resume,
        }
    }

    // Writes "<path>" into the destination, tracking concurrency.
    #[derive(Default)]
    struct FakeFetcher {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
        fail: HashSet<String>,
        delay: Duration,
        cancel_after_first: Option<CancellationToken>,
    }

    #[async_trait]
    impl FileFetcher for FakeFetcher {
        async fn fetch(
            &self,
            file: &FileInfo,
            dest: &Path,
            progress: ProgressFn<'_>,
        ) -> Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            if self.fail.contains(&file.path) {
                return Err(Error::HttpStatus {
                    status: 404,
                    url: file.path.clone(),
                });
            }

            std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
            std::fs::write(dest, file.path.as_bytes()).unwrap();
            progress(file.path.len() as u64);
            Ok(FetchOutcome {
                bytes: file.path.len() as u64,
                source: FetchSource::Network,
            })
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let out = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let orchestrator = Orchestrator::new(
            fetcher.clone(),
            layout(out.path()),
            options(3, false),
            CancellationToken::new(),
        );

        let summary = orchestrator.run(files(12)).await;

        assert!(summary.is_success());
        assert_eq!(summary.downloaded, 12);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 12);
        let max = fetcher.max_active.load(Ordering::SeqCst);
        assert!(max <= 3, "saw {} fetches at once", max);
        assert!(max >= 2);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let out = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            fail: HashSet::from(["pkg/file3.txt".to_string()]),
            ..Default::default()
        });
        let orchestrator = Orchestrator::new(
            fetcher.clone(),
            layout(out.path()),
            options(4, false),
            CancellationToken::new(),
        );

        let summary = orchestrator.run(files(10)).await;

        assert_eq!(summary.downloaded, 9);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "pkg/file3.txt");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 10);
        assert_eq!(
            summary.failure_message().as_deref(),
            Some("1 file(s) failed to download")
        );
        assert!(out.path().join("pkg").join("file10.txt").exists());
    }

    #[tokio::test]
    async fn test_resume_skips_existing_files() {
        let out = tempfile::tempdir().unwrap();

        let first = Arc::new(FakeFetcher::default());
        Orchestrator::new(
            first.clone(),
            layout(out.path()),
            options(2, true),
            CancellationToken::new(),
        )
        .run(files(5))
        .await;
        assert_eq!(first.calls.load(Ordering::SeqCst), 5);

        let second = Arc::new(FakeFetcher::default());
        let tracker = Arc::new(ProgressTracker::new(&files(5), '#').quiet(true));
        let summary = Orchestrator::new(
            second.clone(),
            layout(out.path()),
            options(2, true),
            CancellationToken::new(),
        )
        .with_progress(tracker.clone())
        .run(files(5))
        .await;

        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.skipped, 5);
        assert_eq!(summary.downloaded, 0);
        assert!(summary.is_success());
        assert_eq!(tracker.stats().skipped, 5);
    }

    #[tokio::test]
    async fn test_traversal_is_rejected_before_fetch() {
        let out = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::default());
        let orchestrator = Orchestrator::new(
            fetcher.clone(),
            layout(out.path()),
            options(2, false),
            CancellationToken::new(),
        );

        let evil = FileInfo {
            path: "pkg/../../../etc/passwd".to_string(),
            size: 1,
            sha: String::new(),
        };
        let summary = orchestrator.run(vec![evil]).await;

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.failed.len(), 1);
        assert!(matches!(summary.failed[0].1, Error::PathTraversal { .. }));
    }

    #[tokio::test]
    async fn test_cancel_stops_new_work() {
        let out = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(FakeFetcher {
            cancel_after_first: Some(cancel.clone()),
            ..Default::default()
        });
        let orchestrator = Orchestrator::new(
            fetcher.clone(),
            layout(out.path()),
            options(1, false),
            cancel,
        );

        let summary = orchestrator.run(files(6)).await;

        // The in-flight fetch finishes; nothing after it starts.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.incomplete, 5);
        assert!(summary.cancelled);
        assert!(!summary.is_success());
        assert_eq!(
            summary.failure_message().as_deref(),
            Some("download cancelled with 5 file(s) incomplete")
        );
    }

    #[tokio::test]
    async fn test_cancel_after_last_file_is_success() {
        let out = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(FakeFetcher {
            cancel_after_first: Some(cancel.clone()),
            ..Default::default()
        });

        let summary = Orchestrator::new(fetcher, layout(out.path()), options(1, false), cancel)
            .run(files(1))
            .await;

        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.incomplete, 0);
        assert!(!summary.cancelled);
        assert!(summary.is_success());
        assert_eq!(summary.failure_message(), None);
    }

    #[tokio::test]
    async fn test_progress_sees_every_file() {
        let out = tempfile::tempdir().unwrap();
        let list = files(4);
        let tracker = Arc::new(ProgressTracker::new(&list, '#').quiet(true));
        let fetcher = Arc::new(FakeFetcher {
            fail: HashSet::from(["pkg/file2.txt".to_string()]),
            ..Default::default()
        });

        Orchestrator::new(
            fetcher,
            layout(out.path()),
            options(2, false),
            CancellationToken::new(),
        )
        .with_progress(tracker.clone())
        .run(list)
        .await;

        let stats = tracker.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_progress, 0);
    }

    #[tokio::test]
    async fn test_empty_list() {
        let out = tempfile::tempdir().unwrap();
        let summary = Orchestrator::new(
            Arc::new(FakeFetcher::default()),
            layout(out.path()),
            options(5, false),
            CancellationToken::new(),
        )
        .run(Vec::new())
        .await;

        assert!(summary.is_success());
        assert_eq!(summary.downloaded, 0);
    }
}
