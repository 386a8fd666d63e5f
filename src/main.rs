// src/main.rs
// =============================================================================
// This is the entry point of our CLI application.
//
// What happens here:
// 1. Parse command-line arguments and set up logging
// 2. Load the config file and apply command-line overrides
// 3. Parse the GitHub URL
// 4. Download either a single file or a whole directory
// 5. Exit with proper code (0 = success, 1 = downloads failed or were
//    cancelled, 2 = we couldn't even start: bad URL, unknown branch, ...,
//    130 = Ctrl-C pressed twice)
//
// Rust concepts used:
// - async/await: Because we download many files concurrently
// - Arc: The transport and cache are shared by every download worker
// - anyhow::Result: One error type for "something went wrong" at the top level
// =============================================================================

// Module declarations - tells Rust about our other source files
mod cli; // src/cli.rs - command-line parsing
mod config; // src/config.rs - settings file
mod download; // src/download/ - worker pool, cache, progress
mod error; // src/error.rs - typed errors for the core
mod github; // src/github/ - URL parsing, listing, fetching

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::HumanBytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::Config;
use download::{
    confine, ContentCache, DiskCache, DownloadOptions, NoCache, Orchestrator, OutputLayout,
    ProgressTracker,
};
use github::{FileInfo, GitHubFetcher, RepoUrl, Transport};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // {:#} prints the whole context chain on one line
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

// RUST_LOG wins; otherwise -q / -v / -vv pick the level.
fn init_logging(verbose: u8, quiet: bool) {
    let default = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "warn,tree_fetch=debug",
            _ => "warn,tree_fetch=trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// Returns:
//   Ok(0) = everything downloaded (or skipped)
//   Ok(1) = some files failed, or the user pressed Ctrl-C
//   Err   = setup failed before any download started (exit code 2)
async fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(limit) = cli.limit {
        config.concurrent_download_limit = limit;
    }
    if let Some(style) = &cli.style {
        config.progress_bar_style = style.clone();
    }
    if cli.no_cache {
        config.cache_enabled = false;
    }
    config.validate()?;

    // --token / GITHUB_TOKEN first, then the token file
    let token = cli
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .or_else(|| config.read_token());

    let url = github::parse_repo_url(&cli.url)?;
    if cli.output_file.is_some() && !url.is_file() {
        bail!("--output-file can only be used with a file URL (blob or raw)");
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let transport = Arc::new(
        Transport::new(config.endpoints(), token.clone(), cancel.clone())
            .context("failed to create HTTP client")?,
    );

    probe_repository(&transport, &url, token.is_some()).await;

    let cache = open_cache(&config);

    if url.is_file() {
        download_single_file(&cli, &config, transport, cache, url).await
    } else {
        download_directory(&cli, &config, transport, cache, url, cancel).await
    }
}

// First Ctrl-C stops new work, a second one exits right away.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nInterrupted, letting in-flight downloads finish (Ctrl-C again to quit now)...");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted twice, exiting");
            std::process::exit(130);
        }
    });
}

// Best-effort: a failed probe never stops the download.
async fn probe_repository(transport: &Transport, url: &RepoUrl, has_token: bool) {
    match github::fetch_repo_info(transport, url).await {
        Ok(info) if info.private => {
            info!(repo = %url.slug(), "repository is private");
        }
        Ok(info) => {
            debug!(repo = %url.slug(), default_branch = ?info.default_branch, "repository is public");
        }
        Err(e) if !has_token => {
            warn!(
                "could not read repository metadata ({}); if {} is private, pass --token",
                e,
                url.slug()
            );
        }
        Err(e) => warn!("could not read repository metadata: {}", e),
    }
}

fn open_cache(config: &Config) -> Arc<dyn ContentCache> {
    if !config.cache_enabled {
        return Arc::new(NoCache);
    }

    match Config::cache_dir().map(DiskCache::new) {
        Some(Ok(cache)) => {
            debug!(root = %cache.root().display(), "content cache enabled");
            Arc::new(cache)
        }
        Some(Err(e)) => {
            warn!("content cache unavailable, continuing without it: {}", e);
            Arc::new(NoCache)
        }
        None => Arc::new(NoCache),
    }
}

async fn download_single_file(
    cli: &Cli,
    config: &Config,
    transport: Arc<Transport>,
    cache: Arc<dyn ContentCache>,
    url: RepoUrl,
) -> Result<i32> {
    let file_path = url.file_path.clone().unwrap_or_default();
    let name = match &cli.output_file {
        Some(name) => name.clone(),
        None => file_path
            .rsplit('/')
            .next()
            .unwrap_or(file_path.as_str())
            .to_string(),
    };
    let dest = confine(&cli.output, &name)?;

    if cli.dry_run {
        println!("{} -> {}", file_path, dest.display());
        return Ok(0);
    }
    if cli.resume && dest.exists() {
        println!("{} already exists, skipping", dest.display());
        return Ok(0);
    }

    let fetcher = GitHubFetcher::new(transport, cache, url.clone());
    let size = fetcher.remote_size(&file_path).await.unwrap_or(0);

    if !cli.quiet {
        println!(
            "Downloading {} from {} ({}){}",
            file_path,
            url.slug(),
            url.git_ref,
            if size > 0 {
                format!(", {}", HumanBytes(size))
            } else {
                String::new()
            }
        );
    }

    let info = FileInfo {
        path: file_path.clone(),
        size,
        sha: String::new(),
    };
    let tracker =
        ProgressTracker::new(std::slice::from_ref(&info), config.style_char()).quiet(cli.quiet);

    tracker.start_file(&file_path, size);
    let result = fetcher
        .fetch_to(&file_path, &info.sha, &dest, &|n| {
            tracker.update_bytes(&file_path, n)
        })
        .await;

    match result {
        Ok(outcome) => {
            tracker.complete_file(&file_path, outcome.bytes);
            tracker.finish();
            if !cli.quiet {
                println!("Saved to {}", dest.display());
            }
            Ok(0)
        }
        Err(e) => {
            tracker.fail_file(&file_path);
            tracker.finish();
            if e.is_cancelled() {
                eprintln!("Error: download cancelled");
            } else {
                eprintln!("Error: {}: {}", file_path, e);
            }
            Ok(1)
        }
    }
}

async fn download_directory(
    cli: &Cli,
    config: &Config,
    transport: Arc<Transport>,
    cache: Arc<dyn ContentCache>,
    mut url: RepoUrl,
    cancel: CancellationToken,
) -> Result<i32> {
    let files = github::list_files(&transport, &mut url)
        .await
        .with_context(|| format!("failed to list files in {}", url.slug()))?;

    let shown_dir = if url.dir.is_empty() { "/" } else { url.dir.as_str() };
    if !cli.quiet {
        println!("Repository: {}  ref: {}  path: {}", url.slug(), url.git_ref, shown_dir);
    }

    if files.is_empty() {
        println!("No files found under {}", shown_dir);
        return Ok(0);
    }

    let total_size: u64 = files.iter().map(|f| f.size).sum();
    if !cli.quiet {
        println!("Found {} file(s), {}", files.len(), HumanBytes(total_size));
    }

    let layout = OutputLayout::for_directory(&cli.output, &url)?;

    if cli.dry_run {
        print_dry_run(&files, &layout, cli.verbose > 0);
        return Ok(0);
    }

    let output_dir = layout.output_dir().to_path_buf();
    let tracker = Arc::new(ProgressTracker::new(&files, config.style_char()).quiet(cli.quiet));
    let fetcher = Arc::new(GitHubFetcher::new(transport, cache, url));
    let options = DownloadOptions {
        concurrency: config.concurrent_download_limit,
        resume: cli.resume,
    };

    let summary = Orchestrator::new(fetcher, layout, options, cancel)
        .with_progress(Arc::clone(&tracker))
        .run(files)
        .await;

    let stats = tracker.stats();
    debug!(
        transferred = stats.transferred_bytes,
        elapsed = ?stats.elapsed,
        "download batch finished"
    );
    tracker.finish();

    for (path, e) in &summary.failed {
        eprintln!("  failed: {}: {}", path, e);
    }

    match summary.failure_message() {
        Some(message) => {
            eprintln!("Error: {}", message);
            Ok(1)
        }
        None => {
            if !cli.quiet {
                println!(
                    "Downloaded {} file(s), {} ({} from cache), {} skipped, into {}",
                    summary.downloaded,
                    HumanBytes(summary.bytes),
                    summary.from_cache,
                    summary.skipped,
                    output_dir.display()
                );
            }
            Ok(0)
        }
    }
}

fn print_dry_run(files: &[FileInfo], layout: &OutputLayout, with_sizes: bool) {
    println!("Dry run, nothing will be written:");
    for file in files {
        let dest = layout
            .destination(&file.path)
            .map(|d| display_relative(&d, layout.output_dir()))
            .unwrap_or_else(|e| format!("<rejected: {}>", e));
        if with_sizes {
            println!("  {} -> {} ({})", file.path, dest, HumanBytes(file.size));
        } else {
            println!("  {} -> {}", file.path, dest);
        }
    }
}

fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
