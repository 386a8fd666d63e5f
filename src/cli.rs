// src/cli.rs
// =============================================================================
// This file defines our command-line interface using the `clap` crate.
//
// There is a single command: give it a GitHub URL, get files on disk.
//
//   tree-fetch https://github.com/owner/repo/tree/main/docs
//   tree-fetch https://github.com/owner/repo/blob/main/README.md -o out
//
// Values given here win over the config file (see config.rs).
//
// Rust concepts:
// - Structs: Custom data types that group related data
// - Derive macros: Automatically generate the parsing code
// - Option<T>: "not given on the command line" is different from a value
// =============================================================================

use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "tree-fetch",
    version,
    about = "Download a directory or a single file from a GitHub repository",
    long_about = "tree-fetch downloads a directory (tree URL) or a single file (blob or raw URL) \
                  from GitHub without cloning the repository. Branch names containing slashes \
                  and Git LFS files are handled automatically."
)]
pub struct Cli {
    /// GitHub URL to download
    ///
    /// Directory: https://github.com/owner/repo/tree/branch/path/to/dir
    /// File:      https://github.com/owner/repo/blob/branch/path/to/file.ext
    pub url: String,

    /// GitHub personal access token (raises the API rate limit, unlocks private repos)
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Directory to save files into
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Maximum number of files downloaded at once (default from config: 5)
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Single character used to draw the progress bar
    #[arg(long)]
    pub style: Option<String>,

    /// List the files that would be downloaded, without downloading them
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// File name to save a single-file download as
    #[arg(long, value_name = "NAME")]
    pub output_file: Option<String>,

    /// Skip files that already exist in the output directory
    #[arg(short, long)]
    pub resume: bool,

    /// Don't read from or write to the local content cache
    #[arg(long)]
    pub no_cache: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["tree-fetch", "https://github.com/o/r/tree/main/src"]).unwrap();
        assert_eq!(cli.url, "https://github.com/o/r/tree/main/src");
        assert_eq!(cli.output, PathBuf::from("."));
        assert_eq!(cli.limit, None);
        assert!(!cli.dry_run);
        assert!(!cli.resume);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_parse_all_flags() {
        let cli = Cli::try_parse_from([
            "tree-fetch",
            "https://github.com/o/r/blob/main/a.txt",
            "--token",
            "abc",
            "-o",
            "out",
            "-l",
            "8",
            "--style",
            "#",
            "-n",
            "--output-file",
            "b.txt",
            "-r",
            "--no-cache",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.token.as_deref(), Some("abc"));
        assert_eq!(cli.output, PathBuf::from("out"));
        assert_eq!(cli.limit, Some(8));
        assert_eq!(cli.style.as_deref(), Some("#"));
        assert!(cli.dry_run);
        assert_eq!(cli.output_file.as_deref(), Some("b.txt"));
        assert!(cli.resume);
        assert!(cli.no_cache);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        let result = Cli::try_parse_from(["tree-fetch", "https://github.com/o/r/tree/main", "-v", "-q"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_url_is_required() {
        assert!(Cli::try_parse_from(["tree-fetch"]).is_err());
    }
}

// -----------------------------------------------------------------------------
// BEGINNER NOTES:
//
// 1. Why Option<usize> for --limit instead of a default value?
//    - The default lives in the config file
//    - None means "the user didn't say", so the config value is used
//
// 2. What does env = "GITHUB_TOKEN" do?
//    - If --token is missing, clap reads the environment variable instead
//    - hide_env_values keeps the token out of --help output
//
// 3. ArgAction::Count
//    - Counts how often a flag appears: -v = 1, -vv = 2
// -----------------------------------------------------------------------------
