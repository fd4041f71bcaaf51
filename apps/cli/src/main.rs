//! EZMount CLI - Command line front end for managing rclone mounts.
//!
//! Reads an rclone configuration, derives mount mappings from its remotes,
//! launches and stops `rclone mount` processes and manages the entries that
//! bring those mounts back at login.

mod commands;

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use snafu::Snafu;
use tracing_subscriber::EnvFilter;

/// EZMount CLI tool.
#[derive(Parser)]
#[command(name = "ezmount")]
#[command(about = "Mount rclone remotes and register them to start at login", long_about = None)]
struct Cli {
    /// Settings file (defaults to the per-user config directory).
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// rclone config file. Remembered after a successful load.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the sections of the rclone config.
    Sections,

    /// Show the mappings generated from the rclone config.
    Mappings(BucketArgs),

    /// Mount every generated mapping and watch the mounts.
    ///
    /// Targets that are already live are skipped unless --force is given.
    /// Watching ends once no mount launched here is still running; the
    /// mounts themselves keep running if the CLI is interrupted.
    Mount {
        #[command(flatten)]
        buckets: BucketArgs,

        /// Start mappings even when their target is already live.
        #[arg(long)]
        force: bool,
    },

    /// Show mounts found on this machine.
    Status,

    /// Stop one mount, or every detected mount.
    Unmount {
        /// Drive letter or directory. Stops everything when omitted.
        target: Option<String>,

        /// Restart the desktop shell afterwards so stale drives disappear.
        #[arg(long)]
        refresh_shell: bool,
    },

    /// Manage login startup entries.
    #[command(subcommand)]
    Startup(StartupCommands),
}

#[derive(Subcommand)]
enum StartupCommands {
    /// Replace the startup entries with the generated mappings, removing
    /// artifacts from the previous commit.
    Commit {
        #[command(flatten)]
        buckets: BucketArgs,

        /// Only register mappings with these labels.
        #[arg(long, value_name = "LABEL", num_args = 1..)]
        only: Vec<String>,
    },

    /// Remove every startup entry written by this tool.
    Clear,

    /// List the recorded startup entries.
    List,
}

#[derive(Args, Clone, Default)]
struct BucketArgs {
    /// Extra buckets for an object-storage remote, e.g. `s3=logs,archive`.
    #[arg(long = "bucket", value_name = "SECTION=BUCKETS")]
    buckets: Vec<BucketSpec>,
}

/// `section=bucket[,bucket...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BucketSpec {
    section: String,
    buckets: Vec<String>,
}

impl FromStr for BucketSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (section, buckets) = s
            .split_once('=')
            .ok_or_else(|| format!("expected SECTION=BUCKETS, got '{}'", s))?;

        let section = section.trim();
        if section.is_empty() {
            return Err("section name is empty".to_string());
        }

        let buckets: Vec<String> = buckets
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();

        Ok(BucketSpec {
            section: section.to_string(),
            buckets,
        })
    }
}

/// Errors surfaced to the user.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("no rclone config given and none remembered; pass --config <PATH>"))]
    NoConfig,

    #[snafu(display("no generated mapping has label {}", labels.join(", ")))]
    UnknownLabels { labels: Vec<String> },

    #[snafu(context(false), display("{source}"))]
    Core { source: ezmount_core::Error },
}

type CliResult<T> = std::result::Result<T, CliError>;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = commands::run(cli) {
        eprintln!("Error: {}", snafu::Report::from_error(e));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bucket_spec() {
        assert_eq!(
            "s3 = logs, archive,".parse::<BucketSpec>().unwrap(),
            BucketSpec {
                section: "s3".into(),
                buckets: vec!["logs".into(), "archive".into()],
            }
        );
        assert!("s3".parse::<BucketSpec>().is_err());
        assert!("=logs".parse::<BucketSpec>().is_err());
    }

    #[test]
    fn test_parse_startup_commit() {
        let cli = Cli::parse_from([
            "ezmount", "startup", "commit", "--bucket", "s3=a,b", "--only", "gdrive", "s3-a",
        ]);
        match cli.command {
            Commands::Startup(StartupCommands::Commit { buckets, only }) => {
                assert_eq!(buckets.buckets.len(), 1);
                assert_eq!(only, vec!["gdrive", "s3-a"]);
            }
            _ => panic!("expected startup commit"),
        }
    }
}
