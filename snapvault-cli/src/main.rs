//! CLI entry point for the snapvault backup tool.
//! Provides clap-based routing for the five commands, logging setup, and
//! the error-to-exit-code mapping: 0 on success, 1 on usage errors or any
//! propagated failure. Per-file problems are counted inside the reports and
//! never fail the invocation.

mod output;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;

use snapvault_core::commands::{backup, clone, distill, purge, verify};
use snapvault_core::error::VaultError;
use snapvault_core::{BackupOptions, CloneOptions, DistillOptions, PurgeOptions, VerifyOptions};

/// Print a report as JSON (when `--json` is active) or via a terminal
/// formatter.
macro_rules! print_report {
    ($report:expr, $json:expr, $printer:path) => {
        if $json {
            println!(
                "{}",
                serde_json::to_string_pretty(&$report).expect("JSON serialization failed")
            );
        } else {
            $printer(&$report);
        }
    };
}

/// Top-level CLI definition with global flags and subcommand dispatch.
#[derive(Parser)]
#[command(
    name = "snapvault",
    about = "Content-deduplicating hard-link backup tool",
    version,
    propagate_version = true
)]
struct Cli {
    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// All available snapvault subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create a new deduplicated snapshot of the configured sources
    Backup {
        /// Sources/excludes configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Repository directory receiving the snapshot
        #[arg(value_name = "REPOSITORY")]
        repository: PathBuf,

        /// Always hash sources, never trust a matching signature alone
        #[arg(long = "always_hash")]
        always_hash: bool,

        /// Skip files whose signature already exists in the repository
        #[arg(long)]
        incremental: bool,

        /// Append _<S> to the new snapshot's directory name
        #[arg(long, value_name = "S")]
        suffix: Option<String>,
    },

    /// Check consistency of a repository or of single snapshots
    Verify {
        /// Repository directory, or one or more snapshot directories
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Re-hash every archive file and compare to the recorded hash
        #[arg(long = "verify_hash")]
        verify_hash: bool,

        /// Write a CSV file table to the working directory
        #[arg(long = "write_file_table")]
        write_file_table: bool,
    },

    /// Remove index rows whose archive file is missing
    Purge {
        /// One or more snapshot directories
        #[arg(value_name = "SNAPSHOT", required = true)]
        paths: Vec<PathBuf>,

        /// Compact each index after purging
        #[arg(long = "compact_db")]
        compact_db: bool,
    },

    /// Delete files whose content also lives in other snapshots
    Distill {
        /// One or more snapshot directories of the same repository
        #[arg(value_name = "SNAPSHOT", required = true)]
        paths: Vec<PathBuf>,

        /// Compact each index after distilling
        #[arg(long = "compact_db")]
        compact_db: bool,
    },

    /// Re-materialize a repository into another directory, preserving dedup
    Clone {
        /// Existing repository to copy
        #[arg(value_name = "SOURCE")]
        source: PathBuf,

        /// Target repository directory
        #[arg(value_name = "TARGET")]
        target: PathBuf,

        /// Re-hash every archive instead of trusting its recorded hash
        #[arg(long = "always_hash")]
        always_hash: bool,

        /// Skip files whose signature was already cloned
        #[arg(long)]
        incremental: bool,

        /// Append _<S> to every cloned snapshot's name
        #[arg(long, value_name = "S")]
        suffix: Option<String>,
    },
}

fn main() {
    // Usage problems exit 1, not clap's default 2; --help and --version
    // stay successful.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or(filter))
        .format_target(false)
        .format_timestamp(None)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

/// Dispatch the chosen subcommand.
fn run(cli: Cli) -> Result<(), VaultError> {
    let json = cli.json;

    match cli.command {
        Commands::Backup {
            config,
            repository,
            always_hash,
            incremental,
            suffix,
        } => {
            let options = BackupOptions {
                always_hash,
                incremental,
                suffix,
            };
            let report = backup::execute(&config, &repository, &options)?;
            print_report!(report, json, output::print_backup_summary);
        }

        Commands::Verify {
            paths,
            verify_hash,
            write_file_table,
        } => {
            let options = VerifyOptions {
                verify_hash,
                write_file_table,
            };
            let report = verify::execute(&paths, &options)?;
            print_report!(report, json, output::print_verify_summary);
        }

        Commands::Purge { paths, compact_db } => {
            let options = PurgeOptions { compact_db };
            let report = purge::execute(&paths, &options)?;
            print_report!(report, json, output::print_purge_summary);
        }

        Commands::Distill { paths, compact_db } => {
            let options = DistillOptions { compact_db };
            let report = distill::execute(&paths, &options)?;
            print_report!(report, json, output::print_distill_summary);
        }

        Commands::Clone {
            source,
            target,
            always_hash,
            incremental,
            suffix,
        } => {
            let options = CloneOptions {
                always_hash,
                incremental,
                suffix,
            };
            let report = clone::execute(&source, &target, &options)?;
            print_report!(report, json, output::print_clone_summary);
        }
    }

    Ok(())
}
