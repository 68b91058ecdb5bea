// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `formicary`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "formicary",
    version,
    about = "Run job graphs on a pool of ants.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the scheduler config file (TOML).
    ///
    /// Default: `Formicary.toml` in the current working directory. A missing
    /// file means built-in defaults with a single local ant.
    #[arg(long, global = true, value_name = "PATH", default_value = "Formicary.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FORMICARY_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Parse and validate a job definition.
    Validate {
        /// Job definition (YAML).
        job: PathBuf,
    },
    /// Print the job graph as a Mermaid flowchart.
    Graph {
        job: PathBuf,
    },
    /// Run a job on the embedded local ants.
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    pub job: PathBuf,

    /// Additional job definitions that `FORK_JOB` tasks may start.
    #[arg(long = "with-job", value_name = "JOB_YAML")]
    pub with_jobs: Vec<PathBuf>,

    /// Job parameter as `name=value`. Values that parse as JSON keep their
    /// type, everything else is a string. Can be repeated.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Validate and print the graph, but don't execute any task.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{s}'")),
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
