// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::loader::default_config_path;

/// Command-line arguments for `dynbuild`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dynbuild",
    version,
    about = "Run a task plan whose tasks discover their dependencies while running.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `DYNBUILD_CONFIG` if set, else `Dynbuild.toml` in the current
    /// working directory.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Task to build; its result is printed to stdout.
    #[arg(long, value_name = "NAME", default_value = "main")]
    pub task: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DYNBUILD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the plan, but don't run any task.
    #[arg(long)]
    pub dry_run: bool,

    /// Override `[engine].max_workers`.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_workers: Option<u64>,

    /// Build the task this many times, each on a fresh engine sharing one
    /// result cache. Runs after the first are served from the cache.
    #[arg(long, value_name = "N", default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub runs: u64,
}

impl CliArgs {
    /// The config file to load: `--config`, then `DYNBUILD_CONFIG`, then
    /// `Dynbuild.toml`.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path)
    }
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

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
