// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `ducc`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ducc",
    version,
    about = "Convert container images into CVMFS repositories.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Ducc.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DUCC_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print wishes and resources, but don't convert.
    #[arg(long)]
    pub dry_run: bool,

    /// Update only the wish with this id (ids follow config order, from 1).
    #[arg(long, value_name = "ID")]
    pub wish: Option<u64>,

    /// Write the final task graph to this file in Graphviz DOT format.
    #[arg(long, value_name = "PATH")]
    pub graph: Option<PathBuf>,
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
