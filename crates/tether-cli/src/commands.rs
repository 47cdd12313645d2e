//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Register with the control plane and execute tasks until stopped
    Run {
        /// Path to the agent configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,

        /// Path to the agent configuration file
        #[arg(short, long, global = true)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration with secrets masked
    Show,

    /// Check the configuration and exit non-zero if it is invalid
    Validate,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
