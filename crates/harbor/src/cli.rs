//! Command-line arguments for the broker daemon.

use std::path::PathBuf;

use clap::Parser;

/// Harbor: a multi-tenant broker that gives each AI agent its own
/// persistent, sandboxed coding Assistant.
#[derive(Debug, Parser)]
#[command(name = "harbor", version, about)]
pub struct Args {
    /// Path to the settings file (default: ~/.harbor/settings.toml)
    #[arg(long, env = "HARBOR_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Override the data directory from settings
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Write a default settings file if none exists, then exit
    #[arg(long)]
    pub init: bool,

    /// Build the sandbox base image up front, then exit
    #[arg(long)]
    pub build_image: bool,
}
