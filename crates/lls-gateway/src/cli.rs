//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OpenAI-compatible server for llama.cpp binaries on older hardware
#[derive(Parser)]
#[command(name = "llama-legacy-serve")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file (toml, json or yaml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Model file to serve
    #[arg(short, long, global = true)]
    pub model: Option<PathBuf>,

    /// Directory holding llama.cpp builds
    #[arg(long, global = true)]
    pub bin_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// List discovered binaries and whether this host can run them
    Binaries,

    /// Show which binary would serve requests on this host
    Select,

    /// Estimate how many layers fit in accelerator memory
    Offload {
        /// Accelerator memory in bytes
        #[arg(long)]
        vram_bytes: u64,

        /// Model file size in bytes
        #[arg(long)]
        model_size_bytes: u64,

        /// Layer count of the model
        #[arg(long, default_value_t = 32)]
        layers: u32,

        /// Share of accelerator memory to use, 0-100
        #[arg(long, default_value_t = 90.0)]
        percent: f64,
    },

    /// Print the effective settings as JSON
    Config,
}
