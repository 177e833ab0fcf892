//! Root CLI structure with global options.

use std::path::PathBuf;

use clap::Parser;

use crate::commands::Commands;

/// Command-line interface for the model runner facade.
///
/// Boots the tokenizer sidecar and the resident model runner, then drives
/// them through the same completion path the HTTP layer uses.
#[derive(Parser)]
#[command(name = "qfacade")]
#[command(about = "Drive a resident on-device model runner behind a request facade")]
#[command(version)]
pub struct Cli {
    /// Settings file (JSON); defaults are used for anything it omits
    #[arg(long, short = 'c', global = true, env = "QFACADE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}
