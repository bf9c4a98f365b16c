use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gradeline", about = "Issue, deliver and grade multi-round assignments")]
pub struct Cli {
    /// State directory (config, snapshot). Defaults to ~/.gradeline
    #[arg(long, global = true, env = "GRADELINE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline and HTTP server until Ctrl-C
    Serve,
    /// List registered templates and their rounds
    Templates,
    /// Show the task a recipient would receive
    Preview {
        /// Template id
        #[arg(long)]
        template: String,
        /// Recipient email
        #[arg(long)]
        email: String,
        /// Time bucket (%Y-%m-%d-%H). Defaults to the current UTC hour
        #[arg(long)]
        bucket: Option<String>,
        /// Round number
        #[arg(long, default_value_t = 1)]
        round: u8,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a default config file
    Init,
    /// Print the effective configuration
    Show,
}
