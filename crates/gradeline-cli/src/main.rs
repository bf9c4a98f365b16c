mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gradeline_server::GradelineConfig;
use gradeline_store::FileSnapshot;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let state_dir = cli
        .state_dir
        .unwrap_or_else(FileSnapshot::default_state_dir);
    let config = GradelineConfig::load(&state_dir)?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve => commands::serve::handle(config, &state_dir).await,
        Commands::Templates => commands::templates::handle(&config),
        Commands::Preview {
            template,
            email,
            bucket,
            round,
        } => commands::preview::handle(&config, &template, &email, bucket, round),
        Commands::Config { action } => commands::config::handle(action, &state_dir),
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &GradelineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
