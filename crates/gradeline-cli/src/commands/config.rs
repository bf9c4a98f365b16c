use anyhow::Result;
use std::path::Path;

use gradeline_server::GradelineConfig;

use crate::cli::ConfigAction;

/// Handle config subcommands.
pub fn handle(action: ConfigAction, state_dir: &Path) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let path = GradelineConfig::config_path(state_dir);
            if path.exists() {
                println!("Config already exists at: {}", path.display());
                println!("Use `gradeline config show` to view it.");
                return Ok(());
            }

            let config = GradelineConfig::default();
            config.save(state_dir)?;
            println!("Created default config at: {}", path.display());
            println!();
            print_config(&config);
        }

        ConfigAction::Show => {
            let config = GradelineConfig::load(state_dir)?;
            print_config(&config);
        }
    }
    Ok(())
}

fn print_config(config: &GradelineConfig) {
    println!("Configuration:");
    println!("  listen_addr:             {}", config.listen_addr);
    println!("  submission_url:          {}", config.submission_url());
    println!("  log:                     {} ({})", config.log_level, config.log_format);
    println!(
        "  templates_dir:           {}",
        config.templates_dir.as_deref().unwrap_or("(built-in only)")
    );
    println!("  snapshot_interval_secs:  {}", config.snapshot_interval_secs);
    println!(
        "  dispatch:                {} attempts, backoff {:?}s, jitter {:.2}",
        config.dispatch.max_attempts, config.dispatch.backoff_secs, config.dispatch.jitter
    );
    println!(
        "  evaluation:              {} browser(s), {}s check timeout, judge {} ({})",
        config.evaluation.browser_concurrency,
        config.evaluation.check_timeout_secs,
        config.evaluation.judge_command,
        config.evaluation.judge_model
    );
    println!(
        "  webdriver_url:           {}",
        config.evaluation.webdriver_url.as_deref().unwrap_or("(none)")
    );
    println!(
        "  rounds:                  max {}, eligibility threshold {:.2}",
        config.rounds.max_rounds, config.rounds.eligibility_threshold
    );
}
