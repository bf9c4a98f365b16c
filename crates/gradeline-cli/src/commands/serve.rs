use anyhow::Result;
use std::path::Path;

use gradeline_server::GradelineConfig;

/// Handle the `serve` command.
pub async fn handle(config: GradelineConfig, state_dir: &Path) -> Result<()> {
    tracing::info!(state_dir = %state_dir.display(), "Starting gradeline");
    gradeline_server::serve(config, state_dir).await
}
